//! Default `Investigator` implementation.
//!
//! The real investigator — an LLM agent with tool-calling access to a
//! catalogue of data-source "toolsets" — is out of scope here: it is a
//! pluggable collaborator the core only ever talks to through the
//! `Investigator` trait. This module supplies a heuristic stand-in so
//! the binary is runnable end-to-end (polling, enrichment, grouping,
//! fan-out) without a real LLM wired up — the `--once` smoke-test path
//! and the integration tests in `src/tests` both exercise it. A
//! production deployment registers a real implementation here instead.
//!
//! Grounded on `services::llm::service::LLMService`'s trait shape,
//! trimmed to the two capabilities an investigation collaborator
//! actually needs: classify, and verify someone else's classification.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core::enrichment::Investigator;
use crate::core::model::{Alert, Category, Enrichment, EnrichmentStatus, EvidenceEntry};

/// Classifies alerts by `alertname`/label keywords into a root cause and
/// a `Category`. No network calls, no randomness — deterministic so
/// integration tests can assert on its output.
pub struct HeuristicInvestigator;

impl HeuristicInvestigator {
    fn classify(alert: &Alert) -> (String, Category) {
        let alertname = alert.label("alertname").unwrap_or("").to_lowercase();
        let namespace = alert.label("namespace").unwrap_or("unknown");

        if alertname.contains("oom") || alertname.contains("memory") {
            (format!("memory exhaustion in {namespace}"), Category::Infrastructure)
        } else if alertname.contains("disk") {
            (format!("disk pressure in {namespace}"), Category::Infrastructure)
        } else if alertname.contains("crash") || alertname.contains("restart") {
            (format!("{namespace} pod crashloop"), Category::Application)
        } else if alertname.contains("db") || alertname.contains("database") || alertname.contains("sql") {
            (format!("{namespace} database saturation"), Category::Database)
        } else if alertname.contains("latency") || alertname.contains("timeout") || alertname.contains("network") {
            (format!("{namespace} network degradation"), Category::Network)
        } else {
            (format!("unclassified condition in {namespace}"), Category::Unknown)
        }
    }
}

#[async_trait]
impl Investigator for HeuristicInvestigator {
    async fn investigate(&self, alert: &Alert) -> Result<Enrichment, String> {
        let started = Instant::now();
        let (root_cause, category) = Self::classify(alert);

        Ok(Enrichment {
            status: EnrichmentStatus::Ok,
            root_cause: Some(root_cause),
            category: Some(category),
            evidence: vec![EvidenceEntry {
                tool_name: "label-heuristics".to_string(),
                summary: format!("classified via alertname={:?}", alert.label("alertname")),
            }],
            latency: Some(started.elapsed().max(Duration::from_millis(1))),
            error: None,
        })
    }

    /// Accepts a proposed grouping whenever the heuristic's own
    /// classification for `alert` matches the text already proposed —
    /// the same signal a real LLM verification would approximate from
    /// label similarity.
    async fn verify_grouping(&self, alert: &Alert, proposed_root_cause: &str) -> bool {
        let (root_cause, _) = Self::classify(alert);
        root_cause == proposed_root_cause
    }
}

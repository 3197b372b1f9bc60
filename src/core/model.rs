//! Data model for the alert lifecycle core.
//!
//! Types here are process-local and rebuildable: nothing is persisted
//! across restarts (the core re-polls every Upstream on startup).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Alert status as reported by the Upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// The atomic unit ingested from an Upstream or a webhook push.
///
/// `fingerprint` is always supplied by the Upstream and never synthesized
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub fingerprint: String,
    /// Insertion-ordered as received from the Upstream.
    pub labels: IndexMap<String, String>,
    pub annotations: IndexMap<String, String>,
    pub starts_at: DateTime<Utc>,
    /// `None` while firing.
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub generator_url: Option<String>,
    pub enrichment: Option<Enrichment>,
    /// Group this alert has been admitted to, if any (C6).
    pub group_id: Option<String>,
}

impl Alert {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Enrichment lifecycle state, written exclusively by the EnrichmentQueue
/// (C5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    InProgress,
    Ok,
    Failed,
}

/// AI-derived root-cause analysis attached to an `Alert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrichment {
    pub status: EnrichmentStatus,
    /// Present iff `status == Ok`.
    pub root_cause: Option<String>,
    pub category: Option<Category>,
    pub evidence: Vec<EvidenceEntry>,
    pub latency: Option<std::time::Duration>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
}

impl Enrichment {
    pub fn pending() -> Self {
        Self {
            status: EnrichmentStatus::Pending,
            root_cause: None,
            category: None,
            evidence: Vec::new(),
            latency: None,
            error: None,
        }
    }

    pub fn in_progress() -> Self {
        Self { status: EnrichmentStatus::InProgress, ..Self::pending() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: EnrichmentStatus::Failed, error: Some(error.into()), ..Self::pending() }
    }
}

/// Finite classification set for a root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Application,
    Database,
    Infrastructure,
    Network,
    Unknown,
}

/// One step of the investigation trail: a tool invocation and a brief
/// summary of what it found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub tool_name: String,
    pub summary: String,
}

/// Transport used to reach a Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTransport {
    DirectHttp,
    Proxied,
}

/// A named Upstream endpoint (C1 input, C3 scheduling unit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub transport: SourceTransport,
}

/// A cluster of alerts sharing a root cause (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub root_cause: String,
    pub category: Option<Category>,
    /// Insertion order = join order.
    pub members: Vec<String>,
    pub rule_id: Option<String>,
}

impl Group {
    pub fn new(id: String, root_cause: String, category: Option<Category>) -> Self {
        Self { id, root_cause, category, members: Vec::new(), rule_id: None }
    }

    pub fn add_member(&mut self, fingerprint: String) {
        if !self.members.contains(&fingerprint) {
            self.members.push(fingerprint);
        }
    }

    pub fn remove_member(&mut self, fingerprint: &str) {
        self.members.retain(|m| m != fingerprint);
    }
}

/// Lifecycle state of a learned grouping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Candidate,
    Trusted,
    Retired,
}

/// Comparison operator for a predicate clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseOp {
    Equals,
    MatchesRegex,
    Prefix,
}

impl ClauseOp {
    /// Specificity weight used by the fast-path ordering.
    pub fn weight(self) -> u32 {
        match self {
            ClauseOp::Equals => 3,
            ClauseOp::Prefix => 2,
            ClauseOp::MatchesRegex => 1,
        }
    }
}

/// A single `(labelKey, op, value)` clause of a learned predicate.
///
/// Regex clauses carry a pre-compiled matcher so the hot path never
/// recompiles a pattern.
#[derive(Debug, Clone)]
pub struct PredicateClause {
    pub key: String,
    pub op: ClauseOp,
    pub value: String,
    compiled: Option<regex::Regex>,
}

impl PredicateClause {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), op: ClauseOp::Equals, value: value.into(), compiled: None }
    }

    pub fn prefix(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), op: ClauseOp::Prefix, value: value.into(), compiled: None }
    }

    pub fn regex(key: impl Into<String>, pattern: impl Into<String>) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let compiled = regex::Regex::new(&pattern)?;
        Ok(Self { key: key.into(), op: ClauseOp::MatchesRegex, value: pattern, compiled: Some(compiled) })
    }

    pub fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        let Some(actual) = labels.get(&self.key) else { return false };
        match self.op {
            ClauseOp::Equals => actual == &self.value,
            ClauseOp::Prefix => actual.starts_with(&self.value),
            ClauseOp::MatchesRegex => self
                .compiled
                .as_ref()
                .map(|re| re.is_match(actual))
                .unwrap_or(false),
        }
    }
}

/// A learned grouping predicate (conjunction of clauses).
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub clauses: Vec<PredicateClause>,
    pub root_cause: String,
    pub category: Option<Category>,
    pub verifications: u32,
    pub failures: u32,
    pub state: RuleState,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Specificity score used for most-specific-first fast-path ordering.
    pub fn specificity(&self) -> u32 {
        self.clauses.iter().map(|c| c.op.weight()).sum()
    }

    pub fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        !self.clauses.is_empty() && self.clauses.iter().all(|c| c.matches(labels))
    }
}

// Common test fakes for the cross-cutting pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::enrichment::Investigator;
use crate::core::fanout::{Destination, Format};
use crate::core::fetch::{Fetcher, Filter};
use crate::core::model::{Alert, Category, Enrichment, EnrichmentStatus, EvidenceEntry, Group, Source};
use crate::utils::TransportError;

/// Returns a fixed batch of alerts on every call, regardless of Source.
pub struct FixedFetcher(pub Vec<Alert>);

#[async_trait]
impl Fetcher for FixedFetcher {
    async fn fetch(&self, _source: &Source, _filter: &Filter) -> Result<Vec<Alert>, TransportError> {
        Ok(self.0.clone())
    }
}

/// Classifies deterministically by `alertname` without network calls,
/// so scenario tests can assert on the resulting root cause.
pub struct FakeInvestigator;

#[async_trait]
impl Investigator for FakeInvestigator {
    async fn investigate(&self, alert: &Alert) -> Result<Enrichment, String> {
        let alertname = alert.label("alertname").unwrap_or("unknown");
        Ok(Enrichment {
            status: EnrichmentStatus::Ok,
            root_cause: Some(format!("root cause for {alertname}")),
            category: Some(Category::Application),
            evidence: vec![EvidenceEntry { tool_name: "fake".to_string(), summary: "fake evidence".to_string() }],
            latency: Some(std::time::Duration::from_millis(1)),
            error: None,
        })
    }

    async fn verify_grouping(&self, _alert: &Alert, _proposed_root_cause: &str) -> bool {
        true
    }
}

/// Records every delivered `Format` for assertion; never fails.
pub struct RecordingDestination {
    pub delivered: Mutex<Vec<Format>>,
    pub calls: AtomicUsize,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self { delivered: Mutex::new(Vec::new()), calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Destination for RecordingDestination {
    fn name(&self) -> &str {
        "recording"
    }

    fn format(&self, alert: &Alert, group: Option<&Group>) -> Format {
        Format::Relay { alert: alert.clone(), group: group.cloned() }
    }

    async fn deliver(&self, format: Format) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.delivered.lock().unwrap().push(format);
        Ok(())
    }
}

//! WebhookIngress (C4) — accepts a pushed batch of alerts and reconciles
//! them into the Store through the same admission path the Poller uses.
//!
//! Grounded on `handlers::llm`'s request/response + error-mapping idiom:
//! a thin, pure-ish core method (`WebhookIngress::ingest`) that the axum
//! handler in `handlers::webhook` wraps with extractors and
//! `IntoResponse`.

use indexmap::IndexMap;
use serde::Deserialize;

use super::enrichment::{EnrichmentQueue, Priority};
use super::fetch::RawAlert;
use super::model::AlertStatus;
use super::store::{AlertStore, UpsertOutcome};
use crate::utils::BadRequestError;

/// Wire envelope for `POST /webhook` — the Alertmanager v2
/// webhook shape.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub alerts: Vec<RawAlert>,
    #[serde(rename = "groupLabels", default)]
    pub group_labels: IndexMap<String, String>,
    #[serde(rename = "commonLabels", default)]
    pub common_labels: IndexMap<String, String>,
    #[serde(rename = "commonAnnotations", default)]
    pub common_annotations: IndexMap<String, String>,
    #[serde(rename = "externalURL", default)]
    pub external_url: Option<String>,
}

/// Outcome of one accepted payload, returned to the caller for logging /
/// response bodies.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IngestSummary {
    pub created: usize,
    pub reopened: usize,
    pub dropped_missing_fingerprint: usize,
}

/// Accepts pushed alert batches and normalizes/reconciles them into the
/// Store under a synthetic `webhook:<remote-addr>` Source id.
#[derive(Clone)]
pub struct WebhookIngress {
    store: AlertStore,
    queue: EnrichmentQueue,
}

impl WebhookIngress {
    pub fn new(store: AlertStore, queue: EnrichmentQueue) -> Self {
        Self { store, queue }
    }

    /// Parses and fully reconciles one payload before returning — the
    /// HTTP response is sent only after every alert in the batch has been
    /// upserted and, where applicable, submitted for enrichment. Malformed JSON surfaces as `BadRequestError` (400, never
    /// retried); everything else completes without failing the request,
    /// per  ("no alert is ever silently dropped with
    /// user-observable data loss except FingerprintMissing").
    pub async fn ingest(&self, remote_addr: &str, body: &[u8]) -> Result<IngestSummary, BadRequestError> {
        let envelope: WebhookEnvelope = serde_json::from_slice(body)
            .map_err(|e| BadRequestError(format!("malformed webhook payload: {e}")))?;

        let source_id = format!("webhook:{remote_addr}");
        let mut summary = IngestSummary::default();

        for raw in envelope.alerts {
            match raw.into_alert() {
                Ok(alert) => {
                    let was_resolved = self
                        .store
                        .get(&alert.fingerprint)
                        .map(|prev| prev.status == AlertStatus::Resolved)
                        .unwrap_or(false);
                    let now_firing = alert.status == AlertStatus::Firing;
                    let fingerprint = alert.fingerprint.clone();

                    let outcome = self.store.upsert(alert, &source_id);
                    let should_enrich = now_firing
                        && matches!(
                            (outcome, was_resolved),
                            (UpsertOutcome::Created, _) | (UpsertOutcome::Updated, true)
                        );

                    if should_enrich {
                        self.queue.submit(fingerprint, Priority::Normal).await;
                        if outcome == UpsertOutcome::Created {
                            summary.created += 1;
                        } else {
                            summary.reopened += 1;
                        }
                    }
                },
                Err(reason) => {
                    tracing::warn!(source = %source_id, reason, "dropping webhook alert without fingerprint");
                    summary.dropped_missing_fingerprint += 1;
                },
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enrichment::Investigator;
    use crate::core::model::{Alert, Enrichment};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct NoopInvestigator;
    #[async_trait]
    impl Investigator for NoopInvestigator {
        async fn investigate(&self, _alert: &Alert) -> Result<Enrichment, String> {
            Ok(Enrichment::pending())
        }
        async fn verify_grouping(&self, _alert: &Alert, _proposed: &str) -> bool {
            true
        }
    }

    fn ingress() -> (WebhookIngress, AlertStore) {
        let store = AlertStore::new();
        let (queue, _completions) = EnrichmentQueue::spawn(
            store.clone(),
            Arc::new(NoopInvestigator),
            1,
            16,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        (WebhookIngress::new(store.clone(), queue), store)
    }

    fn payload(fingerprint: &str, status: &str) -> String {
        format!(
            r#"{{"version":"4","receiver":"default","status":"firing","alerts":[{{
                "fingerprint":"{fingerprint}",
                "labels":{{"alertname":"OOM"}},
                "annotations":{{}},
                "startsAt":"2026-01-01T00:00:00Z",
                "endsAt":null,
                "updatedAt":"2026-01-01T00:00:00Z",
                "status":{{"state":"{status}"}},
                "generatorURL":null
            }}],"groupLabels":{{}},"commonLabels":{{}},"commonAnnotations":{{}}}}"#
        )
    }

    #[tokio::test]
    async fn well_formed_batch_is_upserted_and_enriched() {
        let (ingress, store) = ingress();
        let summary = ingress.ingest("10.0.0.1", payload("wh1", "firing").as_bytes()).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.dropped_missing_fingerprint, 0);
        assert!(store.has_seen("webhook:10.0.0.1", "wh1"));
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (ingress, _store) = ingress();
        let result = ingress.ingest("10.0.0.1", b"{not json").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_fingerprint_is_dropped_not_rejected() {
        let (ingress, _store) = ingress();
        let body = br#"{"alerts":[{"labels":{},"annotations":{},"startsAt":"2026-01-01T00:00:00Z","endsAt":null,"updatedAt":"2026-01-01T00:00:00Z","status":{"state":"firing"},"generatorURL":null}]}"#;
        let summary = ingress.ingest("10.0.0.1", body).await.unwrap();
        assert_eq!(summary.dropped_missing_fingerprint, 1);
    }

    #[tokio::test]
    async fn resolved_then_refired_reenriches() {
        let (ingress, _store) = ingress();
        ingress.ingest("10.0.0.1", payload("wh2", "firing").as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let summary = ingress.ingest("10.0.0.1", payload("wh2", "resolved").as_bytes()).await.unwrap();
        assert_eq!(summary.created, 0);
        assert_eq!(summary.reopened, 0);

        let summary = ingress.ingest("10.0.0.1", payload("wh2", "firing").as_bytes()).await.unwrap();
        assert_eq!(summary.reopened, 1);
    }
}

//! EnrichmentQueue (C5) — bounded work queue with an N-worker pool
//! enforcing at-most-one in-flight enrichment per fingerprint.
//!
//! Grounded on `LLMServiceImpl::analyze`'s session lifecycle (pending →
//! processing → completed/failed, one row per request) — generalized
//! here from "one LLM call" to "a bounded pool of workers draining a
//! priority queue".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::{Alert, Enrichment, EnrichmentStatus};
use super::store::AlertStore;

/// Admission priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

/// External investigation capability. Out of scope for
/// this core; the actual implementation (LLM + tool calling) lives
/// elsewhere and is supplied at wiring time.
#[async_trait]
pub trait Investigator: Send + Sync {
    async fn investigate(&self, alert: &Alert) -> Result<Enrichment, String>;

    /// Used by the Grouper (C6) to validate candidate-rule admissions and
    /// to assign fresh groups on the slow path.
    async fn verify_grouping(&self, alert: &Alert, proposed_root_cause: &str) -> bool;
}

struct QueueItem {
    fingerprint: String,
}

/// Completion event published after a worker finishes processing one
/// fingerprint, consumed by the Grouper (C6). Carries no payload beyond
/// the fingerprint — the Grouper re-reads the enriched alert from the
/// Store (O2: events arrive in the order C5 publishes them).
#[derive(Debug, Clone)]
pub struct EnrichmentCompleted {
    pub fingerprint: String,
}

/// Bounded two-lane queue (high/normal) with a worker pool. Workers drain
/// the high lane before the normal lane within a ready batch, FIFO within
/// a lane.
#[derive(Clone)]
pub struct EnrichmentQueue {
    high: mpsc::Sender<QueueItem>,
    normal: mpsc::Sender<QueueItem>,
    /// Fingerprints that are queued OR currently being processed —
    /// governs admission. A strict subset, `in_flight`, governs
    /// the at-most-one-concurrent-investigation invariant.
    admitted: Arc<DashSet<String>>,
    in_flight: Arc<DashSet<String>>,
}

impl EnrichmentQueue {
    /// Spawns `workers` worker tasks and returns the queue handle plus the
    /// receiving end of the completion channel consumed by the Grouper.
    pub fn spawn(
        store: AlertStore,
        investigator: Arc<dyn Investigator>,
        workers: usize,
        capacity: usize,
        per_task_timeout: Duration,
        cancellation: CancellationToken,
    ) -> (Self, mpsc::Receiver<EnrichmentCompleted>) {
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        let (completions_tx, completions_rx) = mpsc::channel(capacity);
        let in_flight: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let admitted: Arc<DashSet<String>> = Arc::new(DashSet::new());

        let high_rx = Arc::new(tokio::sync::Mutex::new(high_rx));
        let normal_rx = Arc::new(tokio::sync::Mutex::new(normal_rx));
        for worker_id in 0..workers {
            let high_rx = Arc::clone(&high_rx);
            let normal_rx = Arc::clone(&normal_rx);
            let store = store.clone();
            let investigator = Arc::clone(&investigator);
            let in_flight = Arc::clone(&in_flight);
            let admitted = Arc::clone(&admitted);
            let completions_tx = completions_tx.clone();
            let cancellation = cancellation.clone();

            tokio::spawn(async move {
                worker_loop(
                    worker_id,
                    high_rx,
                    normal_rx,
                    store,
                    investigator,
                    in_flight,
                    admitted,
                    completions_tx,
                    per_task_timeout,
                    cancellation,
                )
                .await;
            });
        }

        (Self { high: high_tx, normal: normal_tx, admitted, in_flight }, completions_rx)
    }

    /// Admit a fingerprint. Noop if already in-flight or queued. Blocks the caller when the queue is at capacity, applying
    /// natural backpressure to the Poller/WebhookIngress.
    pub async fn submit(&self, fingerprint: String, priority: Priority) {
        if !self.admitted.insert(fingerprint.clone()) {
            tracing::debug!(fingerprint, "enrichment already queued or in-flight, skipping submit");
            return;
        }
        let lane = match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        };
        if lane.send(QueueItem { fingerprint: fingerprint.clone() }).await.is_err() {
            tracing::warn!("enrichment queue closed, dropping submission");
            self.admitted.remove(&fingerprint);
        }
    }

    pub fn is_in_flight(&self, fingerprint: &str) -> bool {
        self.in_flight.contains(fingerprint)
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    high_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    normal_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    store: AlertStore,
    investigator: Arc<dyn Investigator>,
    in_flight: Arc<DashSet<String>>,
    admitted: Arc<DashSet<String>>,
    completions: mpsc::Sender<EnrichmentCompleted>,
    per_task_timeout: Duration,
    cancellation: CancellationToken,
) {
    loop {
        // Try the high lane first without blocking so a burst of normal
        // items already queued never delays a High submission that lands
        // while we're mid-loop; fall back to a fair select across both
        // lanes (plus cancellation) when high is empty.
        let item = {
            let mut high = high_rx.lock().await;
            match high.try_recv() {
                Ok(item) => Some(item),
                Err(mpsc::error::TryRecvError::Empty) => {
                    drop(high);
                    let mut high = high_rx.lock().await;
                    let mut normal = normal_rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => None,
                        item = high.recv() => item,
                        item = normal.recv() => item,
                    }
                },
                Err(mpsc::error::TryRecvError::Disconnected) => None,
            }
        };

        let Some(item) = item else {
            tracing::info!(worker_id, "enrichment worker shutting down");
            return;
        };

        process_one(worker_id, &item.fingerprint, &store, &investigator, &in_flight, per_task_timeout, &cancellation)
            .await;

        admitted.remove(&item.fingerprint);
        let _ = completions.send(EnrichmentCompleted { fingerprint: item.fingerprint }).await;
    }
}

async fn process_one(
    worker_id: usize,
    fingerprint: &str,
    store: &AlertStore,
    investigator: &Arc<dyn Investigator>,
    in_flight: &DashSet<String>,
    timeout: Duration,
    cancellation: &CancellationToken,
) {
    in_flight.insert(fingerprint.to_string());

    let Some(alert) = store.get(fingerprint) else {
        tracing::debug!(worker_id, fingerprint, "alert absent at dequeue, aborting enrichment");
        in_flight.remove(fingerprint);
        return;
    };

    store.update(fingerprint, |a| a.enrichment = Some(Enrichment::in_progress()));

    let investigate = investigator.investigate(&alert);
    let outcome = tokio::select! {
        _ = cancellation.cancelled() => {
            tracing::info!(worker_id, fingerprint, "cancellation observed, discarding partial enrichment");
            store.update(fingerprint, |a| a.enrichment = Some(Enrichment::pending()));
            in_flight.remove(fingerprint);
            return;
        }
        result = tokio::time::timeout(timeout, investigate) => result,
    };

    match outcome {
        Ok(Ok(enrichment)) => {
            store.update(fingerprint, |a| a.enrichment = Some(enrichment));
        },
        Ok(Err(reason)) => {
            tracing::warn!(worker_id, fingerprint, reason, "investigator failure");
            store.update(fingerprint, |a| a.enrichment = Some(Enrichment::failed(reason)));
        },
        Err(_elapsed) => {
            tracing::warn!(worker_id, fingerprint, "investigator timed out");
            store.update(fingerprint, |a| {
                a.enrichment = Some(Enrichment::failed(format!("timed out after {timeout:?}")))
            });
        },
    }

    in_flight.remove(fingerprint);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Alert, AlertStatus};
    use chrono::Utc;
    use indexmap::IndexMap;

    struct FixedInvestigator {
        root_cause: String,
    }

    #[async_trait]
    impl Investigator for FixedInvestigator {
        async fn investigate(&self, _alert: &Alert) -> Result<Enrichment, String> {
            Ok(Enrichment {
                status: EnrichmentStatus::Ok,
                root_cause: Some(self.root_cause.clone()),
                category: Some(super::super::model::Category::Application),
                evidence: vec![],
                latency: Some(Duration::from_millis(1)),
                error: None,
            })
        }

        async fn verify_grouping(&self, _alert: &Alert, _proposed: &str) -> bool {
            true
        }
    }

    fn alert(fp: &str) -> Alert {
        Alert {
            fingerprint: fp.to_string(),
            labels: IndexMap::new(),
            annotations: IndexMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            updated_at: Utc::now(),
            status: AlertStatus::Firing,
            generator_url: None,
            enrichment: None,
            group_id: None,
        }
    }

    #[tokio::test]
    async fn submit_enriches_and_publishes_completion() {
        let store = AlertStore::new();
        store.upsert(alert("a1"), "u1");

        let investigator = Arc::new(FixedInvestigator { root_cause: "memory exhaustion".to_string() });
        let cancellation = CancellationToken::new();
        let (queue, mut completions) =
            EnrichmentQueue::spawn(store.clone(), investigator, 2, 16, Duration::from_secs(1), cancellation);

        queue.submit("a1".to_string(), Priority::Normal).await;

        let completed = completions.recv().await.unwrap();
        assert_eq!(completed.fingerprint, "a1");

        let stored = store.get("a1").unwrap();
        let enrichment = stored.enrichment.unwrap();
        assert_eq!(enrichment.status, EnrichmentStatus::Ok);
        assert_eq!(enrichment.root_cause.as_deref(), Some("memory exhaustion"));
    }

    #[tokio::test]
    async fn double_submit_while_in_flight_is_noop() {
        struct SlowInvestigator;
        #[async_trait]
        impl Investigator for SlowInvestigator {
            async fn investigate(&self, _alert: &Alert) -> Result<Enrichment, String> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Enrichment::pending())
            }
            async fn verify_grouping(&self, _alert: &Alert, _proposed: &str) -> bool {
                true
            }
        }

        let store = AlertStore::new();
        store.upsert(alert("a1"), "u1");
        let investigator = Arc::new(SlowInvestigator);
        let cancellation = CancellationToken::new();
        let (queue, _completions) =
            EnrichmentQueue::spawn(store.clone(), investigator, 1, 16, Duration::from_secs(5), cancellation);

        queue.submit("a1".to_string(), Priority::Normal).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.is_in_flight("a1"));
        // Second submit while in-flight must be a no-op, not a second
        // worker invocation — we only assert it doesn't panic/deadlock and
        // the in-flight set still contains exactly one entry logically.
        queue.submit("a1".to_string(), Priority::Normal).await;
    }
}

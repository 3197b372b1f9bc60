//! Poller (C3) — runs one `ScheduledTask` per configured Source,
//! reconciling Fetcher results into the Store and submitting newly
//! firing alerts for enrichment.
//!
//! Grounded on `utils::scheduled_executor::ScheduledExecutor` (the
//! background-refresh mechanism `services::baseline_refresh_task` uses)
//! as the tick source, driven at a fixed short resolution; each
//! `PollTask` owns its *effective* cadence (`pollInterval` while
//! healthy, the doubling backoff while a Source is failing) and decides
//! per tick whether it is actually due — the generic executor has no
//! notion of a dynamic interval, and the per-Source backoff genuinely
//! needs one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::enrichment::{EnrichmentQueue, Priority};
use super::fetch::{Fetcher, Filter};
use super::model::{AlertStatus, Source};
use super::store::{AlertStore, UpsertOutcome};
use crate::utils::{ScheduledExecutor, ScheduledTask};

/// The executor tick resolution used to drive every `PollTask`. Kept well
/// below the minimum sensible `pollInterval`/backoff so a Source's
/// self-governed due time is honored promptly.
const SCHEDULER_RESOLUTION: Duration = Duration::from_millis(500);

/// Backoff parameters for a single Source's poll loop.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(300) }
    }
}

/// One polling cycle against one Source.
///
/// Reconciles every returned alert through `AlertStore::upsert`. Only a
/// transition into Firing (Created, or Updated from a prior Resolved)
/// is submitted for enrichment — a firing alert that merely gained new
/// labels, and any transition into Resolved, must not re-trigger
/// investigation.
pub struct PollTask {
    source: Source,
    fetcher: Arc<dyn Fetcher>,
    store: AlertStore,
    queue: EnrichmentQueue,
    filter: Filter,
    poll_interval: Duration,
    backoff: BackoffConfig,
    current_backoff_ms: AtomicU64,
    /// Millis since `start`, below which `run` is a no-op. Lets a single
    /// Source poll at its own cadence while sharing one executor tick.
    due_in_ms: AtomicU64,
    start: Instant,
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl PollTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Source,
        fetcher: Arc<dyn Fetcher>,
        store: AlertStore,
        queue: EnrichmentQueue,
        filter: Filter,
        poll_interval: Duration,
        backoff: BackoffConfig,
        ready: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        let initial_ms = backoff.initial.as_millis() as u64;
        Self {
            source,
            fetcher,
            store,
            queue,
            filter,
            poll_interval,
            backoff,
            current_backoff_ms: AtomicU64::new(initial_ms),
            due_in_ms: AtomicU64::new(0),
            start: Instant::now(),
            ready,
        }
    }

    async fn reconcile_once(&self) {
        match self.fetcher.fetch(&self.source, &self.filter).await {
            Ok(alerts) => {
                self.current_backoff_ms.store(self.backoff.initial.as_millis() as u64, Ordering::SeqCst);
                for alert in alerts {
                    let was_resolved = self
                        .store
                        .get(&alert.fingerprint)
                        .map(|prev| prev.status == AlertStatus::Resolved)
                        .unwrap_or(false);
                    let now_firing = alert.status == AlertStatus::Firing;
                    let fingerprint = alert.fingerprint.clone();

                    let outcome = self.store.upsert(alert, &self.source.id);
                    let should_enrich = now_firing
                        && matches!(
                            (outcome, was_resolved),
                            (UpsertOutcome::Created, _) | (UpsertOutcome::Updated, true)
                        );

                    if should_enrich {
                        self.queue.submit(fingerprint, Priority::Normal).await;
                    }
                }
                self.ready.store(true, Ordering::SeqCst);
                self.reschedule(self.poll_interval);
            },
            Err(err) => {
                let backoff_ms = self.current_backoff_ms.load(Ordering::SeqCst);
                tracing::warn!(
                    source = %self.source.id,
                    error = %err,
                    next_backoff_ms = backoff_ms,
                    "poll cycle failed, backing off"
                );
                self.reschedule(Duration::from_millis(backoff_ms));
                let next = (backoff_ms * 2).min(self.backoff.max.as_millis() as u64);
                self.current_backoff_ms.store(next, Ordering::SeqCst);
            },
        }
    }

    fn reschedule(&self, after: Duration) {
        let due_ms = self.start.elapsed().as_millis() as u64 + after.as_millis() as u64;
        self.due_in_ms.store(due_ms, Ordering::SeqCst);
    }

    fn is_due(&self) -> bool {
        self.start.elapsed().as_millis() as u64 >= self.due_in_ms.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduledTask for PollTask {
    async fn run(&self) {
        if self.is_due() {
            self.reconcile_once().await;
        }
    }
}

/// Spawns one self-paced `PollTask` per Source, each driven by its own
/// `ScheduledExecutor` at `SCHEDULER_RESOLUTION`, and tracks whether every
/// configured Source has completed at least one reconciliation (consumed
/// by the `/ready` endpoint).
#[derive(Clone)]
pub struct Poller {
    fetcher: Arc<dyn Fetcher>,
    store: AlertStore,
    queue: EnrichmentQueue,
    filter: Filter,
    poll_interval: Duration,
    backoff: BackoffConfig,
}

impl Poller {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: AlertStore,
        queue: EnrichmentQueue,
        filter: Filter,
        poll_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self { fetcher, store, queue, filter, poll_interval, backoff }
    }

    /// Spawns one task per Source; each runs until `cancellation` fires.
    pub fn spawn(&self, sources: Vec<Source>, cancellation: CancellationToken) -> PollerHandle {
        let mut ready_flags = Vec::with_capacity(sources.len());
        for source in sources {
            let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
            ready_flags.push(ready.clone());

            let task = PollTask::new(
                source.clone(),
                Arc::clone(&self.fetcher),
                self.store.clone(),
                self.queue.clone(),
                self.filter.clone(),
                self.poll_interval,
                self.backoff,
                ready,
            );
            let executor = ScheduledExecutor::new(format!("poll:{}", source.id), SCHEDULER_RESOLUTION);
            let cancellation = cancellation.clone();
            tokio::spawn(async move { executor.start(task, cancellation).await });
        }
        PollerHandle { ready_flags }
    }
}

/// Handle returned by `Poller::spawn`. Used only to answer "has every
/// Source completed its first reconciliation" for readiness reporting.
#[derive(Clone)]
pub struct PollerHandle {
    ready_flags: Vec<Arc<std::sync::atomic::AtomicBool>>,
}

impl PollerHandle {
    pub fn all_ready(&self) -> bool {
        self.ready_flags.iter().all(|f| f.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{AlertStatus, SourceTransport};
    use async_trait::async_trait;
    use chrono::Utc;
    use indexmap::IndexMap;
    use std::sync::atomic::AtomicBool;
    use tokio_util::sync::CancellationToken;

    fn source() -> Source {
        Source { id: "u1".to_string(), url: "http://upstream".to_string(), transport: SourceTransport::DirectHttp }
    }

    fn alert(fp: &str, status: AlertStatus) -> super::super::model::Alert {
        super::super::model::Alert {
            fingerprint: fp.to_string(),
            labels: IndexMap::new(),
            annotations: IndexMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            updated_at: Utc::now(),
            status,
            generator_url: None,
            enrichment: None,
            group_id: None,
        }
    }

    struct FixedFetcher(Vec<super::super::model::Alert>);
    #[async_trait]
    impl Fetcher for FixedFetcher {
        async fn fetch(
            &self,
            _source: &Source,
            _filter: &Filter,
        ) -> Result<Vec<super::super::model::Alert>, crate::utils::TransportError> {
            Ok(self.0.clone())
        }
    }

    struct NoopInvestigator;
    #[async_trait]
    impl super::super::enrichment::Investigator for NoopInvestigator {
        async fn investigate(
            &self,
            _alert: &super::super::model::Alert,
        ) -> Result<super::super::model::Enrichment, String> {
            Ok(super::super::model::Enrichment::pending())
        }
        async fn verify_grouping(&self, _alert: &super::super::model::Alert, _proposed: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn newly_firing_alert_is_submitted_for_enrichment() {
        let store = AlertStore::new();
        let fetcher: Arc<dyn Fetcher> = Arc::new(FixedFetcher(vec![alert("a1", AlertStatus::Firing)]));
        let (queue, _completions) = EnrichmentQueue::spawn(
            store.clone(),
            Arc::new(NoopInvestigator),
            1,
            16,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let ready = Arc::new(AtomicBool::new(false));
        let task = PollTask::new(
            source(),
            fetcher,
            store.clone(),
            queue.clone(),
            Filter::default(),
            Duration::from_secs(30),
            BackoffConfig::default(),
            ready.clone(),
        );

        task.reconcile_once().await;

        assert!(ready.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("a1").unwrap().enrichment.is_some());
    }

    #[tokio::test]
    async fn transition_to_resolved_does_not_enrich() {
        let store = AlertStore::new();
        store.upsert(alert("a1", AlertStatus::Firing), "u1");
        let fetcher: Arc<dyn Fetcher> = Arc::new(FixedFetcher(vec![alert("a1", AlertStatus::Resolved)]));
        let (queue, _completions) = EnrichmentQueue::spawn(
            store.clone(),
            Arc::new(NoopInvestigator),
            1,
            16,
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let ready = Arc::new(AtomicBool::new(false));
        let task = PollTask::new(
            source(),
            fetcher,
            store.clone(),
            queue.clone(),
            Filter::default(),
            Duration::from_secs(30),
            BackoffConfig::default(),
            ready,
        );

        task.reconcile_once().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("a1").unwrap().enrichment.is_none());
    }
}

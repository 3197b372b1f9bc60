//! DestinationFanout (C7) — delivers grouped, enriched alerts to one or
//! more destinations with independent retry and backoff per destination.
//!
//! Grounded on `utils::scheduled_executor::ScheduledExecutor` for the
//! retry-worker loop shape, and on `services::llm::scenarios::merger`
//! for the idea of a stateless formatting step ahead of delivery.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::model::{Alert, Group};
use crate::utils::TransportError;

/// Output shape a `Destination` renders to before delivery.
#[derive(Debug, Clone)]
pub enum Format {
    /// A single human-readable chat message (e.g. for a chatops channel).
    Chat { text: String },
    /// The raw alert/group payload forwarded to a downstream relay,
    /// unmodified beyond envelope framing.
    Relay { alert: Alert, group: Option<Group> },
}

/// Outcome of a single `Destination::deliver` attempt.
///
/// A `Permanent` failure (a 4xx response: bad payload, auth, not-found)
/// will never succeed on retry, so `deliver_with_retry` gives up
/// immediately instead of burning the backoff budget. A `Transient`
/// failure (a 5xx response, or the request never reaching the peer)
/// is retried per `RetryConfig`.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(TransportError),
    #[error("permanent delivery failure: {0}")]
    Permanent(TransportError),
}

impl DeliveryError {
    fn reason(&self) -> String {
        match self {
            DeliveryError::Transient(e) => e.0.clone(),
            DeliveryError::Permanent(e) => e.0.clone(),
        }
    }
}

/// A delivery target for enriched, grouped alerts.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// Render the outgoing payload. Pure and infallible — delivery
    /// failures belong to `deliver`, not `format`.
    fn format(&self, alert: &Alert, group: Option<&Group>) -> Format;

    async fn deliver(&self, format: Format) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { initial_backoff: Duration::from_secs(1), max_backoff: Duration::from_secs(60), max_attempts: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub attempt: u32,
    pub reason: String,
}

/// One delivery request routed to a single destination's worker.
struct DeliveryJob {
    alert: Alert,
    group: Option<Group>,
}

/// A running worker for one `Destination`: owns a bounded job queue, a
/// retry loop with exponential backoff, and a fixed-size ring buffer of
/// recent failures for observability.
pub struct DestinationWorker {
    name: String,
    sender: mpsc::Sender<DeliveryJob>,
    failures: Arc<Mutex<VecDeque<FailureRecord>>>,
}

const FAILURE_RING_SIZE: usize = 100;

impl DestinationWorker {
    pub fn spawn(
        destination: Arc<dyn Destination>,
        capacity: usize,
        retry: RetryConfig,
        cancellation: CancellationToken,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<DeliveryJob>(capacity);
        let failures = Arc::new(Mutex::new(VecDeque::with_capacity(FAILURE_RING_SIZE)));
        let name = destination.name().to_string();

        let worker_failures = Arc::clone(&failures);
        let worker_name = name.clone();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancellation.cancelled() => None,
                    job = receiver.recv() => job,
                };
                let Some(job) = job else {
                    tracing::info!(destination = %worker_name, "fanout worker shutting down");
                    return;
                };

                deliver_with_retry(&destination, job, retry, &worker_failures, &worker_name, &cancellation).await;
            }
        });

        Self { name, sender, failures }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a delivery. Blocks the caller under backpressure rather
    /// than dropping.
    pub async fn submit(&self, alert: Alert, group: Option<Group>) {
        if self.sender.send(DeliveryJob { alert, group }).await.is_err() {
            tracing::warn!(destination = %self.name, "fanout queue closed, dropping delivery");
        }
    }

    pub async fn recent_failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().await.iter().cloned().collect()
    }
}

async fn deliver_with_retry(
    destination: &Arc<dyn Destination>,
    job: DeliveryJob,
    retry: RetryConfig,
    failures: &Arc<Mutex<VecDeque<FailureRecord>>>,
    name: &str,
    cancellation: &CancellationToken,
) {
    let format = destination.format(&job.alert, job.group.as_ref());
    let mut backoff = retry.initial_backoff;

    for attempt in 1..=retry.max_attempts {
        match destination.deliver(format.clone()).await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(destination = name, attempt, "delivery succeeded after retry");
                }
                return;
            },
            Err(DeliveryError::Permanent(err)) => {
                tracing::warn!(destination = name, attempt, error = %err, "permanent delivery failure, not retrying");
                record_failure(failures, attempt, err.0).await;
                return;
            },
            Err(err @ DeliveryError::Transient(_)) => {
                tracing::warn!(destination = name, attempt, error = %err, "delivery attempt failed");
                record_failure(failures, attempt, err.reason()).await;

                if attempt == retry.max_attempts {
                    tracing::error!(destination = name, attempts = attempt, "delivery exhausted retries, giving up");
                    return;
                }

                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {},
                }
                backoff = (backoff * 2).min(retry.max_backoff);
            },
        }
    }
}

async fn record_failure(failures: &Arc<Mutex<VecDeque<FailureRecord>>>, attempt: u32, reason: String) {
    let mut ring = failures.lock().await;
    if ring.len() == FAILURE_RING_SIZE {
        ring.pop_front();
    }
    ring.push_back(FailureRecord { attempt, reason });
}

impl Clone for Format {
    fn clone(&self) -> Self {
        match self {
            Format::Chat { text } => Format::Chat { text: text.clone() },
            Format::Relay { alert, group } => Format::Relay { alert: alert.clone(), group: group.clone() },
        }
    }
}

/// Pure formatting helper shared by chat-shaped destinations: a one-line
/// summary suitable for a chatops channel.
pub fn format_chat_summary(alert: &Alert, group: Option<&Group>) -> String {
    let root_cause = group.map(|g| g.root_cause.as_str()).unwrap_or("unclassified");
    let alertname = alert.label("alertname").unwrap_or("unknown");
    format!("[{:?}] {} — {} (fingerprint {})", alert.status, alertname, root_cause, alert.fingerprint)
}

//! Scheduled executor for periodic tasks — one instance per Poller Source
//! (C3), and reused as the generic "run this on an interval" primitive
//! anywhere else the core needs one.
//!
//! Inspired by the `ScheduledExecutor`/`baseline_refresh_task` pair this
//! crate's ambient tooling descends from; rewired onto `async_trait`
//! (matching every other component trait in this crate) and a
//! `CancellationToken` instead of a polled `AtomicBool`, since the
//! hierarchical shutdown propagation this crate relies on genuinely
//! needs parent→child fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A task run repeatedly on a fixed interval by a `ScheduledExecutor`.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    async fn run(&self);
}

#[async_trait]
impl<T: ScheduledTask + ?Sized> ScheduledTask for Arc<T> {
    async fn run(&self) {
        (**self).run().await;
    }
}

/// Drives a `ScheduledTask` on a fixed cadence until cancelled.
///
/// The first tick fires immediately (consistent with `tokio::time::interval`
/// defaults) so a freshly started Poller does not sit idle for a full
/// `pollInterval` before its first reconciliation.
pub struct ScheduledExecutor {
    task_name: String,
    interval: Duration,
}

impl ScheduledExecutor {
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval }
    }

    /// Runs `task` until `cancellation` fires. A task already in progress
    /// is allowed to finish before the cancellation is observed — Pollers
    /// exit at the next tick boundary, not mid-reconciliation.
    pub async fn start<T: ScheduledTask>(self, task: T, cancellation: CancellationToken) {
        tracing::info!(task = %self.task_name, interval = ?self.interval, "scheduled task starting");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    tracing::info!(task = %self.task_name, "scheduled task shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    task.run().await;
                }
            }
        }
    }
}

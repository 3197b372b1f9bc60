//! Alert proxy core library.
//!
//! Ingests firing alerts from Alertmanager-like Upstreams, attaches
//! AI-derived root-cause enrichment, groups alerts by root cause, and
//! forwards enriched/grouped alerts to configured destinations.

pub mod config;
pub mod core;
pub mod handlers;
pub mod services;
#[cfg(test)]
mod tests;
pub mod utils;

pub use config::Config;

use std::sync::Arc;

use core::enrichment::EnrichmentQueue;
use core::poller::PollerHandle;
use core::store::AlertStore;
use core::webhook::WebhookIngress;

/// Shared application state, handed to every axum handler via
/// `State<Arc<AppState>>`.
///
/// Design Philosophy: Keep it simple — Rust's type system IS our DI
/// container. All services are wrapped in `Arc`/cheap-`Clone` for thread
/// safety.
#[derive(Clone)]
pub struct AppState {
    pub store: AlertStore,
    pub queue: EnrichmentQueue,
    pub webhook: WebhookIngress,
    pub poller: PollerHandle,
}

impl AppState {
    pub fn new(store: AlertStore, queue: EnrichmentQueue, webhook: WebhookIngress, poller: PollerHandle) -> Arc<Self> {
        Arc::new(Self { store, queue, webhook, poller })
    }
}

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use stellar_alertd::config::{Config, DestinationKind};
use stellar_alertd::core::enrichment::EnrichmentQueue;
use stellar_alertd::core::fanout::{DestinationWorker, Destination, RetryConfig};
use stellar_alertd::core::fetch::{Filter, HttpFetcher};
use stellar_alertd::core::grouper::{Grouper, GrouperConfig};
use stellar_alertd::core::model::Source;
use stellar_alertd::core::poller::{BackoffConfig, Poller};
use stellar_alertd::core::store::AlertStore;
use stellar_alertd::core::webhook::WebhookIngress;
use stellar_alertd::handlers;
use stellar_alertd::services::{ChatDestination, HeuristicInvestigator, RelayDestination};
use stellar_alertd::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config, cli_args) = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("stellar-alertd.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        // _guard is intentionally leaked for the lifetime of main: dropping it
        // would stop flushing the non-blocking writer before shutdown.
        std::mem::forget(_guard);
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("stellar-alertd starting up");
    tracing::info!(sources = config.sources.len(), destinations = config.fanout.destinations.len(), "configuration loaded");

    let store = AlertStore::new();
    let fetcher: Arc<dyn stellar_alertd::core::fetch::Fetcher> =
        Arc::new(HttpFetcher::new(Duration::from_secs(config.fetch.timeout_secs)));
    let investigator: Arc<dyn stellar_alertd::core::enrichment::Investigator> = Arc::new(HeuristicInvestigator);

    let cancellation = CancellationToken::new();

    let (queue, completions) = EnrichmentQueue::spawn(
        store.clone(),
        Arc::clone(&investigator),
        config.enrichment.workers,
        config.enrichment.queue_capacity,
        Duration::from_secs(config.enrichment.timeout_secs),
        cancellation.clone(),
    );

    let destination_workers = build_destination_workers(&config, cancellation.clone());

    let (grouped_tx, mut grouped_rx) = tokio::sync::mpsc::channel::<String>(config.enrichment.queue_capacity);
    let grouper = Arc::new(Grouper::with_fanout_notifier(
        store.clone(),
        Arc::clone(&investigator),
        GrouperConfig { verify_first_n: config.grouping.verify_first_n },
        grouped_tx,
    ));
    tokio::spawn(Arc::clone(&grouper).run(completions));

    let fanout_store = store.clone();
    let fanout_grouper = Arc::clone(&grouper);
    let fanout_workers = destination_workers.clone();
    tokio::spawn(async move {
        while let Some(fingerprint) = grouped_rx.recv().await {
            dispatch_to_destinations(&fanout_store, &fanout_grouper, &fanout_workers, &fingerprint).await;
        }
        tracing::info!("fanout dispatch loop stopped: grouping notification channel closed");
    });

    let sources: Vec<Source> = config
        .sources
        .iter()
        .map(|s| Source { id: s.id.clone(), url: s.url.clone(), transport: s.transport })
        .collect();

    let filter = Filter { only_firing: false, max_alerts: Some(config.fetch.max_alerts_per_source), ..Filter::default() };
    let poller = Poller::new(
        Arc::clone(&fetcher),
        store.clone(),
        queue.clone(),
        filter,
        Duration::from_secs(config.poll.interval_secs),
        BackoffConfig { initial: Duration::from_secs(config.poll.backoff_initial_secs), max: Duration::from_secs(config.poll.backoff_max_secs) },
    );

    if cli_args.once {
        tracing::info!("--once: running a single poll/enrich/group/fanout pass then exiting");
        run_once(&fetcher, &store, &queue, &sources).await;
        return Ok(());
    }

    let poller_handle = poller.spawn(sources, cancellation.clone());

    let webhook = WebhookIngress::new(store.clone(), queue.clone());
    let app_state = AppState::new(store.clone(), queue.clone(), webhook, poller_handle);

    let app = Router::new()
        .route("/webhook", post(handlers::webhook::receive))
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("stellar-alertd listening on http://{}", addr);

    let shutdown_cancellation = cancellation.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_cancellation))
        .await?;

    tracing::info!(grace_secs = config.shutdown.grace_secs, "shutting down, waiting for in-flight work to drain");
    cancellation.cancel();
    tokio::time::sleep(Duration::from_secs(config.shutdown.grace_secs)).await;

    Ok(())
}

/// Resolves once an interrupt/terminate signal arrives, cancelling
/// `cancellation` so every background task starts winding down while axum
/// drains in-flight HTTP requests.
async fn shutdown_signal(cancellation: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    cancellation.cancel();
}

fn build_destination_workers(
    config: &Config,
    cancellation: CancellationToken,
) -> Arc<Vec<DestinationWorker>> {
    let retry = RetryConfig {
        initial_backoff: Duration::from_secs(config.fanout.backoff_initial_secs),
        max_backoff: Duration::from_secs(config.fanout.backoff_max_secs),
        max_attempts: config.fanout.max_attempts,
    };

    let workers = config
        .fanout
        .destinations
        .iter()
        .map(|d| {
            let destination: Arc<dyn Destination> = match d.kind {
                DestinationKind::Chat => {
                    Arc::new(ChatDestination::new(d.name.clone(), d.endpoint.clone(), Duration::from_secs(10)))
                },
                DestinationKind::Relay => {
                    Arc::new(RelayDestination::new(d.name.clone(), d.endpoint.clone(), Duration::from_secs(10)))
                },
            };
            DestinationWorker::spawn(destination, config.fanout.queue_capacity, retry, cancellation.clone())
        })
        .collect();

    Arc::new(workers)
}

/// Fans a just-grouped alert out to every configured destination.
async fn dispatch_to_destinations(
    store: &AlertStore,
    grouper: &Arc<Grouper>,
    workers: &Arc<Vec<DestinationWorker>>,
    fingerprint: &str,
) {
    let Some(alert) = store.get(fingerprint) else { return };
    let group = match &alert.group_id {
        Some(group_id) => grouper.groups_snapshot().await.into_iter().find(|g| &g.id == group_id),
        None => None,
    };

    for worker in workers.iter() {
        worker.submit(alert.clone(), group.clone()).await;
    }
}

/// `--once`: fetch every configured Source exactly once, enrich and group
/// synchronously, fan out, then return — a smoke-test / cron-friendly path
/// rather than a long-running server.
async fn run_once(
    fetcher: &Arc<dyn stellar_alertd::core::fetch::Fetcher>,
    store: &AlertStore,
    queue: &EnrichmentQueue,
    sources: &[Source],
) {
    let filter = Filter::default();
    for source in sources {
        match fetcher.fetch(source, &filter).await {
            Ok(alerts) => {
                tracing::info!(source = %source.id, count = alerts.len(), "fetched alerts");
                for alert in alerts {
                    let fingerprint = alert.fingerprint.clone();
                    let is_firing = alert.status == stellar_alertd::core::model::AlertStatus::Firing;
                    store.upsert(alert, &source.id);
                    if is_firing {
                        queue.submit(fingerprint, stellar_alertd::core::enrichment::Priority::Normal).await;
                    }
                }
            },
            Err(err) => tracing::warn!(source = %source.id, error = %err, "fetch failed during --once pass"),
        }
    }

    // Give the worker pool a bounded window to finish in-flight enrichment
    // before the process exits; there is no server loop to keep it alive.
    tokio::time::sleep(Duration::from_secs(5)).await;
}

//! End-to-end pipeline test: Poller → EnrichmentQueue → Grouper →
//! destination dispatch, wired the way `main.rs` wires them, exercising
//! the basic ingest/enrich/group/fan-out path across every component
//! rather than one at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::enrichment::EnrichmentQueue;
use crate::core::fetch::{Fetcher, Filter};
use crate::core::grouper::{Grouper, GrouperConfig};
use crate::core::model::{Alert, AlertStatus, SourceTransport};
use crate::core::poller::{BackoffConfig, Poller};
use crate::core::store::AlertStore;
use indexmap::IndexMap;

use super::common::{FakeInvestigator, FixedFetcher, RecordingDestination};

fn alert(fp: &str, alertname: &str) -> Alert {
    let mut labels = IndexMap::new();
    labels.insert("alertname".to_string(), alertname.to_string());
    Alert {
        fingerprint: fp.to_string(),
        labels,
        annotations: IndexMap::new(),
        starts_at: chrono::Utc::now(),
        ends_at: None,
        updated_at: chrono::Utc::now(),
        status: AlertStatus::Firing,
        generator_url: None,
        enrichment: None,
        group_id: None,
    }
}

#[tokio::test]
async fn s1_basic_ingest_enrich_group_and_fanout() {
    let store = AlertStore::new();
    let fetcher: Arc<dyn Fetcher> =
        Arc::new(FixedFetcher(vec![alert("a1", "OOM"), alert("a2", "DiskFull")]));
    let investigator = Arc::new(FakeInvestigator);
    let cancellation = CancellationToken::new();

    let (queue, completions) = EnrichmentQueue::spawn(
        store.clone(),
        investigator.clone(),
        2,
        16,
        Duration::from_secs(5),
        cancellation.clone(),
    );

    let (grouped_tx, mut grouped_rx) = tokio::sync::mpsc::channel::<String>(16);
    let grouper = Arc::new(Grouper::with_fanout_notifier(
        store.clone(),
        investigator.clone(),
        GrouperConfig::default(),
        grouped_tx,
    ));
    tokio::spawn(Arc::clone(&grouper).run(completions));

    let destination = Arc::new(RecordingDestination::new());
    let fanout_destination = Arc::clone(&destination);
    let fanout_store = store.clone();
    let fanout_grouper = Arc::clone(&grouper);
    tokio::spawn(async move {
        while let Some(fingerprint) = grouped_rx.recv().await {
            let Some(alert) = fanout_store.get(&fingerprint) else { continue };
            let group = match &alert.group_id {
                Some(group_id) => {
                    fanout_grouper.groups_snapshot().await.into_iter().find(|g| &g.id == group_id)
                },
                None => None,
            };
            let format = fanout_destination.format(&alert, group.as_ref());
            fanout_destination.deliver(format).await.unwrap();
        }
    });

    let poller = Poller::new(
        fetcher,
        store.clone(),
        queue.clone(),
        Filter::default(),
        Duration::from_secs(30),
        BackoffConfig::default(),
    );
    let source =
        crate::core::model::Source { id: "u1".to_string(), url: "http://upstream".to_string(), transport: SourceTransport::DirectHttp };
    let handle = poller.spawn(vec![source], cancellation.clone());

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(handle.all_ready());

    let a1 = store.get("a1").unwrap();
    let a2 = store.get("a2").unwrap();
    assert_eq!(a1.enrichment.unwrap().status, crate::core::model::EnrichmentStatus::Ok);
    assert_eq!(a2.enrichment.unwrap().status, crate::core::model::EnrichmentStatus::Ok);
    assert!(a1.group_id.is_some());
    assert!(a2.group_id.is_some());
    assert_ne!(a1.group_id, a2.group_id, "distinct root causes must land in distinct groups");

    let groups = grouper.groups_snapshot().await;
    assert_eq!(groups.len(), 2);
    assert!(grouper.rules_snapshot().await.is_empty(), "a single member per group never induces a rule");

    assert_eq!(destination.calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    cancellation.cancel();
}

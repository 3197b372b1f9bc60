//! Store (C2) — process-local map of fingerprint → Alert plus an
//! insertion-ordered index and per-Source "seen" bookkeeping.
//!
//! Grounded on `services::mysql_pool_manager::MySQLPoolManager`'s
//! DashMap-backed registry: lock-free reads on the fast path, one entry
//! per key rather than a single `RwLock<HashMap<..>>`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::{DashMap, DashSet};

use indexmap::IndexMap;

use super::model::{Alert, AlertStatus};

/// Result of `AlertStore::upsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Noop,
}

/// Process-local alert store (C2).
///
/// All operations are safe under concurrent callers:
/// each fingerprint bucket is independently locked by `DashMap`, and
/// `list` takes a consistent snapshot of the insertion index.
#[derive(Clone)]
pub struct AlertStore {
    alerts: Arc<DashMap<String, Alert>>,
    /// Insertion order of fingerprints. Append-only except for
    /// explicit `delete`.
    index: Arc<std::sync::RwLock<Vec<String>>>,
    seen: Arc<DashMap<String, DashSet<String>>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self {
            alerts: Arc::new(DashMap::new()),
            index: Arc::new(std::sync::RwLock::new(Vec::new())),
            seen: Arc::new(DashMap::new()),
        }
    }

    /// Upsert an alert reported by `source_id`.
    ///
    /// Unknown fingerprint → append to the index, Created. Known
    /// fingerprint → merge labels/annotations (last-writer-wins on value,
    /// union on keys), refresh status/updated_at, Updated unless nothing
    /// changed (Noop). Always records membership in `seen[source_id]`
    ///.
    pub fn upsert(&self, incoming: Alert, source_id: &str) -> UpsertOutcome {
        self.record_seen(source_id, &incoming.fingerprint);

        match self.alerts.entry(incoming.fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(incoming.clone());
                self.index.write().unwrap().push(incoming.fingerprint);
                UpsertOutcome::Created
            },
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let changed = merge_alert(existing, incoming);
                if changed { UpsertOutcome::Updated } else { UpsertOutcome::Noop }
            },
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<Alert> {
        self.alerts.get(fingerprint).map(|r| r.clone())
    }

    /// Apply `f` to the stored alert for `fingerprint`, if present.
    /// Used by the EnrichmentQueue to publish enrichment transitions.
    pub fn update<F>(&self, fingerprint: &str, f: F) -> bool
    where
        F: FnOnce(&mut Alert),
    {
        if let Some(mut entry) = self.alerts.get_mut(fingerprint) {
            f(entry.value_mut());
            true
        } else {
            false
        }
    }

    /// Stable insertion order, optionally filtered by status and/or a set
    /// of required labels (an alert must carry every `(key, value)` pair
    /// in `only_labels` to pass).
    pub fn list(&self, only_status: Option<AlertStatus>, only_labels: Option<&IndexMap<String, String>>) -> Vec<Alert> {
        let index = self.index.read().unwrap();
        index
            .iter()
            .filter_map(|fp| self.alerts.get(fp).map(|r| r.clone()))
            .filter(|a| only_status.is_none_or(|s| a.status == s))
            .filter(|a| {
                only_labels.is_none_or(|required| {
                    required.iter().all(|(k, v)| a.labels.get(k) == Some(v))
                })
            })
            .collect()
    }

    /// Removes the alert and all `seen` membership. Used only by explicit
    /// user action — never by the reconciliation path.
    pub fn delete(&self, fingerprint: &str) {
        self.alerts.remove(fingerprint);
        self.index.write().unwrap().retain(|fp| fp != fingerprint);
        for entry in self.seen.iter() {
            entry.value().remove(fingerprint);
        }
    }

    /// Returns the subsequence of `alerts` not already in
    /// `seen[source_id]` — used when the caller wants standalone dedup
    /// semantics instead of an upsert-based reconciliation.
    pub fn dedup(&self, source_id: &str, alerts: Vec<Alert>) -> Vec<Alert> {
        let seen = self.seen.entry(source_id.to_string()).or_default();
        alerts.into_iter().filter(|a| !seen.contains(&a.fingerprint)).collect()
    }

    pub fn has_seen(&self, source_id: &str, fingerprint: &str) -> bool {
        self.seen.get(source_id).map(|s| s.contains(fingerprint)).unwrap_or(false)
    }

    fn record_seen(&self, source_id: &str, fingerprint: &str) {
        self.seen.entry(source_id.to_string()).or_default().insert(fingerprint.to_string());
    }
}

impl Default for AlertStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges `incoming` into `existing` in place. Returns whether anything
/// observable changed (drives the Updated/Noop distinction).
fn merge_alert(existing: &mut Alert, incoming: Alert) -> bool {
    let mut changed = false;

    for (k, v) in incoming.labels {
        if existing.labels.get(&k) != Some(&v) {
            existing.labels.insert(k, v);
            changed = true;
        }
    }
    for (k, v) in incoming.annotations {
        if existing.annotations.get(&k) != Some(&v) {
            existing.annotations.insert(k, v);
            changed = true;
        }
    }
    if existing.status != incoming.status {
        existing.status = incoming.status;
        changed = true;
    }
    if existing.ends_at != incoming.ends_at {
        existing.ends_at = incoming.ends_at;
        changed = true;
    }
    if existing.generator_url != incoming.generator_url {
        existing.generator_url = incoming.generator_url;
        changed = true;
    }

    if changed {
        existing.updated_at = Utc::now();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indexmap::IndexMap;

    fn alert(fp: &str, status: AlertStatus) -> Alert {
        Alert {
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

    #[test]
    fn upsert_unknown_fingerprint_is_created() {
        let store = AlertStore::new();
        assert_eq!(store.upsert(alert("a1", AlertStatus::Firing), "u1"), UpsertOutcome::Created);
        assert!(store.get("a1").is_some());
    }

    #[test]
    fn upsert_twice_is_noop_on_second_call() {
        let store = AlertStore::new();
        let a = alert("a1", AlertStatus::Firing);
        store.upsert(a.clone(), "u1");
        assert_eq!(store.upsert(a, "u1"), UpsertOutcome::Noop);
    }

    #[test]
    fn upsert_status_transition_is_updated() {
        let store = AlertStore::new();
        store.upsert(alert("a1", AlertStatus::Firing), "u1");
        let outcome = store.upsert(alert("a1", AlertStatus::Resolved), "u1");
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(store.get("a1").unwrap().status, AlertStatus::Resolved);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let store = AlertStore::new();
        store.upsert(alert("a1", AlertStatus::Firing), "u1");
        store.upsert(alert("a2", AlertStatus::Firing), "u1");
        store.upsert(alert("a1", AlertStatus::Resolved), "u1"); // re-upsert shouldn't move it
        let fps: Vec<_> = store.list(None, None).into_iter().map(|a| a.fingerprint).collect();
        assert_eq!(fps, vec!["a1".to_string(), "a2".to_string()]);
    }

    #[test]
    fn dedup_across_sources_is_independent() {
        let store = AlertStore::new();
        store.upsert(alert("a1", AlertStatus::Firing), "u1");
        store.upsert(alert("a1", AlertStatus::Firing), "u2");
        assert!(store.has_seen("u1", "a1"));
        assert!(store.has_seen("u2", "a1"));
        assert_eq!(store.list(None, None).len(), 1);
    }

    #[test]
    fn delete_removes_from_index_and_seen() {
        let store = AlertStore::new();
        store.upsert(alert("a1", AlertStatus::Firing), "u1");
        store.delete("a1");
        assert!(store.get("a1").is_none());
        assert!(!store.has_seen("u1", "a1"));
        assert!(store.list(None, None).is_empty());
    }

    #[test]
    fn list_filters_by_required_labels() {
        let store = AlertStore::new();

        let mut payments = alert("a1", AlertStatus::Firing);
        payments.labels.insert("namespace".to_string(), "payments".to_string());
        store.upsert(payments, "u1");

        let mut billing = alert("a2", AlertStatus::Firing);
        billing.labels.insert("namespace".to_string(), "billing".to_string());
        store.upsert(billing, "u1");

        let mut required = IndexMap::new();
        required.insert("namespace".to_string(), "payments".to_string());

        let matched = store.list(None, Some(&required));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].fingerprint, "a1");
    }
}

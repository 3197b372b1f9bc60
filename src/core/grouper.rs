//! Grouper (C6) — clusters enriched alerts by root cause via a two-tier
//! strategy (learned rules first, LLM fallback), and learns, verifies,
//! and self-corrects grouping rules.
//!
//! Grounded on `services::profile_analyzer::analyzer::rule_engine::
//! RuleEngine` (iterate-many-rules, evaluate, aggregate shape) and
//! `services::llm::scenarios::merger::ResultMerger` (merge/dedup-by-key
//! shape), generalized from "diagnose one profile" to "assign one alert
//! to a group".

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::enrichment::{EnrichmentCompleted, Investigator};
use super::model::{Alert, Category, EnrichmentStatus, Group, PredicateClause, Rule, RuleState};
use super::store::AlertStore;

/// Configuration for rule promotion.
#[derive(Debug, Clone, Copy)]
pub struct GrouperConfig {
    pub verify_first_n: u32,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self { verify_first_n: 5 }
    }
}

/// Clusters alerts by root cause and maintains the learned-rule set.
///
/// Single-threaded by design: one task owns `run`, serializing
/// all Rule mutations (O2). State is internally behind a `RwLock` only so
/// read-only snapshot consumers (the TUI/presentation layer) can observe
/// it concurrently; the Grouper task itself is the sole writer.
pub struct Grouper {
    store: AlertStore,
    investigator: Arc<dyn Investigator>,
    config: GrouperConfig,
    groups: RwLock<IndexMap<String, Group>>,
    rules: RwLock<Vec<Rule>>,
    /// Notified with a fingerprint once it has been assigned a group, so
    /// `main.rs` can hand it to `DestinationFanout` (C7) without the
    /// Grouper needing to know anything about destinations.
    grouped: Option<mpsc::Sender<String>>,
}

impl Grouper {
    pub fn new(store: AlertStore, investigator: Arc<dyn Investigator>, config: GrouperConfig) -> Self {
        Self {
            store,
            investigator,
            config,
            groups: RwLock::new(IndexMap::new()),
            rules: RwLock::new(Vec::new()),
            grouped: None,
        }
    }

    /// Same as `new`, but publishes a fingerprint on `grouped` every time
    /// an alert is admitted to a group.
    pub fn with_fanout_notifier(
        store: AlertStore,
        investigator: Arc<dyn Investigator>,
        config: GrouperConfig,
        grouped: mpsc::Sender<String>,
    ) -> Self {
        Self { grouped: Some(grouped), ..Self::new(store, investigator, config) }
    }

    /// Drains completion events from the EnrichmentQueue until the
    /// channel closes (process shutdown). Processes events strictly in
    /// arrival order (O2).
    pub async fn run(self: Arc<Self>, mut completions: mpsc::Receiver<EnrichmentCompleted>) {
        while let Some(event) = completions.recv().await {
            self.handle_completion(&event.fingerprint).await;
        }
        tracing::info!("grouper stopped: completion channel closed");
    }

    async fn handle_completion(&self, fingerprint: &str) {
        let Some(alert) = self.store.get(fingerprint) else {
            return;
        };
        let Some(enrichment) = &alert.enrichment else { return };
        if enrichment.status != EnrichmentStatus::Ok {
            return;
        }

        self.assign(alert).await;
    }

    /// Two-tier matching entry point.
    async fn assign(&self, alert: Alert) {
        if let Some(group_id) = self.try_fast_path(&alert).await {
            self.store.update(&alert.fingerprint, |a| a.group_id = Some(group_id));
            self.notify_grouped(&alert.fingerprint).await;
            return;
        }

        let group_id = self.slow_path(&alert).await;
        self.store.update(&alert.fingerprint, |a| a.group_id = Some(group_id.clone()));
        self.try_induce_rule(&group_id).await;
        self.notify_grouped(&alert.fingerprint).await;
    }

    async fn notify_grouped(&self, fingerprint: &str) {
        if let Some(sender) = &self.grouped {
            if sender.send(fingerprint.to_string()).await.is_err() {
                tracing::warn!(fingerprint, "fanout notification channel closed");
            }
        }
    }

    /// Iterate rules most-specific-first; trusted rules admit directly,
    /// candidate rules admit tentatively pending async verification.
    async fn try_fast_path(&self, alert: &Alert) -> Option<String> {
        let ordered: Vec<Rule> = {
            let rules = self.rules.read().await;
            let mut active: Vec<Rule> = rules
                .iter()
                .filter(|r| r.state != RuleState::Retired)
                .cloned()
                .collect();
            active.sort_by(|a, b| {
                b.specificity()
                    .cmp(&a.specificity())
                    .then_with(|| b.created_at.cmp(&a.created_at))
            });
            active
        };

        for rule in ordered {
            if !rule.matches(&alert.labels) {
                continue;
            }

            match rule.state {
                RuleState::Trusted => {
                    self.admit_to_group(&rule.group_id, &alert.fingerprint).await;
                    return Some(rule.group_id.clone());
                },
                RuleState::Candidate => {
                    self.admit_to_group(&rule.group_id, &alert.fingerprint).await;
                    let root_cause = {
                        let groups = self.groups.read().await;
                        groups.get(&rule.group_id).map(|g| g.root_cause.clone())
                    };
                    let Some(root_cause) = root_cause else { continue };

                    let accepted = self.investigator.verify_grouping(alert, &root_cause).await;
                    if accepted {
                        self.record_verification(&rule.id).await;
                        return Some(rule.group_id.clone());
                    } else {
                        self.retire_rule_and_requeue(&rule.id, &alert.fingerprint, &rule.group_id).await;
                        // A failed verification routes straight to the slow
                        // path — never tried against another candidate or
                        // trusted rule first.
                        return None;
                    }
                },
                RuleState::Retired => crate::invariant_violation!("retired rule {} survived the fast-path filter", rule.id),
            }
        }

        None
    }

    /// Invoke the Investigator's grouping capability: given the new alert
    /// and the current catalogue, it returns a matching groupId or a
    /// fresh (rootCause, category) pair.
    async fn slow_path(&self, alert: &Alert) -> String {
        let Some(enrichment) = alert.enrichment.as_ref() else {
            crate::invariant_violation!("slow_path called on fingerprint {} with no enrichment", alert.fingerprint)
        };
        let root_cause = enrichment.root_cause.clone().unwrap_or_default();

        let existing_group_id = {
            let groups = self.groups.read().await;
            groups
                .values()
                .find(|g| g.root_cause == root_cause)
                .map(|g| g.id.clone())
        };

        if let Some(group_id) = existing_group_id {
            self.admit_to_group(&group_id, &alert.fingerprint).await;
            return group_id;
        }

        let group_id = format!("group-{}", short_hash(&root_cause));
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(group_id.clone())
            .or_insert_with(|| Group::new(group_id.clone(), root_cause, enrichment.category));
        group.add_member(alert.fingerprint.clone());
        group_id
    }

    async fn admit_to_group(&self, group_id: &str, fingerprint: &str) {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get_mut(group_id) {
            group.add_member(fingerprint.to_string());
        }
    }

    async fn record_verification(&self, rule_id: &str) {
        let mut rules = self.rules.write().await;
        if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
            rule.verifications += 1;
            if rule.state == RuleState::Candidate && rule.verifications >= self.config.verify_first_n {
                rule.state = RuleState::Trusted;
                tracing::info!(rule_id, verifications = rule.verifications, "rule promoted to trusted");
            }
        }
    }

    /// Negative verification: retire the rule immediately, move the
    /// offending member out of its group and back to the pending set
    ///.
    async fn retire_rule_and_requeue(&self, rule_id: &str, fingerprint: &str, group_id: &str) {
        {
            let mut rules = self.rules.write().await;
            if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
                rule.failures += 1;
                rule.state = RuleState::Retired;
                tracing::warn!(rule_id, "rule retired after failed verification");
            }
        }
        {
            let mut groups = self.groups.write().await;
            if let Some(group) = groups.get_mut(group_id) {
                group.remove_member(fingerprint);
            }
        }
    }

    /// After any Group has accumulated >= 3 members, attempt to induce a
    /// minimal predicate true for every member and false for every
    /// non-member currently stored.
    async fn try_induce_rule(&self, group_id: &str) {
        let (root_cause, category, members): (String, Option<Category>, Vec<String>) = {
            let groups = self.groups.read().await;
            let Some(group) = groups.get(group_id) else { return };
            if group.members.len() < 3 || group.rule_id.is_some() {
                return;
            }
            (group.root_cause.clone(), group.category, group.members.clone())
        };

        let all_alerts = self.store.list(None, None);
        let member_set: std::collections::HashSet<&str> = members.iter().map(String::as_str).collect();
        let member_alerts: Vec<&Alert> =
            all_alerts.iter().filter(|a| member_set.contains(a.fingerprint.as_str())).collect();
        let non_member_alerts: Vec<&Alert> =
            all_alerts.iter().filter(|a| !member_set.contains(a.fingerprint.as_str())).collect();

        let Some(clauses) = induce_predicate(&member_alerts, &non_member_alerts) else {
            return;
        };

        let rule = Rule {
            id: format!("rule-{}", Uuid::new_v4()),
            clauses,
            root_cause,
            category,
            verifications: 0,
            failures: 0,
            state: RuleState::Candidate,
            group_id: group_id.to_string(),
            created_at: chrono::Utc::now(),
        };
        tracing::info!(rule_id = %rule.id, group_id, "induced candidate rule");

        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get_mut(group_id) {
            group.rule_id = Some(rule.id.clone());
        }
        drop(groups);
        self.rules.write().await.push(rule);
    }

    pub async fn groups_snapshot(&self) -> Vec<Group> {
        self.groups.read().await.values().cloned().collect()
    }

    pub async fn rules_snapshot(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }
}

/// Computes the minimal conjunction of `equals` clauses true for every
/// member and false for every non-member. Only the `equals` operator is
/// attempted by induction.
fn induce_predicate(members: &[&Alert], non_members: &[&Alert]) -> Option<Vec<PredicateClause>> {
    let Some(first) = members.first() else { return None };

    let mut candidate_keys: Vec<(&str, &str)> =
        first.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    // Keep only keys whose value is identical across every member.
    candidate_keys.retain(|(key, value)| {
        members.iter().all(|m| m.labels.get(*key).map(String::as_str) == Some(*value))
    });

    // Drop keys where some non-member shares the same (key, value) pair —
    // those clauses wouldn't distinguish the group.
    candidate_keys.retain(|(key, value)| {
        !non_members
            .iter()
            .any(|n| n.labels.get(*key).map(String::as_str) == Some(*value))
    });

    if candidate_keys.is_empty() {
        return None;
    }

    Some(candidate_keys.into_iter().map(|(k, v)| PredicateClause::equals(k, v)).collect())
}

fn short_hash(input: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:x}", hasher.finish() & 0xffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{AlertStatus, Enrichment};
    use chrono::Utc;

    fn enriched_alert(fp: &str, labels: &[(&str, &str)], root_cause: &str) -> Alert {
        let mut label_map = IndexMap::new();
        for (k, v) in labels {
            label_map.insert(k.to_string(), v.to_string());
        }
        Alert {
            fingerprint: fp.to_string(),
            labels: label_map,
            annotations: IndexMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            updated_at: Utc::now(),
            status: AlertStatus::Firing,
            generator_url: None,
            enrichment: Some(Enrichment {
                status: EnrichmentStatus::Ok,
                root_cause: Some(root_cause.to_string()),
                category: Some(Category::Application),
                evidence: vec![],
                latency: None,
                error: None,
            }),
            group_id: None,
        }
    }

    struct AlwaysAccept;
    #[async_trait::async_trait]
    impl Investigator for AlwaysAccept {
        async fn investigate(&self, _alert: &Alert) -> Result<Enrichment, String> {
            unreachable!("grouper tests drive completion directly")
        }
        async fn verify_grouping(&self, _alert: &Alert, _proposed: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn s1_two_distinct_root_causes_create_two_groups() {
        let store = AlertStore::new();
        let a1 = enriched_alert("a1", &[("alertname", "OOM")], "memory exhaustion");
        let a2 = enriched_alert("a2", &[("alertname", "DiskFull")], "disk pressure");
        store.upsert(a1, "u1");
        store.upsert(a2, "u1");

        let grouper = Grouper::new(store.clone(), Arc::new(AlwaysAccept), GrouperConfig::default());
        grouper.handle_completion("a1").await;
        grouper.handle_completion("a2").await;

        let groups = grouper.groups_snapshot().await;
        assert_eq!(groups.len(), 2);
        assert!(grouper.rules_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn s3_rule_induced_after_third_member_and_promoted_after_fifth_verification() {
        let store = AlertStore::new();
        let grouper = Grouper::new(store.clone(), Arc::new(AlwaysAccept), GrouperConfig::default());

        for i in 0..8 {
            let fp = format!("a{i}");
            let alert = enriched_alert(
                &fp,
                &[("alertname", "PodCrash"), ("namespace", "payments")],
                "payments pod crashloop",
            );
            store.upsert(alert, "u1");
            grouper.handle_completion(&fp).await;
        }

        let rules = grouper.rules_snapshot().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].state, RuleState::Trusted);
        assert!(rules[0].verifications >= 5);
    }

    #[tokio::test]
    async fn s4_negative_verification_retires_rule_and_reassigns_member() {
        struct RejectOnce {
            rejected: std::sync::atomic::AtomicBool,
        }
        #[async_trait::async_trait]
        impl Investigator for RejectOnce {
            async fn investigate(&self, _alert: &Alert) -> Result<Enrichment, String> {
                unreachable!()
            }
            async fn verify_grouping(&self, _alert: &Alert, _proposed: &str) -> bool {
                !self.rejected.swap(true, std::sync::atomic::Ordering::SeqCst)
            }
        }

        let store = AlertStore::new();
        let investigator = Arc::new(RejectOnce { rejected: std::sync::atomic::AtomicBool::new(false) });
        let grouper = Grouper::new(store.clone(), investigator, GrouperConfig::default());

        for i in 0..4 {
            let fp = format!("a{i}");
            let alert = enriched_alert(
                &fp,
                &[("alertname", "PodCrash"), ("namespace", "payments")],
                "payments pod crashloop",
            );
            store.upsert(alert, "u1");
            grouper.handle_completion(&fp).await;
        }

        // Fifth member shares labels but a different root cause from a
        // disagreeing Investigator verification.
        let alert = enriched_alert(
            "a4",
            &[("alertname", "PodCrash"), ("namespace", "payments")],
            "payments DB saturation",
        );
        store.upsert(alert, "u1");
        grouper.handle_completion("a4").await;

        let rules = grouper.rules_snapshot().await;
        assert!(rules.iter().any(|r| r.state == RuleState::Retired));

        let groups = grouper.groups_snapshot().await;
        assert!(groups.iter().any(|g| g.root_cause == "payments DB saturation"));
    }
}

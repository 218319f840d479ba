//! Action plan: the diff between two normalized installations.
//!
//! Built once per reconcile pass, immutable afterwards. Stamps per-host
//! reconcile attributes onto the new tree and keeps the list of hosts that
//! exist only in the old tree (candidates for replica dropping and cleanup
//! accounting).

use std::sync::Arc;

use crate::model::topology::{Host, Installation, ReconcileAttributesCounters};

/// Immutable snapshot of the differences between the previous and the new
/// normalized installation.
pub struct ActionPlan {
    added: usize,
    modified: usize,
    found: usize,
    removed_hosts: Vec<Arc<Host>>,
    spec_changed: bool,
}

impl ActionPlan {
    /// Diff `old` against `new`, stamping reconcile attributes on every host
    /// of `new`.
    pub fn new(old: Option<&Installation>, new: &Installation) -> Self {
        let mut added = 0;
        let mut modified = 0;
        let mut found = 0;

        new.walk_hosts(|host| {
            let ancestor_host = old.and_then(|o| o.find_host(&host.address));
            match ancestor_host {
                None => {
                    added += 1;
                    host.with_attributes(|a| {
                        a.set_add();
                        a.set_new();
                    });
                }
                Some(prev) if prev.settings_digest != host.settings_digest => {
                    modified += 1;
                    host.with_attributes(|a| a.set_modify());
                }
                Some(_) => {
                    found += 1;
                    host.with_attributes(|a| a.set_found());
                }
            }
            if new.stopped {
                host.with_attributes(|a| a.set_stopped());
            }
        });

        let mut removed_hosts = Vec::new();
        if let Some(old) = old {
            old.walk_hosts(|host| {
                if new.find_host(&host.address).is_none() {
                    host.with_attributes(|a| a.set_remove());
                    removed_hosts.push(host.clone());
                }
            });
        }

        let spec_changed = match old {
            None => true,
            Some(old) => old.stopped != new.stopped || old.generation != new.generation,
        };

        new.with_status(|status| {
            status.hosts_added_count = added as i32;
            status.hosts_updated_count = modified as i32;
            status.hosts_deleted_count = removed_hosts.len() as i32;
        });

        Self {
            added,
            modified,
            found,
            removed_hosts,
            spec_changed,
        }
    }

    /// Whether this plan requires any work at all.
    pub fn has_actions_to_do(&self) -> bool {
        self.added > 0 || self.modified > 0 || !self.removed_hosts.is_empty() || self.spec_changed
    }

    /// True when every host is a pure addition; enables full fan-out.
    pub fn add_only(&self) -> bool {
        self.counters().add_only()
    }

    pub fn counters(&self) -> ReconcileAttributesCounters {
        ReconcileAttributesCounters {
            add: self.added,
            modify: self.modified,
            remove: self.removed_hosts.len(),
            found: self.found,
        }
    }

    /// Hosts present in the previous pass but absent from the new one.
    pub fn removed_hosts(&self) -> &[Arc<Host>] {
        &self.removed_hosts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::crd::{ClickHouseInstallation, ClickHouseInstallationSpec};
    use crate::model::normalizer::normalize;

    fn raw(generation: i64, spec_json: &str) -> ClickHouseInstallation {
        let spec: ClickHouseInstallationSpec = serde_json::from_str(spec_json).unwrap();
        ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    const TWO_SHARDS: &str =
        r#"{"clusters": [{"name": "main", "layout": {"shardsCount": 2, "replicasCount": 1}}]}"#;

    #[test]
    fn test_first_reconcile_is_add_only() {
        let new = normalize(&raw(1, TWO_SHARDS), None);
        let plan = ActionPlan::new(None, &new);

        assert!(plan.has_actions_to_do());
        assert!(plan.add_only());
        assert_eq!(plan.counters().add, 2);
        assert!(plan.removed_hosts().is_empty());
        new.walk_hosts(|h| {
            assert!(h.attributes().is_add());
            assert!(h.attributes().is_new());
        });
    }

    #[test]
    fn test_unchanged_spec_has_no_actions() {
        let old = normalize(&raw(4, TWO_SHARDS), None);
        let new = normalize(&raw(4, TWO_SHARDS), Some(old.clone()));
        let plan = ActionPlan::new(Some(&old), &new);

        assert!(!plan.has_actions_to_do());
        assert!(!plan.add_only());
        assert_eq!(plan.counters().found, 2);
    }

    #[test]
    fn test_scale_out_adds_only_new_hosts() {
        let old = normalize(&raw(1, TWO_SHARDS), None);
        let grown =
            r#"{"clusters": [{"name": "main", "layout": {"shardsCount": 3, "replicasCount": 1}}]}"#;
        let new = normalize(&raw(2, grown), Some(old.clone()));
        let plan = ActionPlan::new(Some(&old), &new);

        assert!(plan.has_actions_to_do());
        // Existing hosts are found, one new shard host is added: not add-only.
        assert!(!plan.add_only());
        assert_eq!(plan.counters().add, 1);
        assert_eq!(plan.counters().found, 2);
    }

    #[test]
    fn test_settings_change_marks_modify() {
        let old = normalize(&raw(1, TWO_SHARDS), None);
        let reconfigured = r#"{"clusters": [{"name": "main",
            "zookeeper": {"nodes": [{"host": "zk"}], "root": "/ch"},
            "layout": {"shardsCount": 2, "replicasCount": 1}}]}"#;
        let new = normalize(&raw(2, reconfigured), Some(old.clone()));
        let plan = ActionPlan::new(Some(&old), &new);

        assert_eq!(plan.counters().modify, 2);
        assert_eq!(plan.counters().add, 0);
    }

    #[test]
    fn test_scale_in_collects_removed_hosts() {
        let old = normalize(&raw(1, TWO_SHARDS), None);
        let shrunk =
            r#"{"clusters": [{"name": "main", "layout": {"shardsCount": 1, "replicasCount": 1}}]}"#;
        let new = normalize(&raw(2, shrunk), Some(old.clone()));
        let plan = ActionPlan::new(Some(&old), &new);

        assert_eq!(plan.removed_hosts().len(), 1);
        assert_eq!(plan.removed_hosts()[0].name, "chi-demo-main-1-0");
        assert!(plan.removed_hosts()[0].attributes().is_remove());
    }

    #[test]
    fn test_status_counts_are_stamped() {
        let old = normalize(&raw(1, TWO_SHARDS), None);
        let shrunk =
            r#"{"clusters": [{"name": "main", "layout": {"shardsCount": 1, "replicasCount": 1}}]}"#;
        let new = normalize(&raw(2, shrunk), Some(old.clone()));
        let _plan = ActionPlan::new(Some(&old), &new);

        let status = new.status_snapshot();
        assert_eq!(status.hosts_deleted_count, 1);
        assert_eq!(status.hosts_added_count, 0);
    }
}

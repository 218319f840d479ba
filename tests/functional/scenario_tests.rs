//! Literal scenarios over the pure pipeline logic.

use clickhouse_operator::controller::chi::reconcile_shards_workers_num;
use clickhouse_operator::controller::host::should_exclude;
use clickhouse_operator::controller::schemer::{VersionOptions, parse_software_version};
use clickhouse_operator::controller::context::ReconcileRuntimeConfig;
use clickhouse_operator::model::action_plan::ActionPlan;
use clickhouse_operator::model::topology::HostLifecycle;
use clickhouse_operator::resources::statefulsets::generate_host_statefulset;
use clickhouse_operator::resources::common::OperatorInfo;

use crate::mock_state::MockInstallation;

fn operator() -> OperatorInfo {
    OperatorInfo {
        version: "0.1.0".to_string(),
        commit: "abc1234".to_string(),
        build_date: "2026-07-01T12:30:00".to_string(),
    }
}

#[test]
fn test_new_chi_one_cluster_one_shard_two_hosts() {
    // Scenario: new CHI, one cluster, one shard, two hosts, T=4.
    let new = MockInstallation::new("demo", 1, 2).normalize(None);
    let plan = ActionPlan::new(None, &new);

    // AddOnly holds, so the fan-out flag is set and workers = max(T, 1).
    assert!(plan.add_only());
    let config = ReconcileRuntimeConfig {
        reconcile_shards_threads_number: 4,
        reconcile_shards_max_concurrency_percent: 50,
    };
    assert_eq!(reconcile_shards_workers_num(1, plan.add_only(), &config), 4);

    // Hosts of the single shard stay sequential and in order.
    let hosts = new.hosts();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0].name, "chi-demo-main-0-0");
    assert_eq!(hosts[1].name, "chi-demo-main-0-1");
    assert!(hosts[0].is_first_in_installation());

    // Status bookkeeping: both hosts complete, count saturates at total.
    let status = new.with_status(|status| {
        status.host_completed();
        status.host_completed();
        status.host_completed();
        status.clone()
    });
    assert_eq!(status.hosts_count, 2);
    assert_eq!(status.hosts_completed_count, 2);
}

#[test]
fn test_hosts_completed_is_monotonic() {
    let new = MockInstallation::new("demo", 2, 2).normalize(None);
    let mut last = 0;
    for _ in 0..6 {
        let completed = new.with_status(|status| {
            status.host_completed();
            status.hosts_completed_count
        });
        assert!(completed >= last);
        let total = new.with_status(|s| s.hosts_count);
        assert!(completed <= total);
        last = completed;
    }
}

#[test]
fn test_stopped_chi_runs_hosts_at_zero_replicas() {
    // Scenario: stopped CHI. Hosts still reconcile their per-host state,
    // but every StatefulSet runs zero replicas and exclusion is skipped.
    let mock = MockInstallation::new("demo", 1, 2).stopped();
    let chi = mock.normalize(None);

    let host = chi.hosts()[0].clone();
    host.with_attributes(|a| a.set_modify());
    assert!(!should_exclude(&chi, &host));

    let sts = generate_host_statefulset(&chi, &host, &operator(), false);
    assert_eq!(sts.spec.unwrap().replicas, Some(0));
}

#[test]
fn test_exclusion_protocol_predicates() {
    let chi = MockInstallation::new("demo", 1, 2).normalize(None);
    let old = chi.hosts()[0].clone();

    // A found host with no pending change stays in traffic.
    old.with_attributes(|a| a.set_found());
    assert!(!should_exclude(&chi, &old));

    // A modified host with a sibling is excluded.
    old.with_attributes(|a| a.set_modify());
    assert!(should_exclude(&chi, &old));

    // A brand-new host has no traffic to drain.
    let fresh = chi.hosts()[1].clone();
    fresh.with_attributes(|a| {
        a.set_new();
        a.set_modify();
    });
    assert!(!should_exclude(&chi, &fresh));
}

#[test]
fn test_version_probe_skip_rules() {
    let chi = MockInstallation::new("demo", 1, 1).normalize(None);
    let host = chi.hosts()[0].clone();
    host.with_attributes(|a| a.set_new());

    // Hosts that never ran have no version to probe.
    let options = VersionOptions {
        skip_new: true,
        skip_stopped_ancestor: true,
        ..Default::default()
    };
    assert!(options.should_skip(&host, false).is_some());

    // A stopped ancestor means the host was down before this pass.
    let existing = MockInstallation::new("demo", 1, 1)
        .generation(2)
        .normalize(None);
    let existing_host = existing.hosts()[0].clone();
    assert!(options.should_skip(&existing_host, true).is_some());
    assert!(options.should_skip(&existing_host, false).is_none());
}

#[test]
fn test_clickhouse_version_parsing() {
    // ClickHouse reports four components; the build number is dropped.
    let version = parse_software_version("24.8.2.3").expect("4-part version parses");
    assert_eq!((version.major, version.minor, version.patch), (24, 8, 2));
    assert!(parse_software_version("garbage").is_none());
}

#[test]
fn test_host_lifecycle_transitions() {
    let chi = MockInstallation::new("demo", 1, 1).normalize(None);
    let host = chi.hosts()[0].clone();

    assert_eq!(host.with_runtime(|r| r.lifecycle), HostLifecycle::Pending);
    host.set_lifecycle(HostLifecycle::Reconciling);
    assert_eq!(
        host.with_runtime(|r| r.lifecycle),
        HostLifecycle::Reconciling
    );
    host.set_lifecycle(HostLifecycle::Completed);
    assert_eq!(host.with_runtime(|r| r.lifecycle), HostLifecycle::Completed);
}

#[test]
fn test_second_pass_with_no_change_has_no_actions() {
    // Running reconcile twice on the same spec: the second pass's plan is
    // empty, so no mutating Kubernetes call would be issued.
    let mock = MockInstallation::new("demo", 2, 2).generation(3);
    let first = mock.normalize(None);
    let _ = ActionPlan::new(None, &first);

    let second = mock.normalize(Some(first.clone()));
    let plan = ActionPlan::new(Some(&first), &second);
    assert!(!plan.has_actions_to_do());
    second.walk_hosts(|host| {
        assert!(host.attributes().is_found());
        assert!(!host.attributes().is_add());
    });
}

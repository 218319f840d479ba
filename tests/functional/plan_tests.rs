//! Action plan and generation gating behavior.

use clickhouse_operator::controller::chi::is_generation_the_same;
use clickhouse_operator::model::action_plan::ActionPlan;

use crate::mock_state::MockInstallation;

#[test]
fn test_new_installation_is_add_only() {
    let new = MockInstallation::new("demo", 1, 2).normalize(None);
    let plan = ActionPlan::new(None, &new);

    assert!(plan.has_actions_to_do());
    assert!(plan.add_only());
    assert_eq!(plan.counters().add, 2);

    new.walk_hosts(|host| {
        let attributes = host.attributes();
        assert!(attributes.is_add());
        assert!(attributes.is_new());
        assert!(!attributes.is_modify());
    });
}

#[test]
fn test_generation_unchanged_skips_reconcile() {
    let mock = MockInstallation::new("demo", 2, 2).generation(7);
    let ancestor = mock.normalize(None);

    // Same generation with a completed ancestor: the gate short-circuits
    // before any Kubernetes access.
    assert!(is_generation_the_same(Some(&ancestor), &mock.build_cr()));

    // And even past the gate, the plan carries no actions.
    let new = mock.normalize(Some(ancestor.clone()));
    let plan = ActionPlan::new(Some(&ancestor), &new);
    assert!(!plan.has_actions_to_do());
}

#[test]
fn test_generation_bump_passes_the_gate() {
    let old = MockInstallation::new("demo", 2, 2).generation(7);
    let ancestor = old.normalize(None);

    let bumped = old.clone().generation(8);
    assert!(!is_generation_the_same(Some(&ancestor), &bumped.build_cr()));
}

#[test]
fn test_first_reconcile_never_gated() {
    let mock = MockInstallation::new("demo", 1, 1).generation(7);
    assert!(!is_generation_the_same(None, &mock.build_cr()));
}

#[test]
fn test_settings_change_marks_every_host_modified() {
    let old = MockInstallation::new("demo", 2, 2);
    let ancestor = old.normalize(None);

    let reconfigured = old.clone().generation(2).zookeeper("/clickhouse/demo");
    let new = reconfigured.normalize(Some(ancestor.clone()));
    let plan = ActionPlan::new(Some(&ancestor), &new);

    assert!(plan.has_actions_to_do());
    assert!(!plan.add_only());
    assert_eq!(plan.counters().modify, 4);
    assert_eq!(plan.counters().add, 0);
}

#[test]
fn test_scale_out_mixes_found_and_add() {
    let old = MockInstallation::new("demo", 2, 2);
    let ancestor = old.normalize(None);

    let grown = old.clone().generation(2).shards(3);
    let new = grown.normalize(Some(ancestor.clone()));
    let plan = ActionPlan::new(Some(&ancestor), &new);

    assert_eq!(plan.counters().found, 4);
    assert_eq!(plan.counters().add, 2);
    // Existing hosts are being kept, so full fan-out is off.
    assert!(!plan.add_only());
}

#[test]
fn test_scale_in_reports_removed_hosts() {
    let old = MockInstallation::new("demo", 3, 1);
    let ancestor = old.normalize(None);

    let shrunk = old.clone().generation(2).shards(1);
    let new = shrunk.normalize(Some(ancestor.clone()));
    let plan = ActionPlan::new(Some(&ancestor), &new);

    let removed: Vec<_> = plan
        .removed_hosts()
        .iter()
        .map(|h| h.name.clone())
        .collect();
    assert_eq!(removed, vec!["chi-demo-main-1-0", "chi-demo-main-2-0"]);
}

#[test]
fn test_stop_flag_flips_plan_even_with_same_layout() {
    let old = MockInstallation::new("demo", 1, 1);
    let ancestor = old.normalize(None);

    let stopped = old.clone().generation(2).stopped();
    let new = stopped.normalize(Some(ancestor.clone()));
    let plan = ActionPlan::new(Some(&ancestor), &new);

    // The digest covers the stopped flag, so hosts are modifications.
    assert!(plan.has_actions_to_do());
    assert_eq!(plan.counters().modify, 1);
    new.walk_hosts(|host| assert!(host.attributes().is_stopped()));
}

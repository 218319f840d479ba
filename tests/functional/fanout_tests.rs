//! Canary and cohort fan-out sizing.
//!
//! The shard loop is: canary first (unless full fan-out), then cohorts of
//! `workers_num` shards joined batch by batch. These tests pin the sizing
//! arithmetic and the cohort coverage invariants, and simulate the
//! first-error short-circuit over the cohort ranges.

use clickhouse_operator::controller::chi::{cohort_ranges, reconcile_shards_workers_num};
use clickhouse_operator::controller::context::ReconcileRuntimeConfig;

use crate::mock_state::MockInstallation;

fn config(threads: usize, percent: usize) -> ReconcileRuntimeConfig {
    ReconcileRuntimeConfig {
        reconcile_shards_threads_number: threads,
        reconcile_shards_max_concurrency_percent: percent,
    }
}

#[test]
fn test_full_fan_out_uses_all_threads() {
    // AddOnly installation with T=4: cohort width is 4 regardless of the
    // concurrency percentage.
    assert_eq!(reconcile_shards_workers_num(1, true, &config(4, 50)), 4);
    assert_eq!(reconcile_shards_workers_num(100, true, &config(4, 1)), 4);
}

#[test]
fn test_percentage_caps_workers() {
    // T=2, P=100 over 5 shards: percentage allows 5, threads cap at 2.
    assert_eq!(reconcile_shards_workers_num(5, false, &config(2, 100)), 2);
    // T=8, P=25 over 8 shards: percentage allows 2.
    assert_eq!(reconcile_shards_workers_num(8, false, &config(8, 25)), 2);
}

#[test]
fn test_at_least_one_worker() {
    assert_eq!(reconcile_shards_workers_num(10, false, &config(0, 0)), 1);
    assert_eq!(reconcile_shards_workers_num(0, true, &config(0, 0)), 1);
}

#[test]
fn test_cohorts_cover_remaining_shards_in_order() {
    // shards=[A,B,C,D,E], canary done, T=2, P=100: cohorts {B,C} then {D,E}.
    let workers = reconcile_shards_workers_num(5, false, &config(2, 100));
    let ranges = cohort_ranges(5, 1, workers);
    assert_eq!(ranges, vec![1..3, 3..5]);
}

#[test]
fn test_cohorts_disjoint_and_bounded() {
    for total in 0..16usize {
        for start in 0..=total {
            for workers in 1..6usize {
                let ranges = cohort_ranges(total, start, workers);

                // |C| <= workersNum for every cohort.
                assert!(ranges.iter().all(|r| r.len() <= workers && !r.is_empty()));

                // Disjoint, ordered, covering start..total.
                let covered: Vec<usize> = ranges.iter().cloned().flatten().collect();
                let expected: Vec<usize> = (start..total).collect();
                assert_eq!(covered, expected);
            }
        }
    }
}

#[test]
fn test_single_shard_without_fan_out_leaves_main_loop_empty() {
    // The canary handles shards[0]; the cohort loop has nothing left.
    assert!(cohort_ranges(1, 1, 4).is_empty());
}

#[test]
fn test_multi_cluster_fan_out_is_installation_wide() {
    // Two clusters with two shards each: the fan-out sees one flat list of
    // four shards, so there is a single canary and cohorts are sized off
    // the total, not per cluster.
    let chi = MockInstallation::new("demo", 2, 1).clusters(2).normalize(None);
    let shards = chi.shards();

    let order: Vec<(String, usize)> = shards
        .iter()
        .map(|(cluster, shard)| (cluster.name.clone(), shard.index))
        .collect();
    assert_eq!(
        order,
        vec![
            ("main0".to_string(), 0),
            ("main0".to_string(), 1),
            ("main1".to_string(), 0),
            ("main1".to_string(), 1),
        ]
    );

    // P=50 over the 4-shard total allows 2 workers; a per-cluster sizing
    // would have allowed only 1.
    let workers = reconcile_shards_workers_num(shards.len(), false, &config(8, 50));
    assert_eq!(workers, 2);

    // One canary for the whole installation, then cohorts spanning the
    // cluster boundary.
    assert_eq!(cohort_ranges(shards.len(), 1, workers), vec![1..3, 3..4]);
}

#[test]
fn test_cohort_error_stops_later_cohorts() {
    // Simulate scenario: canary A succeeded, cohort {B,C} runs and C fails.
    // The driver joins the cohort, surfaces the first error, and {D,E}
    // never start.
    let shards = ["A", "B", "C", "D", "E"];
    let failing = "C";
    let mut started: Vec<&str> = vec![shards[0]];

    let mut cohort_error = None;
    for range in cohort_ranges(shards.len(), 1, 2) {
        let cohort: Vec<&str> = range.map(|i| shards[i]).collect();
        started.extend(&cohort);
        // All members of the cohort run to completion before the join
        // decides; the first error (in order) wins.
        if let Some(bad) = cohort.iter().find(|s| **s == failing) {
            cohort_error = Some(*bad);
        }
        if cohort_error.is_some() {
            break;
        }
    }

    assert_eq!(cohort_error, Some("C"));
    assert_eq!(started, vec!["A", "B", "C"]);
    assert!(!started.contains(&"D"));
    assert!(!started.contains(&"E"));
}

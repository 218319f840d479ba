//! Spec normalization.
//!
//! Turns the raw ClickHouseInstallation spec into the canonical topology
//! tree. Normalization is pure and deterministic: the same raw spec always
//! yields the same tree, which lets the action plan compare passes by
//! digest.

use std::sync::{Arc, Mutex};

use kube::ResourceExt;

use crate::crd::{
    ClickHouseInstallation, ClickHouseInstallationStatus, ClusterSpec, ShardSpec,
};
use crate::model::topology::{
    Address, Cluster, Host, HostRuntime, Installation, InstallationRuntime, ReconcileAttributes,
    Shard,
};

/// Normalize a raw installation, recording the previous pass as ancestor.
pub fn normalize(
    cr: &ClickHouseInstallation,
    ancestor: Option<Arc<Installation>>,
) -> Arc<Installation> {
    let namespace = cr.namespace().unwrap_or_else(|| "default".to_string());
    let name = cr.name_any();
    let generation = cr.metadata.generation.unwrap_or(0);

    let clusters: Vec<Arc<Cluster>> = cr
        .spec
        .clusters
        .iter()
        .enumerate()
        .map(|(index, spec)| normalize_cluster(cr, &namespace, &name, index, spec))
        .collect();

    let mut status = ClickHouseInstallationStatus {
        clusters_count: clusters.len() as i32,
        shards_count: clusters.iter().map(|c| c.shards.len()).sum::<usize>() as i32,
        hosts_count: clusters.iter().map(|c| c.host_count()).sum::<usize>() as i32,
        ..Default::default()
    };
    if let Some(current) = &cr.status {
        status.observed_generation = current.observed_generation;
    }

    Arc::new(Installation {
        namespace,
        name,
        generation,
        stopped: cr.spec.stopped,
        defaults: cr.spec.defaults.clone(),
        reconciling: cr.spec.reconciling.clone(),
        clusters,
        runtime: InstallationRuntime {
            ancestor,
            common_config_lock: tokio::sync::Mutex::new(()),
            status: Mutex::new(status),
        },
    })
}

fn normalize_cluster(
    cr: &ClickHouseInstallation,
    namespace: &str,
    chi_name: &str,
    index: usize,
    spec: &ClusterSpec,
) -> Arc<Cluster> {
    let cluster_name = if spec.name.is_empty() {
        format!("cluster{index}")
    } else {
        spec.name.clone()
    };

    let shard_specs = expand_shards(spec);
    let shards: Vec<Arc<Shard>> = shard_specs
        .iter()
        .enumerate()
        .map(|(shard_index, shard_spec)| {
            let shard_name = shard_spec
                .name
                .clone()
                .unwrap_or_else(|| shard_index.to_string());
            let replicas = replicas_count(spec, shard_spec);
            let hosts: Vec<Arc<Host>> = (0..replicas)
                .map(|replica_index| {
                    new_host(
                        cr,
                        namespace,
                        chi_name,
                        &cluster_name,
                        index,
                        &shard_name,
                        shard_index,
                        replica_index,
                        replicas,
                        spec,
                    )
                })
                .collect();
            Arc::new(Shard {
                name: shard_name,
                index: shard_index,
                hosts,
            })
        })
        .collect();

    Arc::new(Cluster {
        name: cluster_name,
        index,
        zookeeper: spec.zookeeper.clone(),
        secret_source: spec.secret.source,
        secret_value: spec.secret.value.clone(),
        shards,
    })
}

/// Explicit shard entries win; otherwise `shardsCount` (default 1) generates
/// anonymous shards.
fn expand_shards(spec: &ClusterSpec) -> Vec<ShardSpec> {
    if !spec.layout.shards.is_empty() {
        return spec.layout.shards.clone();
    }
    let count = spec.layout.shards_count.unwrap_or(1).max(1) as usize;
    vec![ShardSpec::default(); count]
}

/// Explicit replica entries win, then the shard override, then the layout
/// default, then 1.
fn replicas_count(cluster: &ClusterSpec, shard: &ShardSpec) -> usize {
    if !shard.replicas.is_empty() {
        return shard.replicas.len();
    }
    shard
        .replicas_count
        .or(cluster.layout.replicas_count)
        .unwrap_or(1)
        .max(1) as usize
}

#[allow(clippy::too_many_arguments)]
fn new_host(
    cr: &ClickHouseInstallation,
    namespace: &str,
    chi_name: &str,
    cluster_name: &str,
    cluster_index: usize,
    shard_name: &str,
    shard_index: usize,
    replica_index: usize,
    replicas_in_shard: usize,
    cluster_spec: &ClusterSpec,
) -> Arc<Host> {
    let name = format!("chi-{chi_name}-{cluster_name}-{shard_index}-{replica_index}");
    Arc::new(Host {
        name,
        address: Address {
            namespace: namespace.to_string(),
            chi_name: chi_name.to_string(),
            cluster_name: cluster_name.to_string(),
            cluster_index,
            shard_name: shard_name.to_string(),
            shard_index,
            replica_index,
        },
        replicas_in_shard,
        stopped: cr.spec.stopped,
        settings_digest: settings_digest(cr, cluster_spec),
        attributes: Mutex::new(ReconcileAttributes::default()),
        runtime: Mutex::new(HostRuntime::default()),
    })
}

/// Canonical digest of everything that shapes a host's Kubernetes objects.
/// Two hosts with equal digests across passes need no modification.
fn settings_digest(cr: &ClickHouseInstallation, cluster: &ClusterSpec) -> String {
    // serde_json preserves struct field order, so the encoding is canonical
    // for our own types.
    serde_json::json!({
        "stopped": cr.spec.stopped,
        "defaults": cr.spec.defaults,
        "reconciling": cr.spec.reconciling,
        "zookeeper": cluster.zookeeper,
        "secret": cluster.secret,
    })
    .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::crd::ClickHouseInstallationSpec;

    fn raw(spec_json: &str) -> ClickHouseInstallation {
        let spec: ClickHouseInstallationSpec = serde_json::from_str(spec_json).unwrap();
        ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn test_layout_expansion() {
        let cr = raw(
            r#"{"clusters": [{"name": "main", "layout": {"shardsCount": 2, "replicasCount": 2}}]}"#,
        );
        let chi = normalize(&cr, None);

        assert_eq!(chi.clusters.len(), 1);
        assert_eq!(chi.clusters[0].shards.len(), 2);
        assert_eq!(chi.host_count(), 4);
        assert_eq!(chi.hosts()[0].name, "chi-demo-main-0-0");
        assert_eq!(chi.hosts()[3].name, "chi-demo-main-1-1");
        assert_eq!(chi.hosts()[3].replicas_in_shard, 2);
        assert_eq!(chi.generation, 3);
    }

    #[test]
    fn test_explicit_shards_win_over_count() {
        let cr = raw(
            r#"{"clusters": [{"name": "main", "layout": {
                "shardsCount": 5,
                "shards": [{"replicas": [{}, {}, {}]}]
            }}]}"#,
        );
        let chi = normalize(&cr, None);
        assert_eq!(chi.shard_count(), 1);
        assert_eq!(chi.host_count(), 3);
    }

    #[test]
    fn test_empty_cluster_name_defaults_positionally() {
        let cr = raw(r#"{"clusters": [{}, {}]}"#);
        let chi = normalize(&cr, None);
        assert_eq!(chi.clusters[0].name, "cluster0");
        assert_eq!(chi.clusters[1].name, "cluster1");
        // Single implicit shard with a single implicit replica each.
        assert_eq!(chi.host_count(), 2);
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let cr = raw(
            r#"{"clusters": [{"name": "main",
                "zookeeper": {"nodes": [{"host": "zk"}], "root": "/ch/demo"},
                "layout": {"shardsCount": 3, "replicasCount": 2}}]}"#,
        );
        let a = normalize(&cr, None);
        let b = normalize(&cr, None);

        let names_a: Vec<_> = a.hosts().iter().map(|h| h.name.clone()).collect();
        let names_b: Vec<_> = b.hosts().iter().map(|h| h.name.clone()).collect();
        assert_eq!(names_a, names_b);
        assert_eq!(
            a.hosts()[0].settings_digest,
            b.hosts()[0].settings_digest
        );
    }

    #[test]
    fn test_digest_changes_with_cluster_settings() {
        let plain = raw(r#"{"clusters": [{"name": "main"}]}"#);
        let with_zk = raw(
            r#"{"clusters": [{"name": "main",
                "zookeeper": {"nodes": [{"host": "zk"}], "root": "/ch"}}]}"#,
        );
        let a = normalize(&plain, None);
        let b = normalize(&with_zk, None);
        assert_ne!(
            a.hosts()[0].settings_digest,
            b.hosts()[0].settings_digest
        );
    }

    #[test]
    fn test_status_counts_prefilled() {
        let cr = raw(
            r#"{"clusters": [{"name": "main", "layout": {"shardsCount": 2, "replicasCount": 2}}]}"#,
        );
        let chi = normalize(&cr, None);
        let status = chi.status_snapshot();
        assert_eq!(status.clusters_count, 1);
        assert_eq!(status.shards_count, 2);
        assert_eq!(status.hosts_count, 4);
        assert_eq!(status.hosts_completed_count, 0);
    }
}

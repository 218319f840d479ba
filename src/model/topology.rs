//! Normalized installation topology.
//!
//! The tree (installation -> clusters -> shards -> hosts) is rebuilt from the
//! normalized spec on every reconcile pass and never retained across passes,
//! except as the recorded ancestor of the next pass. Hosts carry per-pass
//! reconcile attributes and runtime state behind locks so that shard workers
//! on different shards can progress concurrently.

use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::StatefulSet;
use semver::Version;

use crate::crd::{
    ClickHouseInstallationStatus, ClusterSecretSource, DefaultsSpec, ReconcilingSpec,
    ZookeeperSpec,
};

/// Identity of a host within its installation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub namespace: String,
    pub chi_name: String,
    pub cluster_name: String,
    pub cluster_index: usize,
    pub shard_name: String,
    pub shard_index: usize,
    pub replica_index: usize,
}

impl Address {
    /// "namespace/host" form used in log and event messages.
    pub fn namespace_name(&self, host_name: &str) -> String {
        format!("{}/{}", self.namespace, host_name)
    }
}

/// Lifecycle of a host within one reconcile pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostLifecycle {
    #[default]
    Pending,
    Reconciling,
    Completed,
    Failed,
}

/// Per-host reconcile attributes, precomputed by the action plan.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileAttributes {
    add: bool,
    modify: bool,
    remove: bool,
    found: bool,
    new: bool,
    stopped: bool,
}

impl ReconcileAttributes {
    pub fn set_add(&mut self) {
        self.add = true;
    }

    pub fn unset_add(&mut self) {
        self.add = false;
    }

    pub fn set_modify(&mut self) {
        self.modify = true;
    }

    pub fn set_remove(&mut self) {
        self.remove = true;
    }

    pub fn set_found(&mut self) {
        self.found = true;
    }

    pub fn set_new(&mut self) {
        self.new = true;
    }

    pub fn set_stopped(&mut self) {
        self.stopped = true;
    }

    pub fn is_add(&self) -> bool {
        self.add
    }

    pub fn is_modify(&self) -> bool {
        self.modify
    }

    pub fn is_remove(&self) -> bool {
        self.remove
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Sums of reconcile attributes across all hosts of an installation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReconcileAttributesCounters {
    pub add: usize,
    pub modify: usize,
    pub remove: usize,
    pub found: usize,
}

impl ReconcileAttributesCounters {
    pub fn account(&mut self, attributes: &ReconcileAttributes) {
        if attributes.is_add() {
            self.add += 1;
        }
        if attributes.is_modify() {
            self.modify += 1;
        }
        if attributes.is_remove() {
            self.remove += 1;
        }
        if attributes.is_found() {
            self.found += 1;
        }
    }

    /// True when every pending action is a pure addition. No live host is
    /// being mutated, so full fan-out is safe.
    pub fn add_only(&self) -> bool {
        self.add > 0 && self.modify == 0 && self.remove == 0 && self.found == 0
    }
}

/// Mutable runtime state of a host during one reconcile pass.
#[derive(Debug, Default)]
pub struct HostRuntime {
    pub lifecycle: HostLifecycle,
    /// Parsed result of the live `version()` query, when reachable.
    pub version: Option<Version>,
    pub cur_statefulset: Option<StatefulSet>,
    pub desired_statefulset: Option<StatefulSet>,
    /// Whether any data volume exists for this host.
    pub has_data: bool,
}

/// A single ClickHouse replica.
#[derive(Debug)]
pub struct Host {
    /// Object name stem, e.g. "chi-demo-main-0-0".
    pub name: String,
    pub address: Address,
    /// Number of replicas in the owning shard, this host included.
    pub replicas_in_shard: usize,
    /// Propagated from the installation spec.
    pub stopped: bool,
    /// Canonical digest of everything that shapes this host's objects.
    /// Digest inequality between passes marks the host as modified.
    pub settings_digest: String,
    pub attributes: Mutex<ReconcileAttributes>,
    pub runtime: Mutex<HostRuntime>,
}

impl Host {
    /// First host of the whole installation (cluster 0, shard 0, replica 0).
    pub fn is_first_in_installation(&self) -> bool {
        self.address.cluster_index == 0
            && self.address.shard_index == 0
            && self.address.replica_index == 0
    }

    pub fn attributes(&self) -> ReconcileAttributes {
        *self.attributes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_attributes(&self, f: impl FnOnce(&mut ReconcileAttributes)) {
        let mut guard = self.attributes.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn with_runtime<T>(&self, f: impl FnOnce(&mut HostRuntime) -> T) -> T {
        let mut guard = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn is_new(&self) -> bool {
        self.attributes().is_new()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_lifecycle(&self, lifecycle: HostLifecycle) {
        self.with_runtime(|r| r.lifecycle = lifecycle);
    }
}

/// An ordered group of replica hosts.
#[derive(Debug)]
pub struct Shard {
    pub name: String,
    pub index: usize,
    pub hosts: Vec<Arc<Host>>,
}

/// A named ClickHouse cluster of shards.
#[derive(Debug)]
pub struct Cluster {
    pub name: String,
    pub index: usize,
    pub zookeeper: ZookeeperSpec,
    pub secret_source: ClusterSecretSource,
    pub secret_value: Option<String>,
    pub shards: Vec<Arc<Shard>>,
}

impl Cluster {
    pub fn host_count(&self) -> usize {
        self.shards.iter().map(|s| s.hosts.len()).sum()
    }
}

/// Per-pass shared runtime of an installation.
#[derive(Debug)]
pub struct InstallationRuntime {
    /// The normalized installation of the previous completed pass.
    /// None only on the first reconcile of this resource.
    pub ancestor: Option<Arc<Installation>>,
    /// Serializes common config map reconciles against background readers.
    pub common_config_lock: tokio::sync::Mutex<()>,
    pub status: Mutex<ClickHouseInstallationStatus>,
}

/// The normalized installation tree.
#[derive(Debug)]
pub struct Installation {
    pub namespace: String,
    pub name: String,
    pub generation: i64,
    pub stopped: bool,
    pub defaults: DefaultsSpec,
    pub reconciling: ReconcilingSpec,
    pub clusters: Vec<Arc<Cluster>>,
    pub runtime: InstallationRuntime,
}

impl Installation {
    pub fn get_ancestor(&self) -> Option<&Arc<Installation>> {
        self.runtime.ancestor.as_ref()
    }

    /// Visit every host in installation order.
    pub fn walk_hosts(&self, mut f: impl FnMut(&Arc<Host>)) {
        for cluster in &self.clusters {
            for shard in &cluster.shards {
                for host in &shard.hosts {
                    f(host);
                }
            }
        }
    }

    /// All hosts, flattened in installation order.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        let mut hosts = Vec::new();
        self.walk_hosts(|h| hosts.push(h.clone()));
        hosts
    }

    /// All shards in installation order, each paired with its owning
    /// cluster. The shard fan-out operates on this flattened list, not per
    /// cluster.
    pub fn shards(&self) -> Vec<(Arc<Cluster>, Arc<Shard>)> {
        let mut shards = Vec::new();
        for cluster in &self.clusters {
            for shard in &cluster.shards {
                shards.push((cluster.clone(), shard.clone()));
            }
        }
        shards
    }

    /// Find a host by its address within this installation.
    pub fn find_host(&self, address: &Address) -> Option<Arc<Host>> {
        let cluster = self.clusters.get(address.cluster_index)?;
        if cluster.name != address.cluster_name {
            return None;
        }
        let shard = cluster.shards.get(address.shard_index)?;
        shard.hosts.get(address.replica_index).cloned()
    }

    pub fn host_count(&self) -> usize {
        self.clusters.iter().map(|c| c.host_count()).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.clusters.iter().map(|c| c.shards.len()).sum()
    }

    /// Sum reconcile attributes over all hosts.
    pub fn count_attributes(&self) -> ReconcileAttributesCounters {
        let mut counters = ReconcileAttributesCounters::default();
        self.walk_hosts(|host| counters.account(&host.attributes()));
        counters
    }

    pub fn with_status<T>(&self, f: impl FnOnce(&mut ClickHouseInstallationStatus) -> T) -> T {
        let mut guard = self
            .runtime
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Snapshot of the current in-memory status.
    pub fn status_snapshot(&self) -> ClickHouseInstallationStatus {
        self.with_status(|s| s.clone())
    }

    pub fn namespace_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn host(ci: usize, si: usize, ri: usize) -> Arc<Host> {
        Arc::new(Host {
            name: format!("chi-test-c{ci}-{si}-{ri}"),
            address: Address {
                namespace: "default".to_string(),
                chi_name: "test".to_string(),
                cluster_name: format!("c{ci}"),
                cluster_index: ci,
                shard_name: si.to_string(),
                shard_index: si,
                replica_index: ri,
            },
            replicas_in_shard: 2,
            stopped: false,
            settings_digest: String::new(),
            attributes: Mutex::new(ReconcileAttributes::default()),
            runtime: Mutex::new(HostRuntime::default()),
        })
    }

    fn installation() -> Installation {
        let clusters = vec![Arc::new(Cluster {
            name: "c0".to_string(),
            index: 0,
            zookeeper: ZookeeperSpec::default(),
            secret_source: ClusterSecretSource::None,
            secret_value: None,
            shards: vec![
                Arc::new(Shard {
                    name: "0".to_string(),
                    index: 0,
                    hosts: vec![host(0, 0, 0), host(0, 0, 1)],
                }),
                Arc::new(Shard {
                    name: "1".to_string(),
                    index: 1,
                    hosts: vec![host(0, 1, 0), host(0, 1, 1)],
                }),
            ],
        })];
        Installation {
            namespace: "default".to_string(),
            name: "test".to_string(),
            generation: 1,
            stopped: false,
            defaults: DefaultsSpec::default(),
            reconciling: ReconcilingSpec::default(),
            clusters,
            runtime: InstallationRuntime {
                ancestor: None,
                common_config_lock: tokio::sync::Mutex::new(()),
                status: Mutex::new(ClickHouseInstallationStatus::default()),
            },
        }
    }

    #[test]
    fn test_walk_hosts_order() {
        let chi = installation();
        let mut names = Vec::new();
        chi.walk_hosts(|h| names.push(h.name.clone()));
        assert_eq!(
            names,
            vec![
                "chi-test-c0-0-0",
                "chi-test-c0-0-1",
                "chi-test-c0-1-0",
                "chi-test-c0-1-1"
            ]
        );
        assert_eq!(chi.host_count(), 4);
        assert_eq!(chi.shard_count(), 2);
    }

    #[test]
    fn test_shards_flatten_with_owning_cluster() {
        let chi = installation();
        let shards = chi.shards();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].0.name, "c0");
        assert_eq!(shards[0].1.index, 0);
        assert_eq!(shards[1].1.index, 1);
    }

    #[test]
    fn test_first_host_detection() {
        let chi = installation();
        let hosts = chi.hosts();
        assert!(hosts[0].is_first_in_installation());
        assert!(!hosts[1].is_first_in_installation());
        assert!(!hosts[2].is_first_in_installation());
    }

    #[test]
    fn test_add_only_counters() {
        let chi = installation();
        chi.walk_hosts(|h| h.with_attributes(|a| a.set_add()));
        assert!(chi.count_attributes().add_only());

        chi.hosts()[1].with_attributes(|a| a.set_modify());
        assert!(!chi.count_attributes().add_only());
    }

    #[test]
    fn test_unset_add() {
        let chi = installation();
        let hosts = chi.hosts();
        hosts[0].with_attributes(|a| a.set_add());
        assert!(hosts[0].attributes().is_add());
        hosts[0].with_attributes(|a| a.unset_add());
        assert!(!hosts[0].attributes().is_add());
    }

    #[test]
    fn test_find_host() {
        let chi = installation();
        let address = chi.hosts()[3].address.clone();
        let found = chi.find_host(&address).unwrap();
        assert_eq!(found.name, "chi-test-c0-1-1");
    }
}

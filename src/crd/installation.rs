//! ClickHouseInstallation Custom Resource Definition.
//!
//! Defines the ClickHouseInstallation (CHI) CRD describing a ClickHouse
//! deployment as a hierarchy of clusters, shards and replicas. The raw spec
//! is normalized into a `model::topology::Installation` before reconciling.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Maximum number of entries retained in the status action/error logs.
pub const MAX_STATUS_LOG_ENTRIES: usize = 10;

/// ClickHouseInstallation is a custom resource describing a ClickHouse
/// deployment.
///
/// Example:
/// ```yaml
/// apiVersion: clickhouse.example.com/v1
/// kind: ClickHouseInstallation
/// metadata:
///   name: demo
/// spec:
///   clusters:
///     - name: main
///       layout:
///         shardsCount: 2
///         replicasCount: 2
///       zookeeper:
///         nodes:
///           - host: zookeeper.zoo.svc
///         root: /clickhouse/demo
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "clickhouse.example.com",
    version = "v1",
    kind = "ClickHouseInstallation",
    plural = "clickhouseinstallations",
    shortname = "chi",
    status = "ClickHouseInstallationStatus",
    namespaced,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Clusters", "type":"integer", "jsonPath":".status.clustersCount"}"#,
    printcolumn = r#"{"name":"Hosts", "type":"integer", "jsonPath":".status.hostsCount"}"#,
    printcolumn = r#"{"name":"Completed", "type":"integer", "jsonPath":".status.hostsCompletedCount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClickHouseInstallationSpec {
    /// When true the installation keeps its Kubernetes objects but scales
    /// all StatefulSets to zero and removes the installation entry service.
    #[serde(default)]
    pub stopped: bool,

    /// Defaults applied to every host that does not override them.
    #[serde(default)]
    pub defaults: DefaultsSpec,

    /// Per-installation reconcile behavior overrides.
    #[serde(default)]
    pub reconciling: ReconcilingSpec,

    /// Named ClickHouse clusters of this installation.
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
}

/// Host-level defaults.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsSpec {
    /// ClickHouse server container image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Size of the data volume claim, e.g. "10Gi".
    #[serde(default = "default_storage")]
    pub storage: String,

    /// Optional storage class name for data volume claims.
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl Default for DefaultsSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            storage: default_storage(),
            storage_class: None,
        }
    }
}

fn default_image() -> String {
    "clickhouse/clickhouse-server:24.8".to_string()
}

fn default_storage() -> String {
    "10Gi".to_string()
}

/// Reconcile behavior overrides.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilingSpec {
    /// Force a two-phase (scale to zero, then up) restart of every modified
    /// host during the next reconcile.
    #[serde(default)]
    pub force_restart: bool,
}

/// A named ClickHouse cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name. Defaults to a positional name when omitted.
    #[serde(default)]
    pub name: String,

    /// Zookeeper coordination config for replicated tables.
    #[serde(default)]
    pub zookeeper: ZookeeperSpec,

    /// Inter-node authentication secret config.
    #[serde(default)]
    pub secret: ClusterSecretSpec,

    /// Shard/replica layout.
    #[serde(default)]
    pub layout: LayoutSpec,
}

/// Zookeeper connection config for a cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperSpec {
    /// Zookeeper ensemble nodes.
    #[serde(default)]
    pub nodes: Vec<ZookeeperNode>,

    /// Root path for this installation, e.g. "/clickhouse/demo".
    #[serde(default)]
    pub root: String,
}

impl ZookeeperSpec {
    /// True when no Zookeeper ensemble is configured.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A single Zookeeper ensemble member.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZookeeperNode {
    /// Hostname of the ensemble member.
    pub host: String,

    /// Client port, defaults to 2181.
    #[serde(default = "default_zookeeper_port")]
    pub port: i32,
}

fn default_zookeeper_port() -> i32 {
    2181
}

/// Inter-node secret configuration of a cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSecretSpec {
    /// Where the secret value comes from.
    #[serde(default)]
    pub source: ClusterSecretSource,

    /// Literal secret value, used when source is `Manual`.
    #[serde(default)]
    pub value: Option<String>,
}

/// Source of the cluster inter-node secret.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSecretSource {
    /// No inter-node secret.
    #[default]
    None,
    /// The operator generates and owns a Secret object.
    Auto,
    /// The user supplies the value in the spec.
    Manual,
}

/// Shard/replica layout of a cluster.
///
/// Either give `shardsCount`/`replicasCount` and let normalization expand
/// them, or list explicit `shards` (explicit entries win).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSpec {
    /// Number of shards to generate when `shards` is not given.
    #[serde(default)]
    pub shards_count: Option<i32>,

    /// Default number of replicas per shard.
    #[serde(default)]
    pub replicas_count: Option<i32>,

    /// Explicit shard list.
    #[serde(default)]
    pub shards: Vec<ShardSpec>,
}

/// A single shard.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    /// Shard name. Defaults to its positional index.
    #[serde(default)]
    pub name: Option<String>,

    /// Replica count override for this shard.
    #[serde(default)]
    pub replicas_count: Option<i32>,

    /// Explicit replica list.
    #[serde(default)]
    pub replicas: Vec<ReplicaSpec>,
}

/// A single replica of a shard.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Replica name. Defaults to its positional index.
    #[serde(default)]
    pub name: Option<String>,
}

/// Status subresource of a ClickHouseInstallation.
///
/// Persisted with main-fields-only merge patches so that fields written by
/// other actors are not clobbered mid-reconcile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClickHouseInstallationStatus {
    /// Overall state: "InProgress", "Completed" or "Aborted".
    #[serde(default)]
    pub status: String,

    /// Most recent reconcile action.
    #[serde(default)]
    pub action: Option<String>,

    /// Recent reconcile actions, newest first, capped.
    #[serde(default)]
    pub actions: Vec<String>,

    /// Most recent error.
    #[serde(default)]
    pub error: Option<String>,

    /// Recent errors, newest first, capped.
    #[serde(default)]
    pub errors: Vec<String>,

    /// Number of clusters in the normalized installation.
    #[serde(default)]
    pub clusters_count: i32,

    /// Number of shards in the normalized installation.
    #[serde(default)]
    pub shards_count: i32,

    /// Total number of hosts in the normalized installation.
    #[serde(default)]
    pub hosts_count: i32,

    /// Number of hosts fully reconciled in the current pass.
    #[serde(default)]
    pub hosts_completed_count: i32,

    /// Hosts the action plan marked as additions.
    #[serde(default)]
    pub hosts_added_count: i32,

    /// Hosts the action plan marked as modified.
    #[serde(default)]
    pub hosts_updated_count: i32,

    /// Hosts the action plan marked for removal.
    #[serde(default)]
    pub hosts_deleted_count: i32,

    /// Hosts that hit a fatal error in the current pass.
    #[serde(default)]
    pub hosts_failed_count: i32,

    /// Generation last fully reconciled.
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl ClickHouseInstallationStatus {
    /// Record a reconcile action, keeping the log capped.
    pub fn push_action(&mut self, action: impl Into<String>) {
        let action = action.into();
        self.action = Some(action.clone());
        self.actions.insert(0, action);
        self.actions.truncate(MAX_STATUS_LOG_ENTRIES);
    }

    /// Record a reconcile error, keeping the log capped.
    pub fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error = Some(error.clone());
        self.errors.insert(0, error);
        self.errors.truncate(MAX_STATUS_LOG_ENTRIES);
    }

    /// Mark one more host as completed. Never exceeds `hosts_count`.
    pub fn host_completed(&mut self) {
        if self.hosts_completed_count < self.hosts_count {
            self.hosts_completed_count += 1;
        }
    }

    /// Mark one more host as failed.
    pub fn host_failed(&mut self) {
        self.hosts_failed_count += 1;
    }
}

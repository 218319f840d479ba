//! Common resource generation utilities.
//!
//! Label/annotation conventions, object naming, and the operator identity
//! stamped onto every managed object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::model::topology::{Cluster, Host, Installation};

/// Application label pair identifying objects managed by this operator.
pub const LABEL_APP_NAME: &str = "clickhouse.example.com/app";
pub const LABEL_APP_VALUE: &str = "chop";

/// Installation/topology ownership labels, also used by cleanup.
pub const LABEL_CHI: &str = "clickhouse.example.com/chi";
pub const LABEL_CLUSTER: &str = "clickhouse.example.com/cluster";
pub const LABEL_SHARD: &str = "clickhouse.example.com/shard";
pub const LABEL_HOST: &str = "clickhouse.example.com/host";

/// Operator build identity labels.
pub const LABEL_OPERATOR_VERSION: &str = "clickhouse.example.com/chop";
pub const LABEL_OPERATOR_COMMIT: &str = "clickhouse.example.com/chop-commit";
pub const LABEL_OPERATOR_DATE: &str = "clickhouse.example.com/chop-date";

/// Cluster membership marker. Present on a host pod and, as an annotation,
/// on the host service exactly while the host is included in traffic.
/// Installation and cluster services select on it, so removing it drains the
/// host from their endpoints.
pub const LABEL_READY: &str = "clickhouse.example.com/ready";
pub const ANNOTATION_READY: &str = "clickhouse.example.com/ready";
pub const READY_VALUE: &str = "yes";

/// StatefulSet template annotation carrying the host settings digest.
pub const ANNOTATION_SETTINGS_DIGEST: &str = "clickhouse.example.com/settings-digest";

/// Operator build identity, injected at startup and stamped on every
/// managed object and on the operator's own pod tree.
#[derive(Clone, Debug)]
pub struct OperatorInfo {
    pub version: String,
    pub commit: String,
    pub build_date: String,
}

impl OperatorInfo {
    /// Label values must not contain colons; the build date keeps its
    /// precision with dots instead.
    pub fn build_date_label(&self) -> String {
        self.build_date.replace(':', ".")
    }
}

/// Labels identifying the operator build, merged into every managed object.
pub fn operator_labels(operator: &OperatorInfo) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP_NAME.to_string(), LABEL_APP_VALUE.to_string());
    labels.insert(LABEL_OPERATOR_VERSION.to_string(), operator.version.clone());
    labels.insert(LABEL_OPERATOR_COMMIT.to_string(), operator.commit.clone());
    labels.insert(LABEL_OPERATOR_DATE.to_string(), operator.build_date_label());
    labels
}

/// Standard labels for installation-scoped objects.
pub fn chi_labels(chi: &Installation, operator: &OperatorInfo) -> BTreeMap<String, String> {
    let mut labels = operator_labels(operator);
    labels.insert(LABEL_CHI.to_string(), chi.name.clone());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "clickhouse-operator".to_string(),
    );
    labels
}

/// Standard labels for cluster-scoped objects.
pub fn cluster_labels(
    chi: &Installation,
    cluster: &Cluster,
    operator: &OperatorInfo,
) -> BTreeMap<String, String> {
    let mut labels = chi_labels(chi, operator);
    labels.insert(LABEL_CLUSTER.to_string(), cluster.name.clone());
    labels
}

/// Standard labels for host-scoped objects.
pub fn host_labels(
    chi: &Installation,
    host: &Host,
    operator: &OperatorInfo,
) -> BTreeMap<String, String> {
    let mut labels = chi_labels(chi, operator);
    labels.insert(LABEL_CLUSTER.to_string(), host.address.cluster_name.clone());
    labels.insert(LABEL_SHARD.to_string(), host.address.shard_name.clone());
    labels.insert(LABEL_HOST.to_string(), host.name.clone());
    labels
}

/// Selector matching exactly the pod of one host.
pub fn host_selector_labels(chi: &Installation, host: &Host) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CHI.to_string(), chi.name.clone());
    labels.insert(LABEL_HOST.to_string(), host.name.clone());
    labels
}

/// Selector matching every included (traffic-ready) pod of the installation.
pub fn chi_ready_selector_labels(chi: &Installation) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CHI.to_string(), chi.name.clone());
    labels.insert(LABEL_READY.to_string(), READY_VALUE.to_string());
    labels
}

/// Selector matching every included pod of one cluster.
pub fn cluster_ready_selector_labels(
    chi: &Installation,
    cluster: &Cluster,
) -> BTreeMap<String, String> {
    let mut labels = chi_ready_selector_labels(chi);
    labels.insert(LABEL_CLUSTER.to_string(), cluster.name.clone());
    labels
}

// Naming conventions. Object names are derived from the topology address and
// stay stable across reconciles.

pub fn chi_service_name(chi: &Installation) -> String {
    format!("clickhouse-{}", chi.name)
}

pub fn cluster_service_name(chi: &Installation, cluster: &Cluster) -> String {
    format!("cluster-{}-{}", chi.name, cluster.name)
}

pub fn shard_service_name(chi: &Installation, cluster: &Cluster, shard_index: usize) -> String {
    format!("shard-{}-{}-{}", chi.name, cluster.name, shard_index)
}

pub fn host_service_name(host: &Host) -> String {
    host.name.clone()
}

pub fn statefulset_name(host: &Host) -> String {
    host.name.clone()
}

/// Host StatefulSets run a single replica, so the pod name is fixed.
pub fn pod_name(host: &Host) -> String {
    format!("{}-0", host.name)
}

pub fn host_fqdn(host: &Host) -> String {
    format!(
        "{}.{}.{}.svc",
        pod_name(host),
        host_service_name(host),
        host.address.namespace
    )
}

pub fn config_map_common_name(chi: &Installation) -> String {
    format!("chi-{}-common-configd", chi.name)
}

pub fn config_map_users_name(chi: &Installation) -> String {
    format!("chi-{}-common-usersd", chi.name)
}

pub fn config_map_host_name(host: &Host) -> String {
    format!(
        "chi-{}-deploy-confd-{}-{}-{}",
        host.address.chi_name,
        host.address.cluster_name,
        host.address.shard_index,
        host.address.replica_index
    )
}

pub fn cluster_auto_secret_name(chi: &Installation, cluster: &Cluster) -> String {
    format!("chi-{}-cluster-{}-secret", chi.name, cluster.name)
}

pub fn pdb_name(chi: &Installation, cluster: &Cluster) -> String {
    format!("chi-{}-{}", chi.name, cluster.name)
}

// Ready label/annotation mutation helpers. They report whether the metadata
// actually changed so callers can skip no-op updates.

/// Add the ready label. Returns true when the metadata changed.
pub fn append_ready_label(meta: &mut ObjectMeta) -> bool {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels
        .insert(LABEL_READY.to_string(), READY_VALUE.to_string())
        .as_deref()
        != Some(READY_VALUE)
}

/// Remove the ready label. Returns true when the metadata changed.
pub fn delete_ready_label(meta: &mut ObjectMeta) -> bool {
    meta.labels
        .as_mut()
        .is_some_and(|labels| labels.remove(LABEL_READY).is_some())
}

/// Add the ready annotation. Returns true when the metadata changed.
pub fn append_ready_annotation(meta: &mut ObjectMeta) -> bool {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations
        .insert(ANNOTATION_READY.to_string(), READY_VALUE.to_string())
        .as_deref()
        != Some(READY_VALUE)
}

/// Remove the ready annotation. Returns true when the metadata changed.
pub fn delete_ready_annotation(meta: &mut ObjectMeta) -> bool {
    meta.annotations
        .as_mut()
        .is_some_and(|annotations| annotations.remove(ANNOTATION_READY).is_some())
}

//! ConfigMap generation for ClickHouse installations.
//!
//! Three flavors:
//! - **Common**: remote servers and Zookeeper sections shared by every host.
//! - **Users**: user/profile settings shared by every host.
//! - **Host**: per-host macros identifying the replica within the topology.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::model::topology::{Host, Installation};
use crate::resources::common::{
    OperatorInfo, chi_labels, config_map_common_name, config_map_host_name,
    config_map_users_name, host_fqdn, host_labels,
};

/// Options for common config generation.
///
/// The preliminary reconcile pass writes the config without host entries so
/// the map exists before any pod starts; the final pass rewrites it with the
/// realized topology.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommonConfigOptions {
    pub exclude_hosts: bool,
}

/// Common config shared by all hosts: remote servers and Zookeeper sections.
pub fn generate_common_config_map(
    chi: &Installation,
    operator: &OperatorInfo,
    options: Option<&CommonConfigOptions>,
) -> ConfigMap {
    let exclude_hosts = options.is_some_and(|o| o.exclude_hosts);

    let mut data = BTreeMap::new();
    data.insert(
        "remote_servers.xml".to_string(),
        remote_servers_xml(chi, exclude_hosts),
    );
    if let Some(zookeeper) = zookeeper_xml(chi) {
        data.insert("zookeeper.xml".to_string(), zookeeper);
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_common_name(chi)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(chi_labels(chi, operator)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// User settings shared by all hosts.
pub fn generate_users_config_map(chi: &Installation, operator: &OperatorInfo) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("users.xml".to_string(), users_xml());

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_users_name(chi)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(chi_labels(chi, operator)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Per-host macros identifying the replica within the topology.
pub fn generate_host_config_map(
    chi: &Installation,
    host: &Host,
    operator: &OperatorInfo,
) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("macros.xml".to_string(), macros_xml(chi, host));

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_host_name(host)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(host_labels(chi, host, operator)),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

fn remote_servers_xml(chi: &Installation, exclude_hosts: bool) -> String {
    let mut xml = String::from("<clickhouse>\n  <remote_servers>\n");
    for cluster in &chi.clusters {
        xml.push_str(&format!("    <{}>\n", cluster.name));
        if let Some(secret) = cluster_secret_entry(cluster) {
            xml.push_str(&secret);
        }
        for shard in &cluster.shards {
            xml.push_str("      <shard>\n        <internal_replication>true</internal_replication>\n");
            if !exclude_hosts {
                for host in &shard.hosts {
                    xml.push_str(&format!(
                        "        <replica>\n          <host>{}</host>\n          <port>9000</port>\n        </replica>\n",
                        host_fqdn(host)
                    ));
                }
            }
            xml.push_str("      </shard>\n");
        }
        xml.push_str(&format!("    </{}>\n", cluster.name));
    }
    xml.push_str("  </remote_servers>\n</clickhouse>\n");
    xml
}

fn cluster_secret_entry(cluster: &crate::model::topology::Cluster) -> Option<String> {
    use crate::crd::ClusterSecretSource;
    match cluster.secret_source {
        ClusterSecretSource::None => None,
        // The actual value is mounted from the cluster secret; the config
        // references it through the environment.
        ClusterSecretSource::Auto | ClusterSecretSource::Manual => Some(
            "      <secret from_env=\"CLICKHOUSE_INTERNODE_SECRET\"></secret>\n".to_string(),
        ),
    }
}

fn zookeeper_xml(chi: &Installation) -> Option<String> {
    let zookeeper = chi
        .clusters
        .iter()
        .map(|c| &c.zookeeper)
        .find(|zk| !zk.is_empty())?;

    let mut xml = String::from("<clickhouse>\n  <zookeeper>\n");
    for node in &zookeeper.nodes {
        xml.push_str(&format!(
            "    <node>\n      <host>{}</host>\n      <port>{}</port>\n    </node>\n",
            node.host, node.port
        ));
    }
    if !zookeeper.root.is_empty() {
        xml.push_str(&format!("    <root>{}</root>\n", zookeeper.root));
    }
    xml.push_str("  </zookeeper>\n</clickhouse>\n");
    Some(xml)
}

fn users_xml() -> String {
    String::from(
        "<clickhouse>\n  <users>\n    <default>\n      <networks>\n        <ip>::/0</ip>\n      </networks>\n      <profile>default</profile>\n      <quota>default</quota>\n    </default>\n  </users>\n</clickhouse>\n",
    )
}

fn macros_xml(chi: &Installation, host: &Host) -> String {
    format!(
        "<clickhouse>\n  <macros>\n    <installation>{}</installation>\n    <cluster>{}</cluster>\n    <shard>{}</shard>\n    <replica>{}</replica>\n  </macros>\n</clickhouse>\n",
        chi.name, host.address.cluster_name, host.address.shard_index, host.name
    )
}

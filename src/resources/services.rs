//! Service generation for ClickHouse installations.
//!
//! Four service flavors exist in the topology:
//! - **Installation service**: the client entry point for the whole CHI,
//!   selecting only included (traffic-ready) pods.
//! - **Cluster service**: per-cluster entry point, also ready-gated.
//! - **Shard service**: headless per-shard service used by distributed
//!   queries.
//! - **Host service**: headless per-host service providing the stable
//!   network identity of one replica.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::model::topology::{Cluster, Host, Installation, Shard};
use crate::resources::common::{
    OperatorInfo, chi_labels, chi_ready_selector_labels, chi_service_name, cluster_labels,
    cluster_ready_selector_labels, cluster_service_name, host_labels, host_selector_labels,
    host_service_name, shard_service_name,
};

/// ClickHouse HTTP interface port.
const HTTP_PORT: i32 = 8123;
/// ClickHouse native protocol port.
const TCP_PORT: i32 = 9000;
/// Replication/interserver port.
const INTERSERVER_PORT: i32 = 9009;

fn client_ports() -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some("http".to_string()),
            port: HTTP_PORT,
            target_port: Some(IntOrString::String("http".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ServicePort {
            name: Some("tcp".to_string()),
            port: TCP_PORT,
            target_port: Some(IntOrString::String("tcp".to_string())),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
    ]
}

fn host_ports() -> Vec<ServicePort> {
    let mut ports = client_ports();
    ports.push(ServicePort {
        name: Some("interserver".to_string()),
        port: INTERSERVER_PORT,
        target_port: Some(IntOrString::String("interserver".to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    });
    ports
}

/// Entry point service for the whole installation.
///
/// Selects on the ready label, so excluded hosts drop out of the endpoints
/// while they are being reconciled.
pub fn generate_chi_service(chi: &Installation, operator: &OperatorInfo) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(chi_service_name(chi)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(chi_labels(chi, operator)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(chi_ready_selector_labels(chi)),
            ports: Some(client_ports()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Per-cluster entry point, ready-gated like the installation service.
pub fn generate_cluster_service(
    chi: &Installation,
    cluster: &Cluster,
    operator: &OperatorInfo,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(cluster_service_name(chi, cluster)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(cluster_labels(chi, cluster, operator)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(cluster_ready_selector_labels(chi, cluster)),
            ports: Some(client_ports()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless per-shard service used by distributed queries.
pub fn generate_shard_service(
    chi: &Installation,
    cluster: &Cluster,
    shard: &Shard,
    operator: &OperatorInfo,
) -> Service {
    let mut selector = cluster_ready_selector_labels(chi, cluster);
    selector.insert(
        crate::resources::common::LABEL_SHARD.to_string(),
        shard.name.clone(),
    );

    Service {
        metadata: ObjectMeta {
            name: Some(shard_service_name(chi, cluster, shard.index)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(cluster_labels(chi, cluster, operator)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(client_ports()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless per-host service, the stable network identity of one replica.
///
/// `publish_not_ready_addresses` lets replication peers resolve the host
/// before ClickHouse reports ready, which matters during cluster bootstrap.
pub fn generate_host_service(
    chi: &Installation,
    host: &Host,
    operator: &OperatorInfo,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(host_service_name(host)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(host_labels(chi, host, operator)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(host_selector_labels(chi, host)),
            ports: Some(host_ports()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

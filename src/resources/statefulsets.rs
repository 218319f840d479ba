//! StatefulSet generation for ClickHouse hosts.
//!
//! Every host runs as its own single-replica StatefulSet so the operator can
//! drive each replica through the exclude/update/include protocol
//! independently. The pod template carries the host settings digest as an
//! annotation, which is how a later pass detects configuration drift that
//! requires a restart.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::model::topology::{Host, Installation};
use crate::resources::common::{
    ANNOTATION_SETTINGS_DIGEST, OperatorInfo, config_map_common_name, config_map_host_name,
    config_map_users_name, host_labels, host_selector_labels, host_service_name,
    statefulset_name,
};

/// Name of the data volume claim template.
pub const DATA_VOLUME_NAME: &str = "data";

/// Generate the StatefulSet for one host.
///
/// `shutdown` scales the set to zero replicas; used as the first phase of a
/// forced restart. A stopped installation also runs at zero replicas.
pub fn generate_host_statefulset(
    chi: &Installation,
    host: &Host,
    operator: &OperatorInfo,
    shutdown: bool,
) -> StatefulSet {
    let replicas = if shutdown || chi.stopped { 0 } else { 1 };

    let mut template_annotations = BTreeMap::new();
    template_annotations.insert(
        ANNOTATION_SETTINGS_DIGEST.to_string(),
        host.settings_digest.clone(),
    );

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(host)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(host_labels(chi, host, operator)),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: Some(host_service_name(host)),
            selector: LabelSelector {
                match_labels: Some(host_selector_labels(chi, host)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(host_labels(chi, host, operator)),
                    annotations: Some(template_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![clickhouse_container(chi)],
                    volumes: Some(config_volumes(chi, host)),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![data_volume_claim(chi)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn clickhouse_container(chi: &Installation) -> Container {
    Container {
        name: "clickhouse".to_string(),
        image: Some(chi.defaults.image.clone()),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: 8123,
                ..Default::default()
            },
            ContainerPort {
                name: Some("tcp".to_string()),
                container_port: 9000,
                ..Default::default()
            },
            ContainerPort {
                name: Some("interserver".to_string()),
                container_port: 9009,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: "/var/lib/clickhouse".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "common-configd".to_string(),
                mount_path: "/etc/clickhouse-server/config.d".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "common-usersd".to_string(),
                mount_path: "/etc/clickhouse-server/users.d".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "deploy-confd".to_string(),
                mount_path: "/etc/clickhouse-server/conf.d".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn config_volumes(chi: &Installation, host: &Host) -> Vec<Volume> {
    vec![
        config_map_volume("common-configd", &config_map_common_name(chi)),
        config_map_volume("common-usersd", &config_map_users_name(chi)),
        config_map_volume("deploy-confd", &config_map_host_name(host)),
    ]
}

fn config_map_volume(volume_name: &str, config_map_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn data_volume_claim(chi: &Installation) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(chi.defaults.storage.clone()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: chi.defaults.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

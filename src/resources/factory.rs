//! Object factory.
//!
//! The `Creator` turns the normalized topology into desired Kubernetes
//! objects. A builder returning `None` means the object is intentionally
//! omitted for that topology node, which is not an error.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;

use crate::model::topology::{Cluster, Host, Installation, Shard};
use crate::resources::common::OperatorInfo;
use crate::resources::configmaps::{
    CommonConfigOptions, generate_common_config_map, generate_host_config_map,
    generate_users_config_map,
};
use crate::resources::pdb::generate_pod_disruption_budget;
use crate::resources::secrets::generate_cluster_auto_secret;
use crate::resources::services::{
    generate_chi_service, generate_cluster_service, generate_host_service,
    generate_shard_service,
};
use crate::resources::statefulsets::generate_host_statefulset;

/// Factory producing desired objects for one installation.
#[derive(Clone)]
pub struct Creator {
    chi: Arc<Installation>,
    operator: OperatorInfo,
}

impl Creator {
    pub fn new(chi: Arc<Installation>, operator: OperatorInfo) -> Self {
        Self { chi, operator }
    }

    pub fn installation(&self) -> &Arc<Installation> {
        &self.chi
    }

    /// Entry point service for the whole installation.
    pub fn service_cr(&self) -> Option<Service> {
        Some(generate_chi_service(&self.chi, &self.operator))
    }

    pub fn service_cluster(&self, cluster: &Cluster) -> Option<Service> {
        Some(generate_cluster_service(&self.chi, cluster, &self.operator))
    }

    pub fn service_shard(&self, cluster: &Cluster, shard: &Shard) -> Option<Service> {
        Some(generate_shard_service(&self.chi, cluster, shard, &self.operator))
    }

    pub fn service_host(&self, host: &Host) -> Option<Service> {
        Some(generate_host_service(&self.chi, host, &self.operator))
    }

    pub fn config_map_common(&self, options: Option<&CommonConfigOptions>) -> ConfigMap {
        generate_common_config_map(&self.chi, &self.operator, options)
    }

    pub fn config_map_users(&self) -> ConfigMap {
        generate_users_config_map(&self.chi, &self.operator)
    }

    pub fn config_map_host(&self, host: &Host) -> ConfigMap {
        generate_host_config_map(&self.chi, host, &self.operator)
    }

    /// None unless the cluster declares an operator-owned secret.
    pub fn cluster_auto_secret(&self, cluster: &Cluster) -> Option<Secret> {
        generate_cluster_auto_secret(&self.chi, cluster, &self.operator)
    }

    pub fn pod_disruption_budget(&self, cluster: &Cluster) -> PodDisruptionBudget {
        generate_pod_disruption_budget(&self.chi, cluster, &self.operator)
    }

    pub fn stateful_set(&self, host: &Host, shutdown: bool) -> StatefulSet {
        generate_host_statefulset(&self.chi, host, &self.operator, shutdown)
    }
}

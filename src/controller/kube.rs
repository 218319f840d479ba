//! Typed facade over the Kubernetes API.
//!
//! Uniform CRUD for every object kind the reconcilers touch, plus
//! host-addressed getters that translate topology hosts into object names.
//! NotFound is surfaced as `Option::None` by the `*_opt` helpers so callers
//! can branch without re-classifying errors.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, ObjectList, PostParams};
use kube::{Api, Client};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::{Result, is_not_found_kube};
use crate::model::topology::Host;
use crate::resources::common::{host_service_name, pod_name, statefulset_name};

/// Get an object, mapping NotFound to None.
pub async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found_kube(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create an object.
pub async fn create<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

/// Replace an object. The caller is responsible for carrying over the
/// resource version when the API requires it.
pub async fn update<K>(api: &Api<K>, name: &str, obj: &K) -> Result<K>
where
    K: Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    Ok(api.replace(name, &PostParams::default(), obj).await?)
}

/// Delete an object, treating NotFound as success.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found_kube(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// List objects matching a label selector.
pub async fn list_labeled<K>(api: &Api<K>, selector: &str) -> Result<ObjectList<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api
        .list(&ListParams::default().labels(selector))
        .await?)
}

/// Typed API accessors for everything the core reconciles.
#[derive(Clone)]
pub struct KubeAdapter {
    client: Client,
}

impl KubeAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn stateful_sets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn pdbs(&self, namespace: &str) -> Api<PodDisruptionBudget> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn replica_sets(&self, namespace: &str) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// The pod of a host, when it exists.
    pub async fn get_host_pod(&self, host: &Host) -> Result<Option<Pod>> {
        get_opt(&self.pods(&host.address.namespace), &pod_name(host)).await
    }

    /// The per-host service, when it exists.
    pub async fn get_host_service(&self, host: &Host) -> Result<Option<Service>> {
        get_opt(&self.services(&host.address.namespace), &host_service_name(host)).await
    }

    /// The host's StatefulSet, when it exists.
    pub async fn get_host_statefulset(&self, host: &Host) -> Result<Option<StatefulSet>> {
        get_opt(
            &self.stateful_sets(&host.address.namespace),
            &statefulset_name(host),
        )
        .await
    }
}

//! Cluster auto-secret generation.
//!
//! When a cluster declares `secret.source: auto` the operator owns a Secret
//! carrying the inter-node authentication value. The value is derived
//! deterministically from the cluster identity so repeated reconciles do not
//! churn it; the secret reconciler additionally never updates an existing
//! secret in place.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::ClusterSecretSource;
use crate::model::topology::{Cluster, Installation};
use crate::resources::common::{OperatorInfo, cluster_auto_secret_name, cluster_labels};

/// Key under which the inter-node secret value is stored.
pub const SECRET_KEY: &str = "secret";

/// Generate the auto-secret for a cluster, or None when the cluster does not
/// use an operator-owned secret.
pub fn generate_cluster_auto_secret(
    chi: &Installation,
    cluster: &Cluster,
    operator: &OperatorInfo,
) -> Option<Secret> {
    if cluster.secret_source != ClusterSecretSource::Auto {
        return None;
    }

    let mut string_data = BTreeMap::new();
    string_data.insert(SECRET_KEY.to_string(), derive_secret_value(chi, cluster));

    Some(Secret {
        metadata: ObjectMeta {
            name: Some(cluster_auto_secret_name(chi, cluster)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(cluster_labels(chi, cluster, operator)),
            ..Default::default()
        },
        string_data: Some(string_data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

fn derive_secret_value(chi: &Installation, cluster: &Cluster) -> String {
    let mut hasher = DefaultHasher::new();
    (&chi.namespace, &chi.name, &cluster.name).hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::resources::test_support::{operator, test_installation, test_installation_auto_secret};

    #[test]
    fn test_no_secret_without_auto_source() {
        let chi = test_installation("demo", 1, 1);
        let cluster = chi.clusters[0].clone();
        assert!(generate_cluster_auto_secret(&chi, &cluster, &operator()).is_none());
    }

    #[test]
    fn test_auto_secret_shape() {
        let chi = test_installation_auto_secret("demo", 1, 1);
        let cluster = chi.clusters[0].clone();
        let secret = generate_cluster_auto_secret(&chi, &cluster, &operator()).unwrap();

        assert_eq!(
            secret.metadata.name,
            Some("chi-demo-cluster-main-secret".to_string())
        );
        let data = secret.string_data.unwrap();
        assert!(data.contains_key(SECRET_KEY));
        assert_eq!(data.get(SECRET_KEY).unwrap().len(), 16);
    }

    #[test]
    fn test_auto_secret_value_is_stable() {
        let chi = test_installation_auto_secret("demo", 1, 1);
        let cluster = chi.clusters[0].clone();
        let a = generate_cluster_auto_secret(&chi, &cluster, &operator()).unwrap();
        let b = generate_cluster_auto_secret(&chi, &cluster, &operator()).unwrap();
        assert_eq!(a.string_data, b.string_data);
    }
}

//! PodDisruptionBudget generation for ClickHouse clusters.
//!
//! One PDB per cluster keeps voluntary disruptions (node drains, upgrades)
//! from taking out more than one replica at a time, which is what the
//! exclude/include protocol also assumes.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::model::topology::{Cluster, Installation};
use crate::resources::common::{
    LABEL_CHI, LABEL_CLUSTER, OperatorInfo, cluster_labels, pdb_name,
};

/// Generate a PodDisruptionBudget for one cluster.
pub fn generate_pod_disruption_budget(
    chi: &Installation,
    cluster: &Cluster,
    operator: &OperatorInfo,
) -> PodDisruptionBudget {
    let mut selector = std::collections::BTreeMap::new();
    selector.insert(LABEL_CHI.to_string(), chi.name.clone());
    selector.insert(LABEL_CLUSTER.to_string(), cluster.name.clone());

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(chi, cluster)),
            namespace: Some(chi.namespace.clone()),
            labels: Some(cluster_labels(chi, cluster, operator)),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::resources::test_support::{operator, test_installation};

    #[test]
    fn test_pdb_allows_one_unavailable() {
        let chi = test_installation("demo", 2, 2);
        let cluster = chi.clusters[0].clone();
        let pdb = generate_pod_disruption_budget(&chi, &cluster, &operator());

        assert_eq!(pdb.metadata.name, Some("chi-demo-main".to_string()));
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
    }

    #[test]
    fn test_pdb_selector_scopes_to_cluster() {
        let chi = test_installation("demo", 1, 1);
        let cluster = chi.clusters[0].clone();
        let pdb = generate_pod_disruption_budget(&chi, &cluster, &operator());

        let labels = pdb
            .spec
            .unwrap()
            .selector
            .unwrap()
            .match_labels
            .unwrap();
        assert_eq!(labels.get(LABEL_CHI), Some(&"demo".to_string()));
        assert_eq!(labels.get(LABEL_CLUSTER), Some(&"main".to_string()));
    }
}

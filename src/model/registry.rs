//! Per-pass object registries.
//!
//! Each reconcile pass tracks which Kubernetes objects it reconciled and
//! which failed. After a successful pass, objects labeled for the
//! installation but absent from the reconciled registry are stranded and get
//! deleted by cleanup.

use std::collections::BTreeMap;

/// Kinds of objects the operator produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    ServiceCr,
    ServiceCluster,
    ServiceShard,
    ServiceHost,
    ConfigMapCommon,
    ConfigMapUsers,
    ConfigMapHost,
    ClusterAutoSecret,
    Pdb,
    StatefulSet,
}

impl ObjectKind {
    /// Coarse API kind grouping used when matching live objects.
    pub fn api_kind(&self) -> ApiKind {
        match self {
            ObjectKind::ServiceCr
            | ObjectKind::ServiceCluster
            | ObjectKind::ServiceShard
            | ObjectKind::ServiceHost => ApiKind::Service,
            ObjectKind::ConfigMapCommon
            | ObjectKind::ConfigMapUsers
            | ObjectKind::ConfigMapHost => ApiKind::ConfigMap,
            ObjectKind::ClusterAutoSecret => ApiKind::Secret,
            ObjectKind::Pdb => ApiKind::Pdb,
            ObjectKind::StatefulSet => ApiKind::StatefulSet,
        }
    }
}

/// API-level object kinds, the granularity cleanup works at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiKind {
    Service,
    ConfigMap,
    Secret,
    Pdb,
    StatefulSet,
}

/// Registry entry identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ApiKind,
    pub namespace: String,
    pub name: String,
}

/// A set of object references keyed by kind and namespaced name.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    entries: BTreeMap<ObjectRef, ObjectKind>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ObjectKind, namespace: &str, name: &str) {
        self.entries.insert(
            ObjectRef {
                kind: kind.api_kind(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kind,
        );
    }

    pub fn contains(&self, kind: ApiKind, namespace: &str, name: &str) -> bool {
        self.entries.contains_key(&ObjectRef {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn refs(&self) -> impl Iterator<Item = &ObjectRef> {
        self.entries.keys()
    }
}

/// Live objects not present in the registry: candidates for deletion.
pub fn orphaned<'a>(existing: &'a [ObjectRef], reconciled: &ObjectRegistry) -> Vec<&'a ObjectRef> {
    existing
        .iter()
        .filter(|obj| !reconciled.contains(obj.kind, &obj.namespace, &obj.name))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_contains() {
        let mut registry = ObjectRegistry::new();
        registry.register(ObjectKind::ServiceHost, "default", "chi-demo-main-0-0");
        registry.register(ObjectKind::ConfigMapCommon, "default", "chi-demo-common");

        assert!(registry.contains(ApiKind::Service, "default", "chi-demo-main-0-0"));
        assert!(registry.contains(ApiKind::ConfigMap, "default", "chi-demo-common"));
        assert!(!registry.contains(ApiKind::Service, "default", "other"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_service_kinds_share_api_kind() {
        let mut registry = ObjectRegistry::new();
        registry.register(ObjectKind::ServiceCr, "default", "clickhouse-demo");
        // Lookup by API kind, regardless of which factory kind produced it.
        assert!(registry.contains(ApiKind::Service, "default", "clickhouse-demo"));
    }

    #[test]
    fn test_orphaned_difference() {
        let mut reconciled = ObjectRegistry::new();
        reconciled.register(ObjectKind::ServiceHost, "default", "keep");

        let existing = vec![
            ObjectRef {
                kind: ApiKind::Service,
                namespace: "default".to_string(),
                name: "keep".to_string(),
            },
            ObjectRef {
                kind: ApiKind::Service,
                namespace: "default".to_string(),
                name: "stranded".to_string(),
            },
        ];

        let orphans = orphaned(&existing, &reconciled);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].name, "stranded");
    }
}

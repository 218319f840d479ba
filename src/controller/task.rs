//! Per-pass reconcile task.
//!
//! A fresh task is allocated for every reconcile pass. It owns the object
//! factory and the two registries tracking what the pass produced; the
//! registries drive cleanup once the pass succeeds.

use std::sync::Mutex;

use crate::model::registry::{ApiKind, ObjectKind, ObjectRegistry};
use crate::resources::factory::Creator;

/// State scoped to a single reconcile pass.
pub struct Task {
    pub creator: Creator,
    reconciled: Mutex<ObjectRegistry>,
    failed: Mutex<ObjectRegistry>,
}

impl Task {
    pub fn new(creator: Creator) -> Self {
        Self {
            creator,
            reconciled: Mutex::new(ObjectRegistry::new()),
            failed: Mutex::new(ObjectRegistry::new()),
        }
    }

    pub fn register_reconciled(&self, kind: ObjectKind, namespace: &str, name: &str) {
        self.reconciled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(kind, namespace, name);
    }

    pub fn register_failed(&self, kind: ObjectKind, namespace: &str, name: &str) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(kind, namespace, name);
    }

    /// Register into the reconciled or failed registry based on outcome.
    pub fn register_outcome<T, E>(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        result: &Result<T, E>,
    ) {
        match result {
            Ok(_) => self.register_reconciled(kind, namespace, name),
            Err(_) => self.register_failed(kind, namespace, name),
        }
    }

    pub fn is_reconciled(&self, kind: ApiKind, namespace: &str, name: &str) -> bool {
        self.reconciled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(kind, namespace, name)
    }

    /// Whether the pass touched this object at all, successfully or not.
    /// Cleanup must not delete objects that merely failed to update; they
    /// still belong to the installation.
    pub fn is_registered(&self, kind: ApiKind, namespace: &str, name: &str) -> bool {
        self.is_reconciled(kind, namespace, name)
            || self
                .failed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(kind, namespace, name)
    }

    pub fn reconciled_count(&self) -> usize {
        self.reconciled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

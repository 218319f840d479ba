//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the Kubernetes client, event recorder identity, operator build info,
//! runtime configuration, the schemer and Zookeeper contracts, and the
//! ancestor cache carrying the previously reconciled installation of each
//! resource.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio_util::sync::CancellationToken;

use crate::controller::schemer::Schemer;
use crate::controller::zookeeper::ZookeeperConnector;
use crate::health::HealthState;
use crate::model::topology::Installation;
use crate::resources::common::OperatorInfo;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "clickhouse-operator";

/// Event reasons emitted by the reconciliation pipeline.
pub const EVENT_REASON_RECONCILE_STARTED: &str = "ReconcileStarted";
pub const EVENT_REASON_RECONCILE_COMPLETED: &str = "ReconcileCompleted";
pub const EVENT_REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const EVENT_REASON_UPDATE_FAILED: &str = "UpdateFailed";
pub const EVENT_REASON_PROGRESS_HOSTS_COMPLETED: &str = "ProgressHostsCompleted";

/// Event actions attached to published events.
pub const EVENT_ACTION_RECONCILE: &str = "Reconcile";
pub const EVENT_ACTION_UPDATE: &str = "Update";
pub const EVENT_ACTION_PROGRESS: &str = "Progress";

/// Runtime knobs of the shard fan-out, read once at startup.
#[derive(Clone, Copy, Debug)]
pub struct ReconcileRuntimeConfig {
    /// Number of worker threads for concurrent shard processing. At least 1.
    pub reconcile_shards_threads_number: usize,
    /// Percentage of shards allowed to reconcile concurrently, 1-100.
    pub reconcile_shards_max_concurrency_percent: usize,
}

impl Default for ReconcileRuntimeConfig {
    fn default() -> Self {
        Self {
            reconcile_shards_threads_number: 1,
            reconcile_shards_max_concurrency_percent: 50,
        }
    }
}

impl ReconcileRuntimeConfig {
    /// Read the config from the environment, keeping defaults for absent or
    /// malformed values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reconcile_shards_threads_number: env_usize(
                "RECONCILE_SHARDS_THREADS_NUMBER",
                defaults.reconcile_shards_threads_number,
            ),
            reconcile_shards_max_concurrency_percent: env_usize(
                "RECONCILE_SHARDS_MAX_CONCURRENCY_PERCENT",
                defaults.reconcile_shards_max_concurrency_percent,
            ),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Per-pass cancellation handle. Cancellation is cooperative and is never an
/// error: every non-trivial step checks it at entry and returns success.
#[derive(Clone)]
pub struct ReconcileCx {
    cancel: CancellationToken,
}

impl ReconcileCx {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Operator build identity stamped on managed objects
    pub operator: OperatorInfo,
    /// Shard fan-out configuration
    pub config: ReconcileRuntimeConfig,
    /// SQL-side operations contract
    pub schemer: Arc<dyn Schemer>,
    /// Zookeeper path-ensure contract; None disables the best-effort step
    pub zookeeper: Option<Arc<dyn ZookeeperConnector>>,
    /// Root cancellation token; reconcile passes derive children from it
    pub shutdown: CancellationToken,
    /// Normalized installations of the last completed pass per resource
    ancestors: Arc<RwLock<HashMap<(String, String), Arc<Installation>>>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        operator: OperatorInfo,
        config: ReconcileRuntimeConfig,
        schemer: Arc<dyn Schemer>,
        zookeeper: Option<Arc<dyn ZookeeperConnector>>,
    ) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("OPERATOR_POD_NAME").ok(),
            },
            health_state,
            operator,
            config,
            schemer,
            zookeeper,
            shutdown: CancellationToken::new(),
            ancestors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a reconcile-scoped cancellation context.
    pub fn reconcile_cx(&self) -> ReconcileCx {
        ReconcileCx::new(self.shutdown.child_token())
    }

    /// Typed API facade bound to this context's client.
    pub fn kube(&self) -> crate::controller::kube::KubeAdapter {
        crate::controller::kube::KubeAdapter::new(self.client.clone())
    }

    /// The normalized installation of the previous completed pass.
    /// None only before the first completed reconcile of this resource.
    pub fn get_ancestor(&self, namespace: &str, name: &str) -> Option<Arc<Installation>> {
        self.ancestors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Record the normalized installation of a completed pass.
    pub fn set_ancestor(&self, chi: Arc<Installation>) {
        self.ancestors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((chi.namespace.clone(), chi.name.clone()), chi);
    }

    /// Drop the recorded ancestor, e.g. when the resource is deleted.
    pub fn forget_ancestor(&self, namespace: &str, name: &str) {
        self.ancestors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Object reference of an installation for event publication.
    fn chi_object_ref(chi: &Installation) -> ObjectReference {
        ObjectReference {
            api_version: Some("clickhouse.example.com/v1".to_string()),
            kind: Some("ClickHouseInstallation".to_string()),
            name: Some(chi.name.clone()),
            namespace: Some(chi.namespace.clone()),
            ..Default::default()
        }
    }

    /// Publish a normal event for an installation
    pub async fn publish_normal_event(
        &self,
        chi: &Installation,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = Self::chi_object_ref(chi);
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a warning event for an installation
    pub async fn publish_warning_event(
        &self,
        chi: &Installation,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = Self::chi_object_ref(chi);
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish warning event");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_defaults() {
        let config = ReconcileRuntimeConfig::default();
        assert_eq!(config.reconcile_shards_threads_number, 1);
        assert_eq!(config.reconcile_shards_max_concurrency_percent, 50);
    }

    #[test]
    fn test_reconcile_cx_cancellation() {
        let token = CancellationToken::new();
        let cx = ReconcileCx::new(token.clone());
        assert!(!cx.cancelled());

        token.cancel();
        assert!(cx.cancelled());
    }
}

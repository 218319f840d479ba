//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for per-installation metrics (namespace + name)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct InstallationLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for InstallationLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Installation reconcile passes started
    pub chi_reconciles_started: Family<InstallationLabels, Counter>,
    /// Installation reconcile passes completed successfully
    pub chi_reconciles_completed: Family<InstallationLabels, Counter>,
    /// Installation reconcile passes aborted by the abort sentinel
    pub chi_reconciles_aborted: Family<InstallationLabels, Counter>,
    /// Installation reconcile duration histogram
    pub chi_reconcile_duration_seconds: Family<InstallationLabels, Histogram>,
    /// Host reconciles started
    pub host_reconciles_started: Family<InstallationLabels, Counter>,
    /// Host reconciles completed successfully
    pub host_reconciles_completed: Family<InstallationLabels, Counter>,
    /// Host reconciles that hit a fatal error
    pub host_reconciles_errors: Family<InstallationLabels, Counter>,
    /// Hosts restarted through the two-phase shutdown path
    pub host_reconciles_restarts: Family<InstallationLabels, Counter>,
    /// Host reconcile duration histogram
    pub host_reconcile_duration_seconds: Family<InstallationLabels, Histogram>,
    /// Whether an installation is currently monitored (1) or in flux (0)
    pub chi_monitored: Family<InstallationLabels, Gauge>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let chi_reconciles_started = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_chi_reconciles_started",
            "Number of CHI reconcile passes started",
            chi_reconciles_started.clone(),
        );

        let chi_reconciles_completed = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_chi_reconciles_completed",
            "Number of CHI reconcile passes completed successfully",
            chi_reconciles_completed.clone(),
        );

        let chi_reconciles_aborted = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_chi_reconciles_aborted",
            "Number of CHI reconcile passes aborted",
            chi_reconciles_aborted.clone(),
        );

        let chi_reconcile_duration_seconds =
            Family::<InstallationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.1, 2.0, 15))
            });
        registry.register(
            "chop_chi_reconcile_duration_seconds",
            "Duration of CHI reconcile passes in seconds",
            chi_reconcile_duration_seconds.clone(),
        );

        let host_reconciles_started = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_host_reconciles_started",
            "Number of host reconciles started",
            host_reconciles_started.clone(),
        );

        let host_reconciles_completed = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_host_reconciles_completed",
            "Number of host reconciles completed successfully",
            host_reconciles_completed.clone(),
        );

        let host_reconciles_errors = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_host_reconciles_errors",
            "Number of host reconciles that failed",
            host_reconciles_errors.clone(),
        );

        let host_reconciles_restarts = Family::<InstallationLabels, Counter>::default();
        registry.register(
            "chop_host_reconciles_restarts",
            "Number of hosts restarted via two-phase shutdown",
            host_reconciles_restarts.clone(),
        );

        let host_reconcile_duration_seconds =
            Family::<InstallationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.1, 2.0, 15))
            });
        registry.register(
            "chop_host_reconcile_duration_seconds",
            "Duration of host reconciles in seconds",
            host_reconcile_duration_seconds.clone(),
        );

        let chi_monitored = Family::<InstallationLabels, Gauge>::default();
        registry.register(
            "chop_chi_monitored",
            "Whether a CHI is currently monitored (1) or excluded while in flux (0)",
            chi_monitored.clone(),
        );

        Self {
            chi_reconciles_started,
            chi_reconciles_completed,
            chi_reconciles_aborted,
            chi_reconcile_duration_seconds,
            host_reconciles_started,
            host_reconciles_completed,
            host_reconciles_errors,
            host_reconciles_restarts,
            host_reconcile_duration_seconds,
            chi_monitored,
            registry,
        }
    }

    fn labels(namespace: &str, name: &str) -> InstallationLabels {
        InstallationLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Touch every counter for the installation so zero values are exported
    /// before the first increment.
    pub fn chi_init_zero_values(&self, namespace: &str, name: &str) {
        let labels = Self::labels(namespace, name);
        self.chi_reconciles_started.get_or_create(&labels);
        self.chi_reconciles_completed.get_or_create(&labels);
        self.chi_reconciles_aborted.get_or_create(&labels);
        self.host_reconciles_started.get_or_create(&labels);
        self.host_reconciles_completed.get_or_create(&labels);
        self.host_reconciles_errors.get_or_create(&labels);
        self.host_reconciles_restarts.get_or_create(&labels);
    }

    pub fn chi_reconcile_started(&self, namespace: &str, name: &str) {
        self.chi_reconciles_started
            .get_or_create(&Self::labels(namespace, name))
            .inc();
    }

    pub fn chi_reconcile_completed(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = Self::labels(namespace, name);
        self.chi_reconciles_completed.get_or_create(&labels).inc();
        self.chi_reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn chi_reconcile_aborted(&self, namespace: &str, name: &str) {
        self.chi_reconciles_aborted
            .get_or_create(&Self::labels(namespace, name))
            .inc();
    }

    pub fn host_reconcile_started(&self, namespace: &str, name: &str) {
        self.host_reconciles_started
            .get_or_create(&Self::labels(namespace, name))
            .inc();
    }

    pub fn host_reconcile_completed(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = Self::labels(namespace, name);
        self.host_reconciles_completed.get_or_create(&labels).inc();
        self.host_reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn host_reconcile_error(&self, namespace: &str, name: &str) {
        self.host_reconciles_errors
            .get_or_create(&Self::labels(namespace, name))
            .inc();
    }

    pub fn host_reconcile_restart(&self, namespace: &str, name: &str) {
        self.host_reconciles_restarts
            .get_or_create(&Self::labels(namespace, name))
            .inc();
    }

    pub fn set_monitored(&self, namespace: &str, name: &str, monitored: bool) {
        self.chi_monitored
            .get_or_create(&Self::labels(namespace, name))
            .set(i64::from(monitored));
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controller)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Installations currently included in monitoring
    monitored: Mutex<HashSet<(String, String)>>,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            monitored: Mutex::new(HashSet::new()),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Include an installation in monitoring.
    pub fn add_to_monitoring(&self, namespace: &str, name: &str) {
        self.monitored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((namespace.to_string(), name.to_string()));
        self.metrics.set_monitored(namespace, name, true);
    }

    /// Exclude an installation from monitoring while it is in flux.
    pub fn exclude_from_monitoring(&self, namespace: &str, name: &str) {
        self.monitored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(namespace.to_string(), name.to_string()));
        self.metrics.set_monitored(namespace, name, false);
    }

    /// Whether an installation is currently monitored.
    pub fn is_monitored(&self, namespace: &str, name: &str) -> bool {
        self.monitored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(namespace.to_string(), name.to_string()))
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
/// This is a simple check - if we can respond, we're alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(port = 8080, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

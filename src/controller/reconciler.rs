//! Reconciliation entry point for ClickHouseInstallation.
//!
//! Bridges the kube-rs controller runtime to the reconciliation pipeline:
//! finalizer management, deletion handling, and the error policy. The actual
//! work happens in `controller::chi`.

use std::sync::Arc;
use std::time::Duration;

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::controller::{chi, context::Context, error::Error};
use crate::crd::ClickHouseInstallation;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "clickhouse-operator";

/// Finalizer name for graceful deletion
pub const FINALIZER: &str = "clickhouse.example.com/finalizer";

/// Reconcile a ClickHouseInstallation
///
/// This is the main reconciliation function called by the controller.
/// It handles the full lifecycle: creation, updates, and deletion.
pub async fn reconcile(
    obj: Arc<ClickHouseInstallation>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling ClickHouseInstallation");

    let api: Api<ClickHouseInstallation> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace).await;
    }

    // Ensure finalizer is present
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let cx = ctx.reconcile_cx();
    chi::reconcile_chi(&cx, &ctx, &obj).await?;

    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<ClickHouseInstallation>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Handle deletion of a ClickHouseInstallation
async fn handle_deletion(
    obj: &ClickHouseInstallation,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");

    chi::delete_installation_objects(ctx, namespace, &name).await;
    ctx.forget_ancestor(namespace, &name);

    // Remove finalizer
    let api: Api<ClickHouseInstallation> = Api::namespaced(ctx.client.clone(), namespace);
    remove_finalizer(&api, &name).await?;

    Ok(Action::await_change())
}

/// Add finalizer to resource
async fn add_finalizer(api: &Api<ClickHouseInstallation>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Remove finalizer from resource
async fn remove_finalizer(api: &Api<ClickHouseInstallation>, name: &str) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": null
        }
    });
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

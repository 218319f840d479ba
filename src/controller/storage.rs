//! PVC reconciliation and data-loss detection.
//!
//! Hosts keep their data on PVCs created from the StatefulSet volume claim
//! templates. A host that previously existed must still have its claims; a
//! missing or Lost claim means the data is gone, which is not an error by
//! itself but a signal forcing StatefulSet recreation and table
//! re-migration.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, info};

use crate::controller::context::{Context, ReconcileCx};
use crate::controller::error::{Error, Result};
use crate::controller::kube::{get_opt, update};
use crate::model::topology::Host;
use crate::resources::common::statefulset_name;
use crate::resources::statefulsets::DATA_VOLUME_NAME;

/// PVC phase reported when the bound volume is gone.
const PHASE_LOST: &str = "Lost";

/// Name of the claim a StatefulSet template produces for the single replica.
fn claim_name(template_name: &str, host: &Host) -> String {
    format!("{}-{}-0", template_name, statefulset_name(host))
}

/// Reconcile the host's PVCs against the desired StatefulSet templates.
///
/// Returns `Error::DataLoss` when an existing host has lost a claim. Creation
/// of absent claims for new hosts is left to the StatefulSet controller.
pub async fn reconcile_host_pvcs(cx: &ReconcileCx, ctx: &Context, host: &Host) -> Result<()> {
    if cx.cancelled() {
        return Ok(());
    }

    let desired = host
        .with_runtime(|r| r.desired_statefulset.clone())
        .ok_or_else(|| Error::MissingField("desired StatefulSet".to_string()))?;
    let templates = desired
        .spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.clone())
        .unwrap_or_default();

    let api = ctx.kube().pvcs(&host.address.namespace);

    for template in &templates {
        let Some(template_name) = template.metadata.name.as_deref() else {
            continue;
        };
        let name = claim_name(template_name, host);

        match get_opt(&api, &name).await? {
            Some(cur) => {
                if cur.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(PHASE_LOST) {
                    return Err(Error::DataLoss(name));
                }
                reconcile_claim_size(ctx, host, &cur, template, &name).await?;
            }
            None => {
                if !host.is_new() {
                    // An existing host without its claim has lost its data.
                    return Err(Error::DataLoss(name));
                }
                // New host: the StatefulSet controller creates the claim.
                debug!(pvc = %name, host = %host.name, "claim absent for new host, left to StatefulSet");
            }
        }
    }

    Ok(())
}

/// Propagate a changed storage request from the template onto the live claim.
async fn reconcile_claim_size(
    ctx: &Context,
    host: &Host,
    cur: &PersistentVolumeClaim,
    template: &PersistentVolumeClaim,
    name: &str,
) -> Result<()> {
    let desired_request = template
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .cloned();
    let cur_request = cur
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .cloned();

    let Some(desired_request) = desired_request else {
        return Ok(());
    };
    if cur_request.as_ref() == Some(&desired_request) {
        return Ok(());
    }

    info!(
        pvc = %name,
        host = %host.name,
        request = %desired_request.0,
        "updating claim storage request"
    );
    let mut updated = cur.clone();
    if let Some(requests) = updated
        .spec
        .as_mut()
        .and_then(|s| s.resources.as_mut())
        .and_then(|r| r.requests.as_mut())
    {
        requests.insert("storage".to_string(), desired_request);
    }
    let api = ctx.kube().pvcs(&host.address.namespace);
    update(&api, name, &updated).await?;
    Ok(())
}

/// Record whether the host has any data volume at all.
pub async fn set_has_data(ctx: &Context, host: &Host) -> Result<()> {
    let api = ctx.kube().pvcs(&host.address.namespace);
    let name = claim_name(DATA_VOLUME_NAME, host);
    let has_data = get_opt(&api, &name).await?.is_some();
    host.with_runtime(|r| r.has_data = has_data);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::model::topology::{Address, HostRuntime, ReconcileAttributes};

    fn host() -> Host {
        Host {
            name: "chi-demo-main-0-0".to_string(),
            address: Address {
                namespace: "default".to_string(),
                chi_name: "demo".to_string(),
                cluster_name: "main".to_string(),
                cluster_index: 0,
                shard_name: "0".to_string(),
                shard_index: 0,
                replica_index: 0,
            },
            replicas_in_shard: 1,
            stopped: false,
            settings_digest: String::new(),
            attributes: Mutex::new(ReconcileAttributes::default()),
            runtime: Mutex::new(HostRuntime::default()),
        }
    }

    #[test]
    fn test_claim_name_follows_statefulset_convention() {
        assert_eq!(
            claim_name(DATA_VOLUME_NAME, &host()),
            "data-chi-demo-main-0-0-0"
        );
    }
}

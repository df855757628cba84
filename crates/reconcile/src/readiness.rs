//! Deployment readiness aggregation.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use rudder_apply::Manifest;
use rudder_core::{Result, StackStatus};
use rudder_kubehub::ResourceClient;
use tracing::{debug, error, info};

pub const WORKLOAD_KIND: &str = "Deployment";

/// A deployment is available iff it reports `Available=True`.
pub fn deployment_available(d: &Deployment) -> bool {
    status_available(d.status.as_ref())
}

fn status_available(status: Option<&DeploymentStatus>) -> bool {
    status
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Available" && c.status == "True"))
        .unwrap_or(false)
}

/// Mark `DeploymentsAvailable` from the live state of every workload in the
/// manifest. Scanning stops at the first workload that is missing or not yet
/// available. Fetch errors other than not-found and unreadable deployment
/// statuses are returned after marking the condition not ready.
pub async fn check_deployments<C: ResourceClient + ?Sized>(
    client: &C,
    manifest: &Manifest,
    status: &mut StackStatus,
) -> Result<()> {
    for res in manifest.of_kind(WORKLOAD_KIND) {
        let id = res.id();
        let live = match client.get(&id).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => {
                debug!(deployment = %id, "deployment not observed yet");
                status.mark_deployments_not_ready();
                return Ok(());
            }
            Err(e) => {
                error!(deployment = %id, error = %e, "error fetching deployment");
                status.mark_deployments_not_ready();
                return Err(e);
            }
        };
        let observed: Option<DeploymentStatus> = match live.get("status").map(|v| serde_json::from_value(v.clone())) {
            Some(Ok(s)) => Some(s),
            Some(Err(e)) => {
                error!(deployment = %id, error = %e, "unreadable deployment status");
                status.mark_deployments_not_ready();
                return Err(e.into());
            }
            None => None,
        };
        if !status_available(observed.as_ref()) {
            debug!(deployment = %id, "deployment not ready");
            status.mark_deployments_not_ready();
            return Ok(());
        }
    }
    info!("all deployments are available");
    status.mark_deployments_available();
    Ok(())
}

//! TunnelEndpoint controller
//!
//! Each reconcile converges the tunnel for one TunnelEndpoint through its
//! driver and records the outcome in the status. Deletion is held by a
//! finalizer until the driver has removed the peer.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use peerlink_common::crd::{Connection, TunnelEndpoint, TunnelEndpointPhase, TunnelEndpointStatus};
use peerlink_common::kube_utils::has_finalizer;
use peerlink_common::retry::retry_on_conflict;
use peerlink_common::{Error, Result};
use peerlink_network::context::backoff_key;
use peerlink_network::store::is_deleting;
use tracing::{debug, error, info, instrument, warn};

use crate::context::GatewayContext;

/// Finalizer held by the gateway on every TunnelEndpoint
pub const GATEWAY_FINALIZER: &str = "net.peerlink.dev/gateway";

/// Periodic re-check of a converged tunnel
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Reconcile a TunnelEndpoint
#[instrument(
    skip(tep, ctx),
    fields(tunnel_endpoint = %tep.name_any(), cluster_id = %tep.spec.cluster_id, backend = %tep.spec.backend_type)
)]
pub async fn reconcile(tep: Arc<TunnelEndpoint>, ctx: Arc<GatewayContext>) -> Result<Action> {
    if is_deleting(tep.as_ref()) {
        return disconnect(&tep, &ctx).await;
    }

    ensure_finalizer(&tep, &ctx).await?;

    let Some(driver) = ctx.registry.get(&tep.spec.backend_type) else {
        warn!(known = ?ctx.registry.backends(), "No driver for backend");
        let status = TunnelEndpointStatus {
            phase: TunnelEndpointPhase::Error,
            connection: Some(Connection::error(format!(
                "unknown backend type '{}'",
                tep.spec.backend_type
            ))),
        };
        persist_status(&tep, status, &ctx).await?;
        return Ok(Action::await_change());
    };

    match driver.connect_to_endpoint(&tep).await {
        Ok(connection) => {
            let status = TunnelEndpointStatus {
                phase: TunnelEndpointPhase::Ready,
                connection: Some(connection),
            };
            if persist_status(&tep, status, &ctx).await? {
                info!(endpoint_ip = %tep.spec.endpoint_ip, "Tunnel connected");
            }
            ctx.backoff.reset(&backoff_key(tep.as_ref()));
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(failure) => {
            let status = TunnelEndpointStatus {
                phase: TunnelEndpointPhase::Error,
                connection: Some(failure.connection),
            };
            persist_status(&tep, status, &ctx).await?;
            Err(failure.error)
        }
    }
}

/// Error policy for the TunnelEndpoint controller
pub fn error_policy(tep: Arc<TunnelEndpoint>, error: &Error, ctx: Arc<GatewayContext>) -> Action {
    let delay = ctx.backoff.next(&backoff_key(tep.as_ref()));
    error!(
        ?error,
        tunnel_endpoint = %tep.name_any(),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn disconnect(tep: &TunnelEndpoint, ctx: &GatewayContext) -> Result<Action> {
    if !has_finalizer(tep, GATEWAY_FINALIZER) {
        return Ok(Action::await_change());
    }
    match ctx.registry.get(&tep.spec.backend_type) {
        Some(driver) => {
            driver.disconnect_from_endpoint(tep).await?;
            info!("Tunnel disconnected");
        }
        None => debug!("Unknown backend, nothing to disconnect"),
    }
    remove_finalizer(tep, ctx).await?;
    ctx.backoff.reset(&backoff_key(tep));
    Ok(Action::await_change())
}

/// Write `status` unless it is already current; returns whether it was written
async fn persist_status(
    tep: &TunnelEndpoint,
    status: TunnelEndpointStatus,
    ctx: &GatewayContext,
) -> Result<bool> {
    if tep.status.as_ref() == Some(&status) {
        return Ok(false);
    }
    let name = tep.name_any();
    let namespace = tep.namespace().unwrap_or_else(|| ctx.namespace.clone());
    retry_on_conflict(&ctx.conflict_retry, "update_tunnel_endpoint_status", || async {
        let Some(mut latest) = ctx.store.get_tunnel_endpoint(&namespace, &name).await? else {
            return Ok(false);
        };
        if latest.status.as_ref() == Some(&status) {
            return Ok(false);
        }
        latest.status = Some(status.clone());
        ctx.store.replace_tunnel_endpoint_status(&latest).await?;
        debug!(phase = %status.phase, "Status updated");
        Ok(true)
    })
    .await
}

async fn ensure_finalizer(tep: &TunnelEndpoint, ctx: &GatewayContext) -> Result<()> {
    if has_finalizer(tep, GATEWAY_FINALIZER) {
        return Ok(());
    }
    let name = tep.name_any();
    let namespace = tep.namespace().unwrap_or_else(|| ctx.namespace.clone());
    retry_on_conflict(&ctx.conflict_retry, "add_gateway_finalizer", || async {
        let mut latest = ctx
            .store
            .get_tunnel_endpoint(&namespace, &name)
            .await?
            .ok_or_else(|| Error::not_ready("TunnelEndpoint", format!("{name} not found")))?;
        if has_finalizer(&latest, GATEWAY_FINALIZER) {
            return Ok(());
        }
        latest
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(GATEWAY_FINALIZER.to_string());
        ctx.store.replace_tunnel_endpoint(&latest).await?;
        debug!(tunnel_endpoint = %name, "Finalizer added");
        Ok(())
    })
    .await
}

async fn remove_finalizer(tep: &TunnelEndpoint, ctx: &GatewayContext) -> Result<()> {
    let name = tep.name_any();
    let namespace = tep.namespace().unwrap_or_else(|| ctx.namespace.clone());
    retry_on_conflict(&ctx.conflict_retry, "remove_gateway_finalizer", || async {
        let Some(mut latest) = ctx.store.get_tunnel_endpoint(&namespace, &name).await? else {
            return Ok(());
        };
        if !has_finalizer(&latest, GATEWAY_FINALIZER) {
            return Ok(());
        }
        if let Some(finalizers) = latest.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != GATEWAY_FINALIZER);
        }
        ctx.store.replace_tunnel_endpoint(&latest).await?;
        Ok(())
    })
    .await
}

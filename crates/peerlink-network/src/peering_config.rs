//! PeeringConfig controller
//!
//! Feeds the cluster-wide network parameters into the IPAM and the local
//! parameters, and reports the allocated external CIDR back in the status.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use peerlink_common::crd::{PeeringConfig, PeeringConfigStatus};
use peerlink_common::{Error, Result};
use peerlink_ipam::pool::DEFAULT_POOLS;
use peerlink_ipam::{mapper, Ipam};
use tracing::{error, info, instrument, warn};

use crate::context::{backoff_key, NetworkContext};
use crate::gate::GateSource;

const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Reconcile the PeeringConfig
#[instrument(skip(pc, ctx), fields(peering_config = %pc.name_any()))]
pub async fn reconcile(pc: Arc<PeeringConfig>, ctx: Arc<NetworkContext>) -> Result<Action> {
    let spec = &pc.spec;
    let pod_cidr = mapper::parse_cidr(&spec.pod_cidr)?;
    let service_cidr = mapper::parse_cidr(&spec.service_cidr)?;
    let reserved = parse_all(&spec.reserved_subnets)?;
    let mut pools = parse_all(&DEFAULT_POOLS)?;
    pools.extend(parse_all(&spec.additional_pools)?);

    ctx.ipam.set_pod_cidr(pod_cidr).await?;
    ctx.ipam.set_service_cidr(service_cidr).await?;
    let mut problems = sync_pools(&ctx.ipam, &pools).await?;
    problems.extend(sync_reserved(&ctx.ipam, &reserved).await?);
    let external_cidr = ctx
        .ipam
        .ensure_external_cidr(spec.external_cidr_prefix)
        .await?;

    ctx.params
        .set_network(pod_cidr.to_string(), external_cidr.to_string())
        .await;
    ctx.gate.mark(GateSource::NetworkParameters);

    let status = PeeringConfigStatus {
        external_cidr: Some(external_cidr.to_string()),
        message: (!problems.is_empty()).then(|| problems.join("; ")),
        observed_generation: pc.metadata.generation,
    };
    if pc.status.as_ref() != Some(&status) {
        ctx.store
            .update_peering_config_status(&pc.name_any(), &status)
            .await?;
        info!(
            pod_cidr = %pod_cidr,
            external_cidr = %external_cidr,
            "Network parameters applied"
        );
    }

    ctx.backoff.reset(&backoff_key(pc.as_ref()));
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the PeeringConfig controller
pub fn error_policy(pc: Arc<PeeringConfig>, error: &Error, ctx: Arc<NetworkContext>) -> Action {
    let delay = ctx.backoff.next(&backoff_key(pc.as_ref()));
    error!(?error, peering_config = %pc.name_any(), retry_in = ?delay, "reconciliation failed");
    Action::requeue(delay)
}

fn parse_all<S: AsRef<str>>(values: &[S]) -> Result<Vec<Ipv4Net>> {
    values.iter().map(|v| mapper::parse_cidr(v.as_ref())).collect()
}

/// Bring the IPAM pools to `desired`; pools still in use are kept and reported
async fn sync_pools(ipam: &Ipam, desired: &[Ipv4Net]) -> Result<Vec<String>> {
    let mut problems = Vec::new();
    for pool in ipam.pools().await {
        if desired.contains(&pool) {
            continue;
        }
        match ipam.remove_pool(pool).await {
            Ok(()) => info!(pool = %pool, "Pool removed"),
            Err(e @ Error::PoolInUse { .. }) => {
                warn!(pool = %pool, error = %e, "Keeping pool that is still in use");
                problems.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }
    for pool in desired {
        match ipam.add_pool(*pool).await {
            Ok(()) => {}
            Err(e @ Error::CidrOverlap { .. }) => {
                warn!(pool = %pool, error = %e, "Skipping overlapping pool");
                problems.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(problems)
}

/// Bring the reserved set to `desired`; reservations over live allocations
/// are skipped and reported
async fn sync_reserved(ipam: &Ipam, desired: &[Ipv4Net]) -> Result<Vec<String>> {
    let desired: BTreeSet<Ipv4Net> = desired.iter().copied().collect();
    let current: BTreeSet<Ipv4Net> = ipam.reserved().await.into_iter().collect();

    for subnet in current.difference(&desired) {
        ipam.free_explicit(*subnet).await?;
        info!(subnet = %subnet, "Reservation dropped");
    }

    let mut problems = Vec::new();
    for subnet in desired.difference(&current) {
        match ipam.reserve_explicit(*subnet).await {
            Ok(()) => info!(subnet = %subnet, "Subnet reserved"),
            Err(e @ Error::CidrOverlap { .. }) => {
                warn!(subnet = %subnet, error = %e, "Reservation collides with an allocation");
                problems.push(e.to_string());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(problems)
}

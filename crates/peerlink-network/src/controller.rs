//! NetworkConfig controller
//!
//! Drives both directions of the remap handshake and keeps one
//! TunnelEndpoint per peer in sync with them.
//!
//! - Replicated copy (the peer's parameters): allocate local address space
//!   for the peer's CIDRs and record the decision in the copy's status. The
//!   replicator carries that status back to the peer.
//! - Local-origin copy (our parameters): once the peer's decision has been
//!   echoed back into its status, register it with the IPAM.
//! - When both copies are processed, create or update the TunnelEndpoint.
//!
//! Both copies carry [`NETWORK_FINALIZER`]. Deleting either one removes the
//! TunnelEndpoint, waits until it is gone, releases the peer's allocation
//! and only then lets the record go.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use peerlink_common::crd::{
    NetworkConfig, NetworkConfigStatus, TunnelEndpoint, TunnelEndpointSpec,
};
use peerlink_common::kube_utils::{has_finalizer, owner_reference};
use peerlink_common::labels;
use peerlink_common::retry::retry_on_conflict;
use peerlink_common::{Error, Result};
use peerlink_ipam::mapper;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{backoff_key, NetworkContext};
use crate::state::{remote_cluster_id, PeeringState};
use crate::store::is_deleting;

/// Finalizer guarding IPAM release and TunnelEndpoint removal
pub const NETWORK_FINALIZER: &str = "net.peerlink.dev/network-config";

/// Name prefix of generated TunnelEndpoints
pub const TUNNEL_ENDPOINT_GENERATE_NAME: &str = "tunnel-endpoint-";

/// Requeue while the readiness gate is closed
const GATE_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue while waiting for the TunnelEndpoint to disappear
const TEARDOWN_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue after duplicates were removed
const DUPLICATE_REQUEUE: Duration = Duration::from_secs(1);

/// Periodic resync of a converged NetworkConfig
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Reconcile a NetworkConfig
#[instrument(skip(nc, ctx), fields(network_config = %nc.name_any()))]
pub async fn reconcile(nc: Arc<NetworkConfig>, ctx: Arc<NetworkContext>) -> Result<Action> {
    if !ctx.gate.is_open() {
        debug!(pending = ?ctx.gate.pending(), "Local parameters not ready, deferring");
        return Ok(Action::requeue(GATE_REQUEUE));
    }

    let remote = remote_cluster_id(&nc)?;
    let replicated = labels::is_replicated(nc.meta().labels.as_ref());

    if replicated && nc.spec.cluster_id != ctx.cluster_id {
        warn!(
            cluster_id = %remote,
            target = %nc.spec.cluster_id,
            "Replicated NetworkConfig addressed to another cluster, ignoring"
        );
        return Ok(Action::await_change());
    }

    if is_deleting(nc.as_ref()) {
        return teardown(&nc, &remote, replicated, &ctx).await;
    }

    let nc = ensure_finalizer(&nc, &ctx).await?;

    if replicated {
        process_remote(&nc, &remote, &ctx).await?;
    } else {
        match process_local(&nc, &remote, &ctx).await? {
            LocalOutcome::Registered | LocalOutcome::AwaitingEcho => {}
            LocalOutcome::Removed => return Ok(Action::requeue(DUPLICATE_REQUEUE)),
        }
    }

    let state = enforce_tunnel_endpoint(&remote, &ctx).await?;
    debug!(cluster_id = %remote, state = %state, "NetworkConfig reconciled");
    ctx.backoff.reset(&backoff_key(&nc));
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the NetworkConfig controller
pub fn error_policy(nc: Arc<NetworkConfig>, error: &Error, ctx: Arc<NetworkContext>) -> Action {
    let delay = ctx.backoff.next(&backoff_key(nc.as_ref()));
    if error.is_not_ready() {
        debug!(error = %error, network_config = %nc.name_any(), "Waiting on a dependency");
    } else {
        error!(
            ?error,
            network_config = %nc.name_any(),
            retry_in = ?delay,
            "reconciliation failed"
        );
    }
    Action::requeue(delay)
}

// =============================================================================
// Phase R: the peer's parameters
// =============================================================================

/// Allocate space for the peer's CIDRs and publish the decision in the status
async fn process_remote(nc: &NetworkConfig, remote: &str, ctx: &NetworkContext) -> Result<()> {
    let pod_cidr = mapper::parse_cidr(&nc.spec.pod_cidr)?;
    let external_cidr = mapper::parse_cidr(&nc.spec.external_cidr)?;

    let allocation = ctx
        .ipam
        .allocate_for_cluster(remote, pod_cidr, external_cidr)
        .await?;
    let desired = NetworkConfigStatus::processed(
        mapper::format_nat(allocation.remote_pod.and_then(|m| m.nat())),
        mapper::format_nat(allocation.remote_external.and_then(|m| m.nat())),
    );

    let owner = match ctx.store.find_foreign_cluster(remote).await? {
        Some(fc) => owner_reference(&fc, false),
        None => {
            debug!(cluster_id = %remote, "ForeignCluster not found yet, owner reference deferred");
            None
        }
    };

    let name = nc.name_any();
    retry_on_conflict(&ctx.conflict_retry, "process_remote_network_config", || async {
        let Some(mut latest) = ctx.store.get_network_config(&ctx.namespace, &name).await? else {
            return Ok(());
        };

        if let Some(owner) = &owner {
            if add_owner(&mut latest, owner) {
                latest = ctx.store.replace_network_config(&latest).await?;
            }
        }

        if latest.status.as_ref() != Some(&desired) {
            latest.status = Some(desired.clone());
            ctx.store.replace_network_config_status(&latest).await?;
            info!(
                cluster_id = %remote,
                pod_cidr_nat = %desired.pod_cidr_nat,
                external_cidr_nat = %desired.external_cidr_nat,
                "Remote NetworkConfig processed"
            );
        }
        Ok(())
    })
    .await
}

// =============================================================================
// Phase L: our parameters, as decided by the peer
// =============================================================================

enum LocalOutcome {
    /// The peer's decision is registered with the IPAM
    Registered,
    /// The peer has not processed our record yet
    AwaitingEcho,
    /// The record (and any duplicates) were deleted
    Removed,
}

async fn process_local(
    nc: &NetworkConfig,
    remote: &str,
    ctx: &NetworkContext,
) -> Result<LocalOutcome> {
    let locals = live(
        ctx.store
            .list_network_configs(&ctx.namespace, &labels::local_network_config_selector(remote))
            .await?,
    );
    if locals.len() > 1 {
        warn!(
            cluster_id = %remote,
            count = locals.len(),
            "Multiple local NetworkConfigs for one peer, deleting all of them"
        );
        for duplicate in &locals {
            ctx.store
                .delete_network_config(&ctx.namespace, &duplicate.name_any())
                .await?;
        }
        return Ok(LocalOutcome::Removed);
    }

    let peering_active = ctx
        .store
        .find_foreign_cluster(remote)
        .await?
        .is_some_and(|fc| fc.is_peering_active() && !is_deleting(&fc));
    if !peering_active {
        info!(cluster_id = %remote, "Peering no longer active, deleting local NetworkConfig");
        ctx.store
            .delete_network_config(&ctx.namespace, &nc.name_any())
            .await?;
        return Ok(LocalOutcome::Removed);
    }

    let Some(status) = nc.status.as_ref().filter(|s| s.processed) else {
        debug!(cluster_id = %remote, "Waiting for the peer to process our NetworkConfig");
        return Ok(LocalOutcome::AwaitingEcho);
    };

    let pod_nat = mapper::parse_nat(&status.pod_cidr_nat)?;
    let external_nat = mapper::parse_nat(&status.external_cidr_nat)?;
    ctx.ipam
        .register_local_nat(remote, pod_nat, external_nat)
        .await?;
    Ok(LocalOutcome::Registered)
}

// =============================================================================
// TunnelEndpoint
// =============================================================================

/// Create, update or deduplicate the TunnelEndpoint of a peer
///
/// Does nothing until both NetworkConfig copies are processed.
async fn enforce_tunnel_endpoint(remote: &str, ctx: &NetworkContext) -> Result<PeeringState> {
    let local = live(
        ctx.store
            .list_network_configs(&ctx.namespace, &labels::local_network_config_selector(remote))
            .await?,
    );
    let replicated = live(
        ctx.store
            .list_network_configs(&ctx.namespace, &labels::remote_network_config_selector(remote))
            .await?,
    );

    let state = PeeringState::observe(local.first(), replicated.first());
    let (Some(local), Some(replicated), PeeringState::Ready) =
        (local.first(), replicated.first(), state)
    else {
        return Ok(state);
    };

    let spec = tunnel_endpoint_spec(remote, local, replicated);
    let mut owners: Vec<OwnerReference> = owner_reference(local, true).into_iter().collect();
    if let Some(fc) = ctx.store.find_foreign_cluster(remote).await? {
        owners.extend(owner_reference(&fc, false));
    }

    let mut existing = live(
        ctx.store
            .list_tunnel_endpoints(&ctx.namespace, &labels::tunnel_endpoint_labels(remote))
            .await?,
    );
    existing.sort_by_key(|tep| tep.name_any());

    let Some((keep, extra)) = existing.split_first() else {
        let tep = new_tunnel_endpoint(remote, &ctx.namespace, spec, owners);
        let created = ctx.store.create_tunnel_endpoint(&tep).await?;
        info!(
            cluster_id = %remote,
            tunnel_endpoint = %created.name_any(),
            "TunnelEndpoint created"
        );
        return Ok(state);
    };

    for duplicate in extra {
        warn!(
            cluster_id = %remote,
            tunnel_endpoint = %duplicate.name_any(),
            "Deleting duplicate TunnelEndpoint"
        );
        ctx.store
            .delete_tunnel_endpoint(&ctx.namespace, &duplicate.name_any())
            .await?;
    }

    let name = keep.name_any();
    retry_on_conflict(&ctx.conflict_retry, "update_tunnel_endpoint", || async {
        let Some(mut latest) = ctx.store.get_tunnel_endpoint(&ctx.namespace, &name).await? else {
            return Ok(());
        };
        let changed = changed_fields(&latest.spec, &spec)?;
        let mut owners_added = false;
        for owner in &owners {
            owners_added |= add_owner(&mut latest, owner);
        }
        if changed.is_empty() && !owners_added {
            return Ok(());
        }
        latest.spec = spec.clone();
        ctx.store.replace_tunnel_endpoint(&latest).await?;
        info!(
            cluster_id = %remote,
            tunnel_endpoint = %name,
            changed = ?changed,
            "TunnelEndpoint updated"
        );
        Ok(())
    })
    .await?;

    Ok(state)
}

/// TunnelEndpoint spec joining both processed NetworkConfig copies
pub fn tunnel_endpoint_spec(
    remote: &str,
    local: &NetworkConfig,
    replicated: &NetworkConfig,
) -> TunnelEndpointSpec {
    let local_status = local.status.clone().unwrap_or_default();
    let remote_status = replicated.status.clone().unwrap_or_default();
    TunnelEndpointSpec {
        cluster_id: remote.to_string(),
        local_pod_cidr: local.spec.pod_cidr.clone(),
        local_nat_pod_cidr: local_status.pod_cidr_nat,
        local_external_cidr: local.spec.external_cidr.clone(),
        local_nat_external_cidr: local_status.external_cidr_nat,
        remote_pod_cidr: replicated.spec.pod_cidr.clone(),
        remote_nat_pod_cidr: remote_status.pod_cidr_nat,
        remote_external_cidr: replicated.spec.external_cidr.clone(),
        remote_nat_external_cidr: remote_status.external_cidr_nat,
        endpoint_ip: replicated.spec.endpoint_ip.clone(),
        backend_type: replicated.spec.backend_type.clone(),
        backend_config: replicated.spec.backend_config.clone(),
    }
}

fn new_tunnel_endpoint(
    remote: &str,
    namespace: &str,
    spec: TunnelEndpointSpec,
    owners: Vec<OwnerReference>,
) -> TunnelEndpoint {
    let mut tep = TunnelEndpoint::new("", spec);
    tep.metadata.name = None;
    tep.metadata.generate_name = Some(TUNNEL_ENDPOINT_GENERATE_NAME.to_string());
    tep.metadata.namespace = Some(namespace.to_string());
    tep.metadata.labels = Some(labels::tunnel_endpoint_labels(remote));
    tep.metadata.owner_references = (!owners.is_empty()).then_some(owners);
    tep
}

/// Top-level spec fields whose values differ, in camelCase
fn changed_fields(current: &TunnelEndpointSpec, desired: &TunnelEndpointSpec) -> Result<Vec<String>> {
    let current = serde_json::to_value(current)?;
    let desired = serde_json::to_value(desired)?;
    let (Some(current), Some(desired)) = (current.as_object(), desired.as_object()) else {
        return Ok(Vec::new());
    };
    Ok(desired
        .iter()
        .filter(|(field, value)| current.get(*field) != Some(*value))
        .map(|(field, _)| field.clone())
        .collect())
}

// =============================================================================
// Teardown and finalizers
// =============================================================================

async fn teardown(
    nc: &NetworkConfig,
    remote: &str,
    replicated: bool,
    ctx: &NetworkContext,
) -> Result<Action> {
    if !has_finalizer(nc, NETWORK_FINALIZER) {
        return Ok(Action::await_change());
    }

    let (selector, counterpart_selector) = if replicated {
        (
            labels::remote_network_config_selector(remote),
            labels::local_network_config_selector(remote),
        )
    } else {
        (
            labels::local_network_config_selector(remote),
            labels::remote_network_config_selector(remote),
        )
    };
    let siblings: Vec<NetworkConfig> = live(
        ctx.store
            .list_network_configs(&ctx.namespace, &selector)
            .await?,
    )
    .into_iter()
    .filter(|other| other.uid() != nc.uid())
    .collect();

    if siblings.is_empty() {
        info!(cluster_id = %remote, replicated, "Tearing down peering");
        let endpoints = ctx
            .store
            .list_tunnel_endpoints(&ctx.namespace, &labels::tunnel_endpoint_labels(remote))
            .await?;
        if !endpoints.is_empty() {
            for tep in endpoints.iter().filter(|t| !is_deleting(*t)) {
                ctx.store
                    .delete_tunnel_endpoint(&ctx.namespace, &tep.name_any())
                    .await?;
            }
            let remaining = ctx
                .store
                .list_tunnel_endpoints(&ctx.namespace, &labels::tunnel_endpoint_labels(remote))
                .await?;
            if !remaining.is_empty() {
                debug!(
                    cluster_id = %remote,
                    remaining = remaining.len(),
                    "Waiting for TunnelEndpoint removal"
                );
                return Ok(Action::requeue(TEARDOWN_REQUEUE));
            }
        }

        // The remote blocks belong to the replicated copy and stay reserved
        // while it still advertises them
        let counterpart_live = !live(
            ctx.store
                .list_network_configs(&ctx.namespace, &counterpart_selector)
                .await?,
        )
        .is_empty();
        if replicated || !counterpart_live {
            ctx.ipam.release_for_cluster(remote).await?;
        } else {
            debug!(cluster_id = %remote, "Replicated NetworkConfig still live, clearing local NAT only");
            ctx.ipam.register_local_nat(remote, None, None).await?;
        }
    } else {
        debug!(cluster_id = %remote, "Another NetworkConfig still covers this peer, keeping allocation");
    }

    remove_finalizer(nc, ctx).await?;
    info!(cluster_id = %remote, "NetworkConfig released");
    Ok(Action::await_change())
}

async fn ensure_finalizer(nc: &NetworkConfig, ctx: &NetworkContext) -> Result<NetworkConfig> {
    if has_finalizer(nc, NETWORK_FINALIZER) {
        return Ok(nc.clone());
    }
    let name = nc.name_any();
    retry_on_conflict(&ctx.conflict_retry, "add_network_finalizer", || async {
        let mut latest = ctx
            .store
            .get_network_config(&ctx.namespace, &name)
            .await?
            .ok_or_else(|| Error::not_ready("NetworkConfig", format!("{name} not found")))?;
        if has_finalizer(&latest, NETWORK_FINALIZER) {
            return Ok(latest);
        }
        latest
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(NETWORK_FINALIZER.to_string());
        let updated = ctx.store.replace_network_config(&latest).await?;
        debug!(network_config = %name, "Finalizer added");
        Ok(updated)
    })
    .await
}

async fn remove_finalizer(nc: &NetworkConfig, ctx: &NetworkContext) -> Result<()> {
    let name = nc.name_any();
    retry_on_conflict(&ctx.conflict_retry, "remove_network_finalizer", || async {
        let Some(mut latest) = ctx.store.get_network_config(&ctx.namespace, &name).await? else {
            return Ok(());
        };
        if !has_finalizer(&latest, NETWORK_FINALIZER) {
            return Ok(());
        }
        if let Some(finalizers) = latest.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != NETWORK_FINALIZER);
        }
        ctx.store.replace_network_config(&latest).await?;
        Ok(())
    })
    .await
}

// =============================================================================
// Helpers
// =============================================================================

fn live<K: Resource>(records: Vec<K>) -> Vec<K> {
    records.into_iter().filter(|r| !is_deleting(r)).collect()
}

/// Add `owner` unless an owner with the same uid is present; true if added
fn add_owner<K: Resource>(obj: &mut K, owner: &OwnerReference) -> bool {
    let owners = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if owners.iter().any(|o| o.uid == owner.uid) {
        return false;
    }
    owners.push(owner.clone());
    true
}

/// Labels stamped on records the replicator copies into this cluster
pub fn replicated_labels(origin_cluster_id: &str) -> BTreeMap<String, String> {
    labels::remote_network_config_selector(origin_cluster_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{GateSource, ReadinessGate};
    use crate::store::{MemoryStore, MockNetworkStore, NetworkStore};
    use peerlink_common::crd::{ForeignCluster, ForeignClusterSpec, ForeignClusterStatus, NetworkConfigSpec};
    use peerlink_common::retry::RetryConfig;
    use peerlink_common::{NO_REMAP, PEERLINK_SYSTEM_NAMESPACE as NS};
    use peerlink_ipam::Ipam;

    const LOCAL_ID: &str = "cluster-a";
    const REMOTE_ID: &str = "cluster-b";

    async fn context(store: Arc<MemoryStore>) -> Arc<NetworkContext> {
        let ipam = Arc::new(Ipam::in_memory());
        ipam.set_pod_cidr("10.0.0.0/16".parse().unwrap()).await.unwrap();
        ipam.ensure_external_cidr(16).await.unwrap();
        Arc::new(NetworkContext::builder(store, ipam, LOCAL_ID).build())
    }

    async fn seed_foreign_cluster(store: &MemoryStore, active: bool) {
        let mut fc = ForeignCluster::new(
            REMOTE_ID,
            ForeignClusterSpec {
                cluster_id: REMOTE_ID.to_string(),
            },
        );
        fc.status = Some(ForeignClusterStatus {
            peering_active: active,
        });
        store.put_foreign_cluster(fc).await;
    }

    fn spec(cluster_id: &str, pod: &str, external: &str) -> NetworkConfigSpec {
        NetworkConfigSpec {
            cluster_id: cluster_id.to_string(),
            pod_cidr: pod.to_string(),
            external_cidr: external.to_string(),
            endpoint_ip: "203.0.113.20".to_string(),
            backend_type: "wireguard".to_string(),
            backend_config: BTreeMap::from([
                ("publicKey".to_string(), "remote-key=".to_string()),
                ("listeningPort".to_string(), "51820".to_string()),
            ]),
        }
    }

    async fn create_replicated(store: &MemoryStore, pod: &str, external: &str) -> NetworkConfig {
        let mut nc = NetworkConfig::new("replicated-b", spec(LOCAL_ID, pod, external));
        nc.metadata.namespace = Some(NS.to_string());
        nc.metadata.labels = Some(replicated_labels(REMOTE_ID));
        store.create_network_config(&nc).await.unwrap()
    }

    async fn create_local(store: &MemoryStore, name: &str) -> NetworkConfig {
        let mut nc = NetworkConfig::new(name, spec(REMOTE_ID, "10.0.0.0/16", "10.1.0.0/16"));
        nc.metadata.namespace = Some(NS.to_string());
        nc.metadata.labels = Some(labels::local_network_config_labels(REMOTE_ID));
        store.create_network_config(&nc).await.unwrap()
    }

    async fn echo_status(store: &MemoryStore, name: &str, pod_nat: &str, ext_nat: &str) {
        let mut nc = store.get_network_config(NS, name).await.unwrap().unwrap();
        nc.status = Some(NetworkConfigStatus::processed(pod_nat, ext_nat));
        store.replace_network_config_status(&nc).await.unwrap();
    }

    async fn run(store: &MemoryStore, ctx: &Arc<NetworkContext>, name: &str) -> Result<Action> {
        let nc = store.get_network_config(NS, name).await.unwrap().unwrap();
        reconcile(Arc::new(nc), ctx.clone()).await
    }

    #[tokio::test]
    async fn closed_gate_defers_reconcile() {
        let store = Arc::new(MemoryStore::new());
        let ipam = Arc::new(Ipam::in_memory());
        let gate = Arc::new(ReadinessGate::new([GateSource::TunnelKeys]));
        let ctx = Arc::new(
            NetworkContext::builder(store.clone(), ipam, LOCAL_ID)
                .gate(gate)
                .build(),
        );
        create_replicated(&store, "10.0.0.0/16", "10.1.0.0/16").await;

        let action = run(&store, &ctx, "replicated-b").await.unwrap();
        assert_eq!(action, Action::requeue(GATE_REQUEUE));
        let nc = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();
        assert!(nc.metadata.finalizers.is_none());
        assert!(!nc.is_processed());
    }

    #[tokio::test]
    async fn remote_copy_gets_remap_decision() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_replicated(&store, "10.0.0.0/16", "10.200.0.0/16").await;

        run(&store, &ctx, "replicated-b").await.unwrap();

        let nc = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();
        let status = nc.status.as_ref().unwrap();
        assert!(status.processed);
        // Collides with our own 10.0.0.0/16 pod CIDR
        assert_eq!(status.pod_cidr_nat, "10.2.0.0/16");
        assert_eq!(status.external_cidr_nat, NO_REMAP);
        assert!(has_finalizer(&nc, NETWORK_FINALIZER));

        let owners = nc.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "ForeignCluster");
    }

    #[tokio::test]
    async fn remote_copy_without_foreign_cluster_still_processed() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        create_replicated(&store, "10.50.0.0/16", "10.51.0.0/16").await;

        run(&store, &ctx, "replicated-b").await.unwrap();

        let nc = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();
        assert_eq!(nc.status.as_ref().unwrap().pod_cidr_nat, NO_REMAP);
        assert!(nc.metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        create_replicated(&store, "10.0.0.0/16", "10.200.0.0/16").await;

        run(&store, &ctx, "replicated-b").await.unwrap();
        let first = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();
        run(&store, &ctx, "replicated-b").await.unwrap();
        let second = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();

        assert_eq!(first.resource_version(), second.resource_version());
    }

    #[tokio::test]
    async fn local_echo_registers_nat() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_local(&store, "net-config-b").await;
        echo_status(&store, "net-config-b", "192.168.0.0/16", NO_REMAP).await;

        run(&store, &ctx, "net-config-b").await.unwrap();

        let allocation = ctx.ipam.cluster_allocation(REMOTE_ID).await.unwrap();
        assert_eq!(
            allocation.local_pod_nat,
            Some("192.168.0.0/16".parse().unwrap())
        );
        assert_eq!(allocation.local_external_nat, None);
    }

    #[tokio::test]
    async fn duplicate_local_records_are_all_deleted() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_local(&store, "net-config-1").await;
        create_local(&store, "net-config-2").await;

        let action = run(&store, &ctx, "net-config-1").await.unwrap();
        assert_eq!(action, Action::requeue(DUPLICATE_REQUEUE));

        // net-config-1 already holds the finalizer and lingers until torn down
        for name in ["net-config-1", "net-config-2"] {
            if let Some(nc) = store.get_network_config(NS, name).await.unwrap() {
                assert!(is_deleting(&nc));
                run(&store, &ctx, name).await.unwrap();
            }
        }
        assert!(store.network_configs(NS).await.is_empty());
    }

    #[tokio::test]
    async fn local_teardown_keeps_blocks_of_live_replicated_copy() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_replicated(&store, "10.0.0.0/16", "10.200.0.0/16").await;
        run(&store, &ctx, "replicated-b").await.unwrap();

        create_local(&store, "net-config-1").await;
        echo_status(&store, "net-config-1", "192.168.0.0/16", NO_REMAP).await;
        run(&store, &ctx, "net-config-1").await.unwrap();
        assert_eq!(store.tunnel_endpoints(NS).await.len(), 1);

        // A duplicate deletes every local record at once
        create_local(&store, "net-config-2").await;
        let action = run(&store, &ctx, "net-config-2").await.unwrap();
        assert_eq!(action, Action::requeue(DUPLICATE_REQUEUE));
        for name in ["net-config-1", "net-config-2"] {
            if store.get_network_config(NS, name).await.unwrap().is_some() {
                run(&store, &ctx, name).await.unwrap();
            }
        }
        assert!(store.get_network_config(NS, "net-config-1").await.unwrap().is_none());
        assert!(store.get_network_config(NS, "net-config-2").await.unwrap().is_none());
        assert!(store.tunnel_endpoints(NS).await.is_empty());

        let replicated = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();
        assert!(!is_deleting(&replicated));
        assert_eq!(replicated.status.as_ref().unwrap().pod_cidr_nat, "10.2.0.0/16");

        let allocation = ctx.ipam.cluster_allocation(REMOTE_ID).await.unwrap();
        assert_eq!(allocation.remote_pod.unwrap().assigned.to_string(), "10.2.0.0/16");
        assert_eq!(allocation.local_pod_nat, None);

        // Another colliding peer must not be handed the block still in use
        let other = ctx
            .ipam
            .allocate_for_cluster(
                "cluster-c",
                "10.0.0.0/16".parse().unwrap(),
                "10.201.0.0/16".parse().unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(other.remote_pod.unwrap().assigned.to_string(), "10.2.0.0/16");
    }

    #[tokio::test]
    async fn inactive_peering_removes_local_record() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, false).await;
        create_local(&store, "net-config-b").await;

        run(&store, &ctx, "net-config-b").await.unwrap();
        let nc = store.get_network_config(NS, "net-config-b").await.unwrap().unwrap();
        assert!(is_deleting(&nc));

        run(&store, &ctx, "net-config-b").await.unwrap();
        assert!(store.get_network_config(NS, "net-config-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tunnel_endpoint_created_once_both_sides_processed() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_local(&store, "net-config-b").await;
        create_replicated(&store, "10.0.0.0/16", "10.200.0.0/16").await;

        run(&store, &ctx, "replicated-b").await.unwrap();
        assert!(store.tunnel_endpoints(NS).await.is_empty());
        assert_eq!(
            PeeringState::load(store.as_ref(), NS, REMOTE_ID).await.unwrap(),
            PeeringState::AwaitingLocalEcho
        );

        echo_status(&store, "net-config-b", NO_REMAP, NO_REMAP).await;
        run(&store, &ctx, "net-config-b").await.unwrap();

        let teps = store.tunnel_endpoints(NS).await;
        assert_eq!(teps.len(), 1);
        let tep = &teps[0];
        assert!(tep.name_any().starts_with(TUNNEL_ENDPOINT_GENERATE_NAME));
        assert_eq!(tep.spec.cluster_id, REMOTE_ID);
        assert_eq!(tep.spec.remote_pod_cidr, "10.0.0.0/16");
        assert_eq!(tep.spec.remote_nat_pod_cidr, "10.2.0.0/16");
        assert_eq!(tep.spec.local_nat_pod_cidr, NO_REMAP);
        assert_eq!(tep.spec.endpoint_ip, "203.0.113.20");

        let owners = tep.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "NetworkConfig");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(owners[1].kind, "ForeignCluster");

        // Nothing changes on a second pass
        let version = tep.resource_version();
        run(&store, &ctx, "replicated-b").await.unwrap();
        assert_eq!(store.tunnel_endpoints(NS).await[0].resource_version(), version);
    }

    #[tokio::test]
    async fn changed_parameters_patch_tunnel_endpoint() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_local(&store, "net-config-b").await;
        create_replicated(&store, "10.0.0.0/16", "10.200.0.0/16").await;
        echo_status(&store, "net-config-b", NO_REMAP, NO_REMAP).await;
        run(&store, &ctx, "replicated-b").await.unwrap();
        run(&store, &ctx, "net-config-b").await.unwrap();

        let mut replicated = store.get_network_config(NS, "replicated-b").await.unwrap().unwrap();
        replicated.spec.endpoint_ip = "203.0.113.99".to_string();
        store.replace_network_config(&replicated).await.unwrap();
        run(&store, &ctx, "replicated-b").await.unwrap();

        let teps = store.tunnel_endpoints(NS).await;
        assert_eq!(teps.len(), 1);
        assert_eq!(teps[0].spec.endpoint_ip, "203.0.113.99");
    }

    #[tokio::test]
    async fn changed_fields_lists_only_differences() {
        let a = TunnelEndpointSpec {
            endpoint_ip: "1.1.1.1".to_string(),
            ..Default::default()
        };
        let b = TunnelEndpointSpec {
            endpoint_ip: "2.2.2.2".to_string(),
            ..Default::default()
        };
        assert_eq!(changed_fields(&a, &b).unwrap(), vec!["endpointIp".to_string()]);
        assert!(changed_fields(&a, &a).unwrap().is_empty());
    }

    #[tokio::test]
    async fn teardown_waits_for_tunnel_endpoint() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        seed_foreign_cluster(&store, true).await;
        create_local(&store, "net-config-b").await;
        create_replicated(&store, "10.0.0.0/16", "10.200.0.0/16").await;
        echo_status(&store, "net-config-b", NO_REMAP, NO_REMAP).await;
        run(&store, &ctx, "replicated-b").await.unwrap();
        run(&store, &ctx, "net-config-b").await.unwrap();

        // The gateway holds the endpoint until it has disconnected
        let mut tep = store.tunnel_endpoints(NS).await.remove(0);
        tep.metadata.finalizers = Some(vec!["net.peerlink.dev/gateway".to_string()]);
        let tep = store.replace_tunnel_endpoint(&tep).await.unwrap();

        store.delete_network_config(NS, "replicated-b").await.unwrap();
        let action = run(&store, &ctx, "replicated-b").await.unwrap();
        assert_eq!(action, Action::requeue(TEARDOWN_REQUEUE));
        assert!(store.get_network_config(NS, "replicated-b").await.unwrap().is_some());
        assert!(ctx.ipam.cluster_allocation(REMOTE_ID).await.is_some());

        let mut released = store
            .get_tunnel_endpoint(NS, &tep.name_any())
            .await
            .unwrap()
            .unwrap();
        released.metadata.finalizers = Some(vec![]);
        store.replace_tunnel_endpoint(&released).await.unwrap();

        let action = run(&store, &ctx, "replicated-b").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(store.get_network_config(NS, "replicated-b").await.unwrap().is_none());
        assert!(ctx.ipam.cluster_allocation(REMOTE_ID).await.is_none());
    }

    #[tokio::test]
    async fn replicated_copy_for_other_cluster_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        let mut nc = NetworkConfig::new("stray", spec("cluster-z", "10.9.0.0/16", "10.10.0.0/16"));
        nc.metadata.namespace = Some(NS.to_string());
        nc.metadata.labels = Some(replicated_labels(REMOTE_ID));
        store.create_network_config(&nc).await.unwrap();

        let action = run(&store, &ctx, "stray").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.ipam.cluster_allocation(REMOTE_ID).await.is_none());
    }

    #[tokio::test]
    async fn status_conflict_is_retried() {
        let mut nc = NetworkConfig::new("replicated-b", spec(LOCAL_ID, "10.50.0.0/16", "10.51.0.0/16"));
        nc.metadata.namespace = Some(NS.to_string());
        nc.metadata.labels = Some(replicated_labels(REMOTE_ID));
        nc.metadata.finalizers = Some(vec![NETWORK_FINALIZER.to_string()]);
        nc.metadata.uid = Some("uid-1".to_string());

        let mut store = MockNetworkStore::new();
        let stored = nc.clone();
        store
            .expect_get_network_config()
            .returning(move |_, _| Ok(Some(stored.clone())));
        store.expect_find_foreign_cluster().returning(|_| Ok(None));
        let mut attempts = 0;
        store
            .expect_replace_network_config_status()
            .times(2)
            .returning(move |nc| {
                attempts += 1;
                if attempts == 1 {
                    Err(Error::conflict("stale"))
                } else {
                    Ok(nc.clone())
                }
            });
        store
            .expect_list_network_configs()
            .returning(|_, _| Ok(Vec::new()));

        let ipam = Arc::new(Ipam::in_memory());
        ipam.set_pod_cidr("10.0.0.0/16".parse().unwrap()).await.unwrap();
        let ctx = Arc::new(
            NetworkContext::builder(Arc::new(store), ipam, LOCAL_ID)
                .conflict_retry(RetryConfig {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    backoff_multiplier: 2.0,
                })
                .build(),
        );

        reconcile(Arc::new(nc), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn not_ready_ipam_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(
            NetworkContext::builder(store.clone(), Arc::new(Ipam::in_memory()), LOCAL_ID).build(),
        );
        create_replicated(&store, "10.0.0.0/16", "10.1.0.0/16").await;

        let err = run(&store, &ctx, "replicated-b").await.unwrap_err();
        assert!(err.is_not_ready());
    }
}

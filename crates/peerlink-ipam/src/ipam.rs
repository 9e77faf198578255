//! Stateful subnet allocator for cluster peerings
//!
//! The IPAM owns the local pod/service/external CIDRs, the network pools it
//! may carve remapped blocks from, the explicitly reserved subnets and the
//! per-remote-cluster allocation table.
//!
//! Invariants:
//! - assigned CIDRs of live clusters never overlap each other, the local
//!   CIDRs or the reserved set
//! - an allocation is stable until the cluster is released or its CIDR
//!   changes
//! - a released block is immediately available again
//!
//! Every mutation runs on a copy of the state under the write lock. The copy
//! is persisted before it replaces the live state, so a failed save leaves
//! the IPAM untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::Ipv4Net;
use peerlink_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::mapper;
use crate::pool::{self, DEFAULT_POOLS};
use crate::storage::{IpamStorage, MemoryStorage};

/// Owner name used in errors for allocations made for the local cluster
const LOCAL: &str = "local";

/// Mapping from a remote cluster's CIDR to the CIDR it is reached through locally
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetMapping {
    /// CIDR announced by the remote cluster
    pub original: Ipv4Net,
    /// CIDR assigned locally (equal to `original` when no remap was needed)
    pub assigned: Ipv4Net,
}

impl SubnetMapping {
    /// True when the assigned CIDR differs from the original
    pub fn is_remapped(&self) -> bool {
        self.original != self.assigned
    }

    /// The NAT CIDR, `None` for identity mappings
    pub fn nat(&self) -> Option<Ipv4Net> {
        self.is_remapped().then_some(self.assigned)
    }
}

/// Allocation table entry for one remote cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAllocation {
    /// How the remote pod CIDR is reached locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_pod: Option<SubnetMapping>,
    /// How the remote external CIDR is reached locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_external: Option<SubnetMapping>,
    /// Local pod CIDR as remapped by the remote cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pod_nat: Option<Ipv4Net>,
    /// Local external CIDR as remapped by the remote cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_external_nat: Option<Ipv4Net>,
}

impl ClusterAllocation {
    fn assigned(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.remote_pod
            .iter()
            .chain(self.remote_external.iter())
            .map(|m| m.assigned)
    }

    fn remapped(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.remote_pod
            .iter()
            .chain(self.remote_external.iter())
            .filter_map(SubnetMapping::nat)
    }
}

/// External address handed out for a local endpoint outside the pod CIDR
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointMapping {
    /// Address inside the external CIDR
    pub external_ip: Ipv4Addr,
    /// Remote clusters currently using the mapping
    pub clusters: BTreeSet<String>,
}

/// Serializable IPAM state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pod_cidr: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_cidr: Option<Ipv4Net>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    external_cidr: Option<Ipv4Net>,
    #[serde(default)]
    pools: Vec<Ipv4Net>,
    #[serde(default)]
    reserved: BTreeSet<Ipv4Net>,
    #[serde(default)]
    clusters: BTreeMap<String, ClusterAllocation>,
    #[serde(default)]
    endpoint_mappings: BTreeMap<Ipv4Addr, EndpointMapping>,
}

impl IpamState {
    /// Empty state using the private-range default pools
    pub fn with_default_pools() -> Self {
        let pools = DEFAULT_POOLS
            .iter()
            .filter_map(|p| p.parse::<Ipv4Net>().ok())
            .collect();
        Self::with_pools(pools)
    }

    /// Empty state with explicit pools, searched in order
    pub fn with_pools(pools: Vec<Ipv4Net>) -> Self {
        Self {
            pools,
            ..Default::default()
        }
    }

    /// Blocks no new allocation may overlap, skipping the entry of `exclude`
    fn used_blocks(&self, exclude: Option<&str>) -> Vec<Ipv4Net> {
        let mut used: Vec<Ipv4Net> = self
            .pod_cidr
            .iter()
            .chain(self.service_cidr.iter())
            .chain(self.external_cidr.iter())
            .chain(self.reserved.iter())
            .copied()
            .collect();
        used.extend(
            self.clusters
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != exclude)
                .flat_map(|(_, a)| a.assigned()),
        );
        used
    }

    fn overlapping_cluster(&self, subnet: &Ipv4Net) -> Option<(&str, Ipv4Net)> {
        self.clusters.iter().find_map(|(id, a)| {
            a.assigned()
                .find(|assigned| pool::overlaps(subnet, assigned))
                .map(|assigned| (id.as_str(), assigned))
        })
    }

    fn require_pod_cidr(&self) -> Result<Ipv4Net> {
        self.pod_cidr
            .ok_or_else(|| Error::not_ready("IPAM", "local pod CIDR not configured"))
    }

    /// Identity mapping when `original` is free, otherwise the first free
    /// same-size block from the pools
    fn allocate_subnet(
        &self,
        cluster_id: &str,
        original: Ipv4Net,
        also_used: &[Ipv4Net],
    ) -> Result<SubnetMapping> {
        let mut used = self.used_blocks(Some(cluster_id));
        used.extend_from_slice(also_used);

        let Some(conflict) = pool::first_overlap(&original, &used) else {
            return Ok(SubnetMapping {
                original,
                assigned: original,
            });
        };

        let assigned = pool::first_free_block(&self.pools, &used, original.prefix_len())
            .ok_or_else(|| Error::pool_exhausted(original.prefix_len(), cluster_id))?;
        debug!(
            cluster_id = %cluster_id,
            original = %original,
            conflict = %conflict,
            assigned = %assigned,
            "Remapping colliding subnet"
        );
        Ok(SubnetMapping { original, assigned })
    }

    fn release_endpoints(&mut self, cluster_id: &str) {
        self.endpoint_mappings.retain(|_, m| {
            m.clusters.remove(cluster_id);
            !m.clusters.is_empty()
        });
    }
}

/// Address pool manager shared by the reconcilers
pub struct Ipam {
    state: RwLock<IpamState>,
    storage: Arc<dyn IpamStorage>,
    shut_down: AtomicBool,
}

impl Ipam {
    /// Create an IPAM backed by `storage`, restoring any saved snapshot
    pub async fn new(storage: Arc<dyn IpamStorage>) -> Result<Self> {
        let state = match storage.load().await? {
            Some(state) => {
                info!(
                    clusters = state.clusters.len(),
                    pools = state.pools.len(),
                    "Restored IPAM state"
                );
                state
            }
            None => IpamState::with_default_pools(),
        };
        Ok(Self::from_state(state, storage))
    }

    /// Create an IPAM from an explicit state
    pub fn from_state(state: IpamState, storage: Arc<dyn IpamStorage>) -> Self {
        Self {
            state: RwLock::new(state),
            storage,
            shut_down: AtomicBool::new(false),
        }
    }

    /// IPAM with default pools and in-memory storage
    pub fn in_memory() -> Self {
        Self::from_state(
            IpamState::with_default_pools(),
            Arc::new(MemoryStorage::new()),
        )
    }

    async fn mutate<T>(&self, op: impl FnOnce(&mut IpamState) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let mut next = guard.clone();
        let out = op(&mut next)?;
        if next != *guard {
            self.storage.save(&next).await?;
            *guard = next;
        }
        Ok(out)
    }

    // =========================================================================
    // Local parameters
    // =========================================================================

    /// Set the local pod CIDR
    pub async fn set_pod_cidr(&self, cidr: Ipv4Net) -> Result<()> {
        self.mutate(|state| {
            if let Some((cluster, existing)) = state.overlapping_cluster(&cidr) {
                warn!(pod_cidr = %cidr, cluster_id = %cluster, "Pod CIDR collides with an issued allocation");
                return Err(Error::cidr_overlap(cidr, existing));
            }
            state.pod_cidr = Some(cidr);
            Ok(())
        })
        .await
    }

    /// Set the local service CIDR
    pub async fn set_service_cidr(&self, cidr: Ipv4Net) -> Result<()> {
        self.mutate(|state| {
            if let Some((_, existing)) = state.overlapping_cluster(&cidr) {
                return Err(Error::cidr_overlap(cidr, existing));
            }
            state.service_cidr = Some(cidr);
            Ok(())
        })
        .await
    }

    /// Local pod CIDR, if configured
    pub async fn pod_cidr(&self) -> Option<Ipv4Net> {
        self.state.read().await.pod_cidr
    }

    /// External CIDR, if allocated
    pub async fn external_cidr(&self) -> Option<Ipv4Net> {
        self.state.read().await.external_cidr
    }

    /// Allocate the external CIDR from the pools unless it already exists
    pub async fn ensure_external_cidr(&self, prefix_len: u8) -> Result<Ipv4Net> {
        self.mutate(|state| {
            if let Some(existing) = state.external_cidr {
                return Ok(existing);
            }
            let used = state.used_blocks(None);
            let cidr = pool::first_free_block(&state.pools, &used, prefix_len)
                .ok_or_else(|| Error::pool_exhausted(prefix_len, LOCAL))?;
            info!(external_cidr = %cidr, "Allocated external CIDR");
            state.external_cidr = Some(cidr);
            Ok(cidr)
        })
        .await
    }

    // =========================================================================
    // Pools and reservations
    // =========================================================================

    /// Add a network pool; pools may not overlap each other
    pub async fn add_pool(&self, pool: Ipv4Net) -> Result<()> {
        self.mutate(|state| {
            if state.pools.contains(&pool) {
                return Ok(());
            }
            if let Some(existing) = pool::first_overlap(&pool, &state.pools) {
                return Err(Error::cidr_overlap(pool, existing));
            }
            state.pools.push(pool);
            Ok(())
        })
        .await
    }

    /// Remove a network pool unless a remapped block lives inside it
    pub async fn remove_pool(&self, pool: Ipv4Net) -> Result<()> {
        self.mutate(|state| {
            if !state.pools.contains(&pool) {
                return Ok(());
            }
            if let Some(external) = state.external_cidr.filter(|e| pool.contains(e)) {
                debug!(pool = %pool, external_cidr = %external, "Pool holds the external CIDR");
                return Err(Error::PoolInUse {
                    pool: pool.to_string(),
                    cluster: LOCAL.to_string(),
                });
            }
            for (id, allocation) in &state.clusters {
                if allocation.remapped().any(|n| pool.contains(&n)) {
                    return Err(Error::PoolInUse {
                        pool: pool.to_string(),
                        cluster: id.clone(),
                    });
                }
            }
            state.pools.retain(|p| *p != pool);
            Ok(())
        })
        .await
    }

    /// Configured pools in search order
    pub async fn pools(&self) -> Vec<Ipv4Net> {
        self.state.read().await.pools.clone()
    }

    /// Reserve a subnet so it is never handed out
    ///
    /// Rejected when it overlaps an allocation that was already issued.
    pub async fn reserve_explicit(&self, subnet: Ipv4Net) -> Result<()> {
        self.mutate(|state| {
            if let Some((cluster, existing)) = state.overlapping_cluster(&subnet) {
                warn!(subnet = %subnet, cluster_id = %cluster, "Reservation collides with an issued allocation");
                return Err(Error::cidr_overlap(subnet, existing));
            }
            state.reserved.insert(subnet);
            Ok(())
        })
        .await
    }

    /// Drop an explicit reservation; unknown subnets are ignored
    pub async fn free_explicit(&self, subnet: Ipv4Net) -> Result<()> {
        self.mutate(|state| {
            state.reserved.remove(&subnet);
            Ok(())
        })
        .await
    }

    /// Explicitly reserved subnets
    pub async fn reserved(&self) -> Vec<Ipv4Net> {
        self.state.read().await.reserved.iter().copied().collect()
    }

    // =========================================================================
    // Per-cluster allocations
    // =========================================================================

    /// Decide how a remote cluster's pod and external CIDRs are reached locally
    ///
    /// Repeated calls with the same CIDRs return the recorded mappings. A
    /// changed CIDR releases its old mapping and allocates a new one.
    pub async fn allocate_for_cluster(
        &self,
        cluster_id: &str,
        pod_cidr: Ipv4Net,
        external_cidr: Ipv4Net,
    ) -> Result<ClusterAllocation> {
        self.mutate(|state| {
            state.require_pod_cidr()?;
            let mut entry = state.clusters.get(cluster_id).cloned().unwrap_or_default();

            let kept_external = entry.remote_external.filter(|m| m.original == external_cidr);
            let kept_pod = entry.remote_pod.filter(|m| m.original == pod_cidr);

            let pod = match kept_pod {
                Some(m) => m,
                None => {
                    let also_used: Vec<Ipv4Net> = kept_external.iter().map(|m| m.assigned).collect();
                    state.allocate_subnet(cluster_id, pod_cidr, &also_used)?
                }
            };
            let external = match kept_external {
                Some(m) => m,
                None => state.allocate_subnet(cluster_id, external_cidr, &[pod.assigned])?,
            };

            if entry.remote_pod != Some(pod) || entry.remote_external != Some(external) {
                info!(
                    cluster_id = %cluster_id,
                    pod_cidr = %pod.original,
                    pod_cidr_nat = %mapper::format_nat(pod.nat()),
                    external_cidr = %external.original,
                    external_cidr_nat = %mapper::format_nat(external.nat()),
                    "Allocated subnets for cluster"
                );
            }
            entry.remote_pod = Some(pod);
            entry.remote_external = Some(external);
            state.clusters.insert(cluster_id.to_string(), entry.clone());
            Ok(entry)
        })
        .await
    }

    /// Record how the remote cluster remapped the local CIDRs
    pub async fn register_local_nat(
        &self,
        cluster_id: &str,
        pod_nat: Option<Ipv4Net>,
        external_nat: Option<Ipv4Net>,
    ) -> Result<()> {
        self.mutate(|state| {
            let entry = state.clusters.entry(cluster_id.to_string()).or_default();
            if entry.local_pod_nat != pod_nat || entry.local_external_nat != external_nat {
                info!(
                    cluster_id = %cluster_id,
                    local_pod_nat = %mapper::format_nat(pod_nat),
                    local_external_nat = %mapper::format_nat(external_nat),
                    "Registered local NAT decided by peer"
                );
            }
            entry.local_pod_nat = pod_nat;
            entry.local_external_nat = external_nat;
            Ok(())
        })
        .await
    }

    /// Release everything held for a cluster; unknown clusters are ignored
    pub async fn release_for_cluster(&self, cluster_id: &str) -> Result<()> {
        self.mutate(|state| {
            if state.clusters.remove(cluster_id).is_some() {
                info!(cluster_id = %cluster_id, "Released cluster allocation");
            }
            state.release_endpoints(cluster_id);
            Ok(())
        })
        .await
    }

    /// Allocation entry of a cluster
    pub async fn cluster_allocation(&self, cluster_id: &str) -> Option<ClusterAllocation> {
        self.state.read().await.clusters.get(cluster_id).cloned()
    }

    /// IDs of every cluster holding an allocation
    pub async fn cluster_ids(&self) -> Vec<String> {
        self.state.read().await.clusters.keys().cloned().collect()
    }

    // =========================================================================
    // Address translation
    // =========================================================================

    /// Translate a single address into `network`, keeping host bits
    pub fn translate_address(&self, network: &str, address: &str) -> Result<Ipv4Addr> {
        mapper::remap(network, address)
    }

    /// Address under which a remote pod is reached locally
    pub async fn remote_pod_ip(&self, cluster_id: &str, ip: Ipv4Addr) -> Result<Ipv4Addr> {
        let state = self.state.read().await;
        let mapping = state
            .clusters
            .get(cluster_id)
            .and_then(|a| a.remote_pod)
            .ok_or_else(|| {
                Error::not_ready("IPAM", format!("no allocation for cluster {}", cluster_id))
            })?;
        Ok(match mapping.nat() {
            Some(nat) => mapper::remap_address(nat, ip),
            None => ip,
        })
    }

    /// Address under which a local endpoint is reached by a remote cluster
    ///
    /// Pod addresses are translated into the pod NAT chosen by the peer.
    /// Other addresses get a stable address of the external CIDR, translated
    /// into the external NAT chosen by the peer.
    pub async fn map_endpoint_ip(&self, cluster_id: &str, ip: Ipv4Addr) -> Result<Ipv4Addr> {
        self.mutate(|state| {
            let pod_cidr = state.require_pod_cidr()?;
            let entry = state.clusters.get(cluster_id).cloned().ok_or_else(|| {
                Error::not_ready("IPAM", format!("no allocation for cluster {}", cluster_id))
            })?;

            if pod_cidr.contains(&ip) {
                return Ok(entry
                    .local_pod_nat
                    .map_or(ip, |nat| mapper::remap_address(nat, ip)));
            }

            let external_cidr = state
                .external_cidr
                .ok_or_else(|| Error::not_ready("IPAM", "external CIDR not allocated"))?;

            let external_ip = match state.endpoint_mappings.get_mut(&ip) {
                Some(mapping) => {
                    mapping.clusters.insert(cluster_id.to_string());
                    mapping.external_ip
                }
                None => {
                    let taken: BTreeSet<Ipv4Addr> = state
                        .endpoint_mappings
                        .values()
                        .map(|m| m.external_ip)
                        .collect();
                    let external_ip = pool::first_free_address(&external_cidr, |a| taken.contains(a))
                        .ok_or_else(|| Error::pool_exhausted(32, cluster_id))?;
                    debug!(endpoint = %ip, external_ip = %external_ip, "Assigned external address");
                    state.endpoint_mappings.insert(
                        ip,
                        EndpointMapping {
                            external_ip,
                            clusters: BTreeSet::from([cluster_id.to_string()]),
                        },
                    );
                    external_ip
                }
            };

            Ok(entry
                .local_external_nat
                .map_or(external_ip, |nat| mapper::remap_address(nat, external_ip)))
        })
        .await
    }

    /// Drop a cluster's use of an endpoint mapping
    pub async fn unmap_endpoint_ip(&self, cluster_id: &str, ip: Ipv4Addr) -> Result<()> {
        self.mutate(|state| {
            if let Some(mapping) = state.endpoint_mappings.get_mut(&ip) {
                mapping.clusters.remove(cluster_id);
                if mapping.clusters.is_empty() {
                    state.endpoint_mappings.remove(&ip);
                }
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop accepting mutations
    ///
    /// Waits for in-flight mutations to finish. Queries keep working.
    pub async fn shutdown(&self) {
        let _guard = self.state.write().await;
        self.shut_down.store(true, Ordering::Release);
        info!("IPAM shut down");
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> IpamState {
        self.state.read().await.clone()
    }
}

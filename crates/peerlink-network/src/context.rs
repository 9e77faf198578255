//! Shared context for the network controllers

use std::sync::Arc;

use kube::{Resource, ResourceExt};
use peerlink_common::retry::{RequeueBackoff, RetryConfig};
use peerlink_common::{PEERLINK_SYSTEM_NAMESPACE, WIREGUARD_BACKEND};
use peerlink_ipam::Ipam;

use crate::gate::{LocalParameters, ReadinessGate};
use crate::store::NetworkStore;

/// Context handed to every network reconcile
pub struct NetworkContext {
    /// Record store (Kubernetes or in-memory)
    pub store: Arc<dyn NetworkStore>,
    /// Subnet allocator shared by every peering
    pub ipam: Arc<Ipam>,
    /// ID of the cluster this controller runs in
    pub cluster_id: String,
    /// Namespace holding NetworkConfigs and TunnelEndpoints
    pub namespace: String,
    /// Opens once the local parameters are known
    pub gate: Arc<ReadinessGate>,
    /// Local CIDRs, endpoint and public key
    pub params: Arc<LocalParameters>,
    /// Schedule for optimistic-concurrency retries
    pub conflict_retry: RetryConfig,
    /// Error policy delays
    pub backoff: RequeueBackoff,
}

impl NetworkContext {
    /// Create a builder for constructing a NetworkContext
    pub fn builder(
        store: Arc<dyn NetworkStore>,
        ipam: Arc<Ipam>,
        cluster_id: impl Into<String>,
    ) -> NetworkContextBuilder {
        NetworkContextBuilder {
            store,
            ipam,
            cluster_id: cluster_id.into(),
            namespace: PEERLINK_SYSTEM_NAMESPACE.to_string(),
            gate: None,
            params: None,
            conflict_retry: RetryConfig::conflict(),
            backoff: None,
        }
    }
}

/// Builder for [`NetworkContext`]
pub struct NetworkContextBuilder {
    store: Arc<dyn NetworkStore>,
    ipam: Arc<Ipam>,
    cluster_id: String,
    namespace: String,
    gate: Option<Arc<ReadinessGate>>,
    params: Option<Arc<LocalParameters>>,
    conflict_retry: RetryConfig,
    backoff: Option<RequeueBackoff>,
}

impl NetworkContextBuilder {
    /// Namespace for fabric records (default `peerlink-system`)
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Readiness gate (default: already open)
    pub fn gate(mut self, gate: Arc<ReadinessGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Local parameters (default: empty, WireGuard backend)
    pub fn params(mut self, params: Arc<LocalParameters>) -> Self {
        self.params = Some(params);
        self
    }

    /// Conflict retry schedule
    pub fn conflict_retry(mut self, config: RetryConfig) -> Self {
        self.conflict_retry = config;
        self
    }

    /// Error policy backoff
    pub fn backoff(mut self, backoff: RequeueBackoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Build the NetworkContext
    pub fn build(self) -> NetworkContext {
        NetworkContext {
            store: self.store,
            ipam: self.ipam,
            cluster_id: self.cluster_id,
            namespace: self.namespace,
            gate: self
                .gate
                .unwrap_or_else(|| Arc::new(ReadinessGate::open())),
            params: self
                .params
                .unwrap_or_else(|| Arc::new(LocalParameters::new(WIREGUARD_BACKEND))),
            conflict_retry: self.conflict_retry,
            backoff: self.backoff.unwrap_or_default(),
        }
    }
}

/// Key identifying an object in [`RequeueBackoff`]
pub fn backoff_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!("{}/{}", K::kind(&()), obj.name_any())
}

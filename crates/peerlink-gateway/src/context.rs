//! Shared context for the gateway controller

use std::sync::Arc;

use peerlink_common::retry::{RequeueBackoff, RetryConfig};
use peerlink_common::PEERLINK_SYSTEM_NAMESPACE;
use peerlink_network::NetworkStore;
use peerlink_tunnel::DriverRegistry;

/// Context handed to every TunnelEndpoint reconcile
pub struct GatewayContext {
    /// Record store (Kubernetes or in-memory)
    pub store: Arc<dyn NetworkStore>,
    /// Tunnel drivers keyed by backend name
    pub registry: DriverRegistry,
    /// Namespace holding TunnelEndpoints
    pub namespace: String,
    /// Schedule for optimistic-concurrency retries
    pub conflict_retry: RetryConfig,
    /// Error policy delays
    pub backoff: RequeueBackoff,
}

impl GatewayContext {
    /// Create a builder for constructing a GatewayContext
    pub fn builder(store: Arc<dyn NetworkStore>, registry: DriverRegistry) -> GatewayContextBuilder {
        GatewayContextBuilder {
            store,
            registry,
            namespace: PEERLINK_SYSTEM_NAMESPACE.to_string(),
            conflict_retry: RetryConfig::conflict(),
            backoff: None,
        }
    }
}

/// Builder for [`GatewayContext`]
pub struct GatewayContextBuilder {
    store: Arc<dyn NetworkStore>,
    registry: DriverRegistry,
    namespace: String,
    conflict_retry: RetryConfig,
    backoff: Option<RequeueBackoff>,
}

impl GatewayContextBuilder {
    /// Namespace for TunnelEndpoints (default `peerlink-system`)
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
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

    /// Build the GatewayContext
    pub fn build(self) -> GatewayContext {
        GatewayContext {
            store: self.store,
            registry: self.registry,
            namespace: self.namespace,
            conflict_retry: self.conflict_retry,
            backoff: self.backoff.unwrap_or_default(),
        }
    }
}

//! Startup barrier and the local parameters it guards
//!
//! NetworkConfig reconciliation needs the local pod and external CIDRs, the
//! tunnel public key and the externally reachable endpoint. Each arrives from
//! its own watch. The [`ReadinessGate`] opens once every source has reported
//! at least once; the values themselves live in [`LocalParameters`].

use std::collections::{BTreeMap, BTreeSet};

use peerlink_common::crd::NetworkConfigSpec;
use peerlink_common::{Error, Result, LISTENING_PORT_CONFIG, PUBLIC_KEY_CONFIG};
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Inputs the gate waits for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GateSource {
    /// Pod and external CIDR from the PeeringConfig
    NetworkParameters,
    /// Public key from the tunnel key Secret
    TunnelKeys,
    /// Endpoint address from the gateway Service
    GatewayService,
}

impl GateSource {
    /// Every source, in reporting order
    pub const ALL: [GateSource; 3] = [
        GateSource::NetworkParameters,
        GateSource::TunnelKeys,
        GateSource::GatewayService,
    ];
}

/// One-shot barrier over a fixed set of [`GateSource`]s
///
/// Marking a source twice is harmless. Once open the gate stays open.
pub struct ReadinessGate {
    pending: watch::Sender<BTreeSet<GateSource>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(GateSource::ALL)
    }
}

impl ReadinessGate {
    /// Gate waiting on the given sources
    pub fn new(sources: impl IntoIterator<Item = GateSource>) -> Self {
        let (pending, _) = watch::channel(sources.into_iter().collect());
        Self { pending }
    }

    /// Gate that is already open
    pub fn open() -> Self {
        Self::new([])
    }

    /// Report that a source has delivered its value
    pub fn mark(&self, source: GateSource) {
        self.pending.send_modify(|pending| {
            if pending.remove(&source) {
                info!(source = ?source, remaining = pending.len(), "Readiness source reported");
            }
        });
    }

    /// True once every source has reported
    pub fn is_open(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Sources that have not reported yet
    pub fn pending(&self) -> Vec<GateSource> {
        self.pending.borrow().iter().copied().collect()
    }

    /// Wait until the gate opens
    ///
    /// Fails only if the gate is dropped before every source reported.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.pending.subscribe();
        rx.wait_for(|pending| pending.is_empty())
            .await
            .map(|_| ())
            .map_err(|_| Error::not_ready("ReadinessGate", "gate closed before every source reported"))
    }
}

/// Values the local-origin NetworkConfig is built from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalNetwork {
    /// Local pod CIDR
    pub pod_cidr: Option<String>,
    /// Local external CIDR
    pub external_cidr: Option<String>,
    /// Externally reachable address of the gateway
    pub endpoint_ip: Option<String>,
    /// Externally reachable UDP port of the gateway
    pub endpoint_port: Option<u16>,
    /// Local tunnel public key
    pub public_key: Option<String>,
}

/// Shared, mutable [`LocalNetwork`]
pub struct LocalParameters {
    backend_type: String,
    inner: Mutex<LocalNetwork>,
}

impl LocalParameters {
    /// Empty parameters for a tunnel backend
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            inner: Mutex::new(LocalNetwork::default()),
        }
    }

    /// Record the local pod and external CIDRs
    pub async fn set_network(&self, pod_cidr: impl Into<String>, external_cidr: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.pod_cidr = Some(pod_cidr.into());
        inner.external_cidr = Some(external_cidr.into());
    }

    /// Record the gateway endpoint
    pub async fn set_endpoint(&self, ip: impl Into<String>, port: u16) {
        let mut inner = self.inner.lock().await;
        inner.endpoint_ip = Some(ip.into());
        inner.endpoint_port = Some(port);
    }

    /// Record the tunnel public key
    pub async fn set_public_key(&self, key: impl Into<String>) {
        self.inner.lock().await.public_key = Some(key.into());
    }

    /// Copy of the current values
    pub async fn snapshot(&self) -> LocalNetwork {
        self.inner.lock().await.clone()
    }

    /// Spec of the local-origin NetworkConfig destined for `remote_cluster_id`
    ///
    /// `None` until every value is known.
    pub async fn network_config_spec(&self, remote_cluster_id: &str) -> Option<NetworkConfigSpec> {
        let inner = self.inner.lock().await;
        let backend_config = BTreeMap::from([
            (PUBLIC_KEY_CONFIG.to_string(), inner.public_key.clone()?),
            (LISTENING_PORT_CONFIG.to_string(), inner.endpoint_port?.to_string()),
        ]);
        Some(NetworkConfigSpec {
            cluster_id: remote_cluster_id.to_string(),
            pod_cidr: inner.pod_cidr.clone()?,
            external_cidr: inner.external_cidr.clone()?,
            endpoint_ip: inner.endpoint_ip.clone()?,
            backend_type: self.backend_type.clone(),
            backend_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn gate_opens_after_every_source() {
        let gate = ReadinessGate::default();
        assert!(!gate.is_open());

        gate.mark(GateSource::TunnelKeys);
        gate.mark(GateSource::TunnelKeys);
        gate.mark(GateSource::NetworkParameters);
        assert_eq!(gate.pending(), vec![GateSource::GatewayService]);

        gate.mark(GateSource::GatewayService);
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn wait_returns_once_open() {
        let gate = Arc::new(ReadinessGate::new([GateSource::TunnelKeys]));
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.mark(GateSource::TunnelKeys);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate opened")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn open_gate_does_not_block() {
        ReadinessGate::open().wait().await.unwrap();
    }

    #[tokio::test]
    async fn spec_requires_every_parameter() {
        let params = LocalParameters::new("wireguard");
        params.set_network("10.0.0.0/16", "10.201.0.0/16").await;
        params.set_endpoint("203.0.113.10", 51820).await;
        assert!(params.network_config_spec("cluster-b").await.is_none());

        params.set_public_key("pub=").await;
        let spec = params.network_config_spec("cluster-b").await.unwrap();
        assert_eq!(spec.cluster_id, "cluster-b");
        assert_eq!(spec.endpoint_ip, "203.0.113.10");
        assert_eq!(spec.backend_type, "wireguard");
        assert_eq!(spec.backend_config[PUBLIC_KEY_CONFIG], "pub=");
        assert_eq!(spec.backend_config[LISTENING_PORT_CONFIG], "51820");
    }
}

//! WireGuard tunnel driver

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use peerlink_common::crd::{Connection, TunnelEndpoint};
use peerlink_common::{Error, Result, LISTENING_PORT_CONFIG, PUBLIC_KEY_CONFIG, WIREGUARD_BACKEND};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::device::{PeerSpec, WireGuardDevice};
use super::keys::{decode_key, ensure_keys, KeyPair, KeyStore};
use crate::driver::{ConnectFailure, TunnelDriver};

/// Peer configuration key carrying the peer's UDP endpoint
pub const ENDPOINT_CONFIG: &str = "endpoint";

/// Peer configuration key carrying the peer's allowed IPs
pub const ALLOWED_IPS_CONFIG: &str = "allowedIPs";

/// Default WireGuard listen port
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Default link MTU
pub const DEFAULT_MTU: u16 = 1420;

/// Keepalive interval applied to every peer
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Settings of the local WireGuard link
#[derive(Clone, Debug)]
pub struct WireGuardConfig {
    /// Link name
    pub interface: String,
    /// UDP listen port
    pub listen_port: u16,
    /// Link MTU
    pub mtu: u16,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: "peerlink0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            mtu: DEFAULT_MTU,
        }
    }
}

/// Tunnel driver backed by a WireGuard link
pub struct WireGuardDriver {
    config: WireGuardConfig,
    device: Arc<dyn WireGuardDevice>,
    key_store: Arc<dyn KeyStore>,
    keys: RwLock<Option<KeyPair>>,
    /// Configured peers keyed by remote cluster ID
    peers: Mutex<HashMap<String, PeerSpec>>,
}

impl WireGuardDriver {
    /// Create a driver; call [`TunnelDriver::init`] before use
    pub fn new(
        config: WireGuardConfig,
        device: Arc<dyn WireGuardDevice>,
        key_store: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            config,
            device,
            key_store,
            keys: RwLock::new(None),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Local public key, available after `init`
    pub async fn public_key(&self) -> Option<String> {
        self.keys.read().await.as_ref().map(KeyPair::public_key_base64)
    }

    /// Local listen port
    pub fn listen_port(&self) -> u16 {
        self.config.listen_port
    }

    /// Desired peer for a TunnelEndpoint
    fn peer_spec(tep: &TunnelEndpoint) -> Result<PeerSpec> {
        let spec = &tep.spec;
        let config = &spec.backend_config;

        let public_key = config
            .get(PUBLIC_KEY_CONFIG)
            .ok_or_else(|| Error::driver(WIREGUARD_BACKEND, "backend config has no publicKey"))?;
        decode_key(public_key)?;

        let port: u16 = config
            .get(LISTENING_PORT_CONFIG)
            .ok_or_else(|| Error::driver(WIREGUARD_BACKEND, "backend config has no listeningPort"))?
            .parse()
            .map_err(|e| Error::driver(WIREGUARD_BACKEND, format!("invalid listeningPort: {e}")))?;

        let ip: IpAddr = spec
            .endpoint_ip
            .parse()
            .map_err(|e: std::net::AddrParseError| Error::invalid_address(&spec.endpoint_ip, e.to_string()))?;

        let allowed_ips = [
            spec.effective_remote_pod_cidr(),
            spec.effective_remote_external_cidr(),
        ]
        .into_iter()
        .filter(|c| !c.is_empty())
        .map(|c| {
            c.parse::<Ipv4Net>()
                .map(|n| n.trunc())
                .map_err(|e| Error::invalid_cidr(c, e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(PeerSpec {
            public_key: public_key.trim().to_string(),
            endpoint: SocketAddr::new(ip, port),
            allowed_ips,
            keepalive: KEEPALIVE_INTERVAL,
        })
    }

    fn connection_for(peer: &PeerSpec) -> Connection {
        Connection::connected(BTreeMap::from([
            (PUBLIC_KEY_CONFIG.to_string(), peer.public_key.clone()),
            (ENDPOINT_CONFIG.to_string(), peer.endpoint.to_string()),
            (ALLOWED_IPS_CONFIG.to_string(), peer.allowed_ips_string()),
        ]))
    }
}

#[async_trait]
impl TunnelDriver for WireGuardDriver {
    fn backend_type(&self) -> &'static str {
        WIREGUARD_BACKEND
    }

    #[instrument(skip(self), fields(interface = %self.config.interface))]
    async fn init(&self) -> Result<()> {
        let keys = ensure_keys(self.key_store.as_ref()).await?;
        self.device
            .ensure_link(&self.config.interface, self.config.mtu)
            .await?;
        self.device
            .configure(
                &self.config.interface,
                &keys.private_key_base64(),
                self.config.listen_port,
            )
            .await?;
        info!(
            public_key = %keys.public_key_base64(),
            listen_port = self.config.listen_port,
            "WireGuard link ready"
        );
        *self.keys.write().await = Some(keys);
        Ok(())
    }

    #[instrument(skip(self, tep), fields(cluster_id = %tep.spec.cluster_id))]
    async fn connect_to_endpoint(
        &self,
        tep: &TunnelEndpoint,
    ) -> std::result::Result<Connection, ConnectFailure> {
        let desired = Self::peer_spec(tep).map_err(|e| {
            warn!(error = %e, "Invalid tunnel endpoint");
            ConnectFailure::new(e)
        })?;

        let cluster_id = tep.spec.cluster_id.clone();
        let mut peers = self.peers.lock().await;

        if let Some(current) = peers.get(&cluster_id) {
            if *current == desired {
                debug!("Peer unchanged");
                return Ok(Self::connection_for(current));
            }
            if current.public_key != desired.public_key {
                info!(
                    old_key = %current.public_key,
                    new_key = %desired.public_key,
                    "Peer key changed, removing stale peer"
                );
                self.device
                    .remove_peer(&self.config.interface, &current.public_key)
                    .await?;
                peers.remove(&cluster_id);
            }
        }

        self.device
            .set_peer(&self.config.interface, &desired)
            .await?;
        info!(
            endpoint = %desired.endpoint,
            allowed_ips = %desired.allowed_ips_string(),
            "Peer configured"
        );
        let connection = Self::connection_for(&desired);
        peers.insert(cluster_id, desired);
        Ok(connection)
    }

    #[instrument(skip(self, tep), fields(cluster_id = %tep.spec.cluster_id))]
    async fn disconnect_from_endpoint(&self, tep: &TunnelEndpoint) -> Result<()> {
        let Some(public_key) = tep
            .peer_configuration()
            .and_then(|c| c.get(PUBLIC_KEY_CONFIG))
        else {
            debug!("No peer key recorded, nothing to disconnect");
            return Ok(());
        };

        self.device
            .remove_peer(&self.config.interface, public_key)
            .await?;
        self.peers.lock().await.remove(&tep.spec.cluster_id);
        info!(public_key = %public_key, "Peer removed");
        Ok(())
    }

    #[instrument(skip(self), fields(interface = %self.config.interface))]
    async fn close(&self) -> Result<()> {
        self.device.delete_link(&self.config.interface).await?;
        self.peers.lock().await.clear();
        info!("WireGuard link deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::device::MockWireGuardDevice;
    use crate::wireguard::keys::MockKeyStore;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use mockall::predicate::*;
    use peerlink_common::crd::{
        ConnectionStatus, TunnelEndpointPhase, TunnelEndpointSpec, TunnelEndpointStatus,
    };
    use peerlink_common::NO_REMAP;

    fn key(byte: u8) -> String {
        STANDARD.encode([byte; 32])
    }

    fn tep(public_key: &str) -> TunnelEndpoint {
        TunnelEndpoint::new(
            "tunnel-endpoint-abc",
            TunnelEndpointSpec {
                cluster_id: "cluster-b".to_string(),
                local_pod_cidr: "10.0.0.0/16".to_string(),
                local_nat_pod_cidr: "10.1.0.0/16".to_string(),
                local_external_cidr: "10.2.0.0/16".to_string(),
                local_nat_external_cidr: NO_REMAP.to_string(),
                remote_pod_cidr: "10.0.0.0/16".to_string(),
                remote_nat_pod_cidr: "10.3.0.0/16".to_string(),
                remote_external_cidr: "10.201.0.0/16".to_string(),
                remote_nat_external_cidr: NO_REMAP.to_string(),
                endpoint_ip: "203.0.113.10".to_string(),
                backend_type: WIREGUARD_BACKEND.to_string(),
                backend_config: BTreeMap::from([
                    (PUBLIC_KEY_CONFIG.to_string(), public_key.to_string()),
                    (LISTENING_PORT_CONFIG.to_string(), "51820".to_string()),
                ]),
            },
        )
    }

    fn driver(device: MockWireGuardDevice) -> WireGuardDriver {
        WireGuardDriver::new(
            WireGuardConfig::default(),
            Arc::new(device),
            Arc::new(MockKeyStore::new()),
        )
    }

    #[test]
    fn allowed_ips_prefer_nat_then_raw() {
        let peer = WireGuardDriver::peer_spec(&tep(&key(1))).unwrap();
        assert_eq!(
            peer.allowed_ips,
            vec![
                "10.3.0.0/16".parse::<Ipv4Net>().unwrap(),
                "10.201.0.0/16".parse::<Ipv4Net>().unwrap()
            ]
        );
        assert_eq!(peer.endpoint, "203.0.113.10:51820".parse().unwrap());
        assert_eq!(peer.keepalive, KEEPALIVE_INTERVAL);
    }

    #[tokio::test]
    async fn unchanged_endpoint_is_noop() {
        let mut device = MockWireGuardDevice::new();
        device.expect_set_peer().times(1).returning(|_, _| Ok(()));
        device.expect_remove_peer().never();
        let driver = driver(device);

        let endpoint = tep(&key(1));
        let first = driver.connect_to_endpoint(&endpoint).await.unwrap();
        let second = driver.connect_to_endpoint(&endpoint).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, ConnectionStatus::Connected);
        assert_eq!(first.peer_configuration[PUBLIC_KEY_CONFIG], key(1));
    }

    #[tokio::test]
    async fn key_change_removes_then_adds_once() {
        let mut device = MockWireGuardDevice::new();
        let mut seq = mockall::Sequence::new();
        device
            .expect_set_peer()
            .withf(|_, p| p.public_key == key(1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        device
            .expect_remove_peer()
            .with(eq("peerlink0"), eq(key(1)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        device
            .expect_set_peer()
            .withf(|_, p| p.public_key == key(2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let driver = driver(device);

        driver.connect_to_endpoint(&tep(&key(1))).await.unwrap();
        let conn = driver.connect_to_endpoint(&tep(&key(2))).await.unwrap();
        assert_eq!(conn.peer_configuration[PUBLIC_KEY_CONFIG], key(2));
    }

    #[tokio::test]
    async fn endpoint_change_updates_in_place() {
        let mut device = MockWireGuardDevice::new();
        device.expect_set_peer().times(2).returning(|_, _| Ok(()));
        device.expect_remove_peer().never();
        let driver = driver(device);

        let mut endpoint = tep(&key(1));
        driver.connect_to_endpoint(&endpoint).await.unwrap();
        endpoint.spec.endpoint_ip = "203.0.113.99".to_string();
        let conn = driver.connect_to_endpoint(&endpoint).await.unwrap();
        assert_eq!(conn.peer_configuration[ENDPOINT_CONFIG], "203.0.113.99:51820");
    }

    #[tokio::test]
    async fn malformed_key_yields_error_connection() {
        let mut device = MockWireGuardDevice::new();
        device.expect_set_peer().never();
        let driver = driver(device);

        let failure = driver
            .connect_to_endpoint(&tep("definitely-not-a-key"))
            .await
            .unwrap_err();
        assert_eq!(failure.connection.status, ConnectionStatus::ConnectionError);
        assert!(!failure.connection.status_message.is_empty());
    }

    #[tokio::test]
    async fn device_failure_yields_error_connection() {
        let mut device = MockWireGuardDevice::new();
        device
            .expect_set_peer()
            .returning(|_, _| Err(Error::driver(WIREGUARD_BACKEND, "wg set failed")));
        let driver = driver(device);

        let failure = driver.connect_to_endpoint(&tep(&key(1))).await.unwrap_err();
        assert_eq!(failure.connection.status, ConnectionStatus::ConnectionError);
        assert!(failure.connection.status_message.contains("wg set failed"));
        assert!(matches!(failure.error, Error::Driver { .. }));
    }

    #[tokio::test]
    async fn disconnect_uses_persisted_key() {
        let mut device = MockWireGuardDevice::new();
        device
            .expect_remove_peer()
            .with(eq("peerlink0"), eq(key(9)))
            .times(1)
            .returning(|_, _| Ok(()));
        let driver = driver(device);

        // The driver has never seen this peer (e.g. after a restart)
        let mut endpoint = tep(&key(1));
        endpoint.status = Some(TunnelEndpointStatus {
            phase: TunnelEndpointPhase::Ready,
            connection: Some(Connection::connected(BTreeMap::from([(
                PUBLIC_KEY_CONFIG.to_string(),
                key(9),
            )]))),
        });
        driver.disconnect_from_endpoint(&endpoint).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_without_key_is_noop() {
        let mut device = MockWireGuardDevice::new();
        device.expect_remove_peer().never();
        let driver = driver(device);
        driver.disconnect_from_endpoint(&tep(&key(1))).await.unwrap();
    }

    #[tokio::test]
    async fn init_configures_link_with_stored_key() {
        let keys = KeyPair::generate();
        let private = keys.private_key_base64();
        let public = keys.public_key_base64();

        let mut store = MockKeyStore::new();
        store.expect_load().returning(move || Ok(Some(keys.clone())));
        let mut device = MockWireGuardDevice::new();
        device
            .expect_ensure_link()
            .with(eq("peerlink0"), eq(DEFAULT_MTU))
            .times(1)
            .returning(|_, _| Ok(()));
        device
            .expect_configure()
            .with(eq("peerlink0"), eq(private), eq(DEFAULT_LISTEN_PORT))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let driver = WireGuardDriver::new(
            WireGuardConfig::default(),
            Arc::new(device),
            Arc::new(store),
        );
        assert!(driver.public_key().await.is_none());
        driver.init().await.unwrap();
        assert_eq!(driver.public_key().await, Some(public));
    }

    #[tokio::test]
    async fn close_deletes_link() {
        let mut device = MockWireGuardDevice::new();
        device
            .expect_delete_link()
            .with(eq("peerlink0"))
            .times(1)
            .returning(|_| Ok(()));
        driver(device).close().await.unwrap();
    }
}

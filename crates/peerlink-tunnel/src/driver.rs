//! Tunnel driver abstraction and registry
//!
//! A driver turns a TunnelEndpoint into a live encrypted link. Drivers are
//! registered under their backend name; the gateway picks one per
//! TunnelEndpoint from `spec.backendType`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use peerlink_common::crd::{Connection, TunnelEndpoint};
use peerlink_common::{Error, Result};
use tracing::info;

/// A failed connection attempt
///
/// Carries the `ConnectionError` connection to persist alongside the error.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ConnectFailure {
    /// Connection to record in the TunnelEndpoint status
    pub connection: Connection,
    /// Underlying error
    #[source]
    pub error: Error,
}

impl ConnectFailure {
    /// Failure whose connection message is the error text
    pub fn new(error: Error) -> Self {
        Self {
            connection: Connection::error(error.to_string()),
            error,
        }
    }
}

impl From<Error> for ConnectFailure {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

/// A tunnel backend
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Name stored in `backendType` fields
    fn backend_type(&self) -> &'static str;

    /// Prepare the backend (keys, device)
    async fn init(&self) -> Result<()>;

    /// Converge the link to the TunnelEndpoint
    ///
    /// Repeated calls with an unchanged endpoint must not touch the device.
    async fn connect_to_endpoint(
        &self,
        tep: &TunnelEndpoint,
    ) -> std::result::Result<Connection, ConnectFailure>;

    /// Remove the peer described by the endpoint's last persisted connection
    async fn disconnect_from_endpoint(&self, tep: &TunnelEndpoint) -> Result<()>;

    /// Tear the backend down; used on process shutdown only
    async fn close(&self) -> Result<()>;
}

/// Drivers keyed by backend name
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn TunnelDriver>>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its backend name, replacing any previous one
    pub fn register(&mut self, driver: Arc<dyn TunnelDriver>) -> &mut Self {
        self.drivers.insert(driver.backend_type(), driver);
        self
    }

    /// Driver for a backend name
    pub fn get(&self, backend_type: &str) -> Option<Arc<dyn TunnelDriver>> {
        self.drivers.get(backend_type).cloned()
    }

    /// Registered backend names, sorted
    pub fn backends(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.drivers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Initialize every registered driver
    pub async fn init_all(&self) -> Result<()> {
        for (name, driver) in &self.drivers {
            driver.init().await?;
            info!(backend = %name, "Tunnel driver initialized");
        }
        Ok(())
    }

    /// Close every registered driver, returning the first error
    pub async fn close_all(&self) -> Result<()> {
        let mut first_err = None;
        for (name, driver) in &self.drivers {
            if let Err(e) = driver.close().await {
                tracing::error!(backend = %name, error = %e, "Failed to close tunnel driver");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDriver {
        name: &'static str,
        closed: AtomicU32,
    }

    #[async_trait]
    impl TunnelDriver for CountingDriver {
        fn backend_type(&self) -> &'static str {
            self.name
        }
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn connect_to_endpoint(
            &self,
            _tep: &TunnelEndpoint,
        ) -> std::result::Result<Connection, ConnectFailure> {
            Err(Error::driver(self.name, "unsupported").into())
        }
        async fn disconnect_from_endpoint(&self, _tep: &TunnelEndpoint) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn driver(name: &'static str) -> Arc<CountingDriver> {
        Arc::new(CountingDriver {
            name,
            closed: AtomicU32::new(0),
        })
    }

    #[test]
    fn lookup_by_backend_name() {
        let mut registry = DriverRegistry::new();
        registry.register(driver("wireguard")).register(driver("ipsec"));

        assert!(registry.get("wireguard").is_some());
        assert!(registry.get("gre").is_none());
        assert_eq!(registry.backends(), vec!["ipsec", "wireguard"]);
    }

    #[tokio::test]
    async fn close_all_closes_each_driver() {
        let wg = driver("wireguard");
        let mut registry = DriverRegistry::new();
        registry.register(wg.clone());
        registry.close_all().await.unwrap();
        assert_eq!(wg.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_failure_message_becomes_status() {
        let failure = ConnectFailure::new(Error::driver("wireguard", "bad key"));
        assert_eq!(
            failure.connection.status,
            peerlink_common::crd::ConnectionStatus::ConnectionError
        );
        assert!(failure.connection.status_message.contains("bad key"));
    }
}

//! Kernel boundary for the WireGuard driver
//!
//! [`WireGuardDevice`] is the narrow set of link and peer operations the
//! driver needs. [`CommandDevice`] implements it with the `ip` and `wg`
//! command-line tools.

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
#[cfg(test)]
use mockall::automock;
use peerlink_common::{Error, Result, WIREGUARD_BACKEND};
use tokio::process::Command;
use tracing::{debug, instrument, trace};

/// Desired configuration of one WireGuard peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSpec {
    /// Base64 public key of the peer
    pub public_key: String,
    /// UDP endpoint of the peer
    pub endpoint: SocketAddr,
    /// Networks routed to the peer
    pub allowed_ips: Vec<Ipv4Net>,
    /// Persistent keepalive interval
    pub keepalive: Duration,
}

impl PeerSpec {
    /// Allowed IPs in `wg` syntax
    pub fn allowed_ips_string(&self) -> String {
        self.allowed_ips
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Operations on a WireGuard network link
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireGuardDevice: Send + Sync {
    /// Create the link if missing, set its MTU and bring it up
    async fn ensure_link(&self, name: &str, mtu: u16) -> Result<()>;

    /// Set the private key and listen port of the link
    async fn configure(&self, name: &str, private_key: &str, listen_port: u16) -> Result<()>;

    /// Add or update a peer
    async fn set_peer(&self, name: &str, peer: &PeerSpec) -> Result<()>;

    /// Remove a peer by public key
    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<()>;

    /// Delete the link
    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// Device driven through the `ip` and `wg` commands
pub struct CommandDevice {
    wg_path: String,
    ip_path: String,
}

impl Default for CommandDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDevice {
    /// Device using `wg` and `ip` from `PATH`
    pub fn new() -> Self {
        Self::with_paths("wg", "ip")
    }

    /// Device using explicit command paths
    pub fn with_paths(wg_path: impl Into<String>, ip_path: impl Into<String>) -> Self {
        Self {
            wg_path: wg_path.into(),
            ip_path: ip_path.into(),
        }
    }

    async fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        trace!(cmd = cmd, args = ?args, "Executing command");

        let output = Command::new(cmd)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::driver(WIREGUARD_BACKEND, format!("failed to execute {}: {}", cmd, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::driver(
                WIREGUARD_BACKEND,
                format!("{} {} failed: {}", cmd, args.join(" "), stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn link_exists(&self, name: &str) -> bool {
        self.exec(&self.ip_path, &["link", "show", name]).await.is_ok()
    }

    /// Write the private key to a 0600 temp file for `wg set`
    fn write_temp_key(private_key: &str) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new().map_err(|e| {
            Error::driver(WIREGUARD_BACKEND, format!("failed to create key file: {}", e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| {
                    Error::driver(WIREGUARD_BACKEND, format!("failed to restrict key file: {}", e))
                })?;
        }

        file.write_all(private_key.as_bytes()).map_err(|e| {
            Error::driver(WIREGUARD_BACKEND, format!("failed to write key file: {}", e))
        })?;
        Ok(file)
    }
}

#[async_trait]
impl WireGuardDevice for CommandDevice {
    #[instrument(skip(self))]
    async fn ensure_link(&self, name: &str, mtu: u16) -> Result<()> {
        if !self.link_exists(name).await {
            debug!("Creating WireGuard link");
            self.exec(&self.ip_path, &["link", "add", name, "type", "wireguard"])
                .await?;
        }
        let mtu = mtu.to_string();
        self.exec(&self.ip_path, &["link", "set", name, "mtu", &mtu])
            .await?;
        self.exec(&self.ip_path, &["link", "set", name, "up"]).await?;
        Ok(())
    }

    #[instrument(skip(self, private_key))]
    async fn configure(&self, name: &str, private_key: &str, listen_port: u16) -> Result<()> {
        let key_file = Self::write_temp_key(private_key)?;
        let key_path = key_file.path().to_string_lossy().to_string();
        let port = listen_port.to_string();
        self.exec(
            &self.wg_path,
            &["set", name, "private-key", &key_path, "listen-port", &port],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, peer), fields(public_key = %peer.public_key))]
    async fn set_peer(&self, name: &str, peer: &PeerSpec) -> Result<()> {
        let endpoint = peer.endpoint.to_string();
        let allowed_ips = peer.allowed_ips_string();
        let keepalive = peer.keepalive.as_secs().to_string();
        self.exec(
            &self.wg_path,
            &[
                "set",
                name,
                "peer",
                &peer.public_key,
                "endpoint",
                &endpoint,
                "allowed-ips",
                &allowed_ips,
                "persistent-keepalive",
                &keepalive,
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_peer(&self, name: &str, public_key: &str) -> Result<()> {
        self.exec(&self.wg_path, &["set", name, "peer", public_key, "remove"])
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_link(&self, name: &str) -> Result<()> {
        if !self.link_exists(name).await {
            return Ok(());
        }
        self.exec(&self.ip_path, &["link", "delete", name]).await?;
        Ok(())
    }
}

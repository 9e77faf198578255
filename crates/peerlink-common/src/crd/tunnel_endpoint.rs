//! TunnelEndpoint Custom Resource Definition
//!
//! The converged description of one peering's tunnel. Created by the network
//! reconciler once both NetworkConfig directions are processed, consumed by
//! the gateway which records the driver's Connection in the status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::NO_REMAP;

/// Phase of a TunnelEndpoint
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TunnelEndpointPhase {
    /// Tunnel not yet configured
    #[default]
    Pending,
    /// Tunnel configured
    Ready,
    /// Tunnel configuration failed
    Error,
    /// Tunnel is being torn down
    Terminating,
}

impl std::fmt::Display for TunnelEndpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Error => write!(f, "Error"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Driver-reported state of a connection
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Peer configured on the device
    Connected,
    /// Configuration in progress
    #[default]
    Connecting,
    /// Configuration failed; see the status message
    ConnectionError,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ConnectionError => write!(f, "ConnectionError"),
        }
    }
}

/// Connection state as reported by a tunnel driver
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection status
    pub status: ConnectionStatus,

    /// Human-readable detail, set on failure
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,

    /// Driver specific peer parameters (e.g. the peer's public key)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_configuration: BTreeMap<String, String>,
}

impl Connection {
    /// A successful connection carrying the given peer parameters
    pub fn connected(peer_configuration: BTreeMap<String, String>) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            status_message: String::new(),
            peer_configuration,
        }
    }

    /// A failed connection with an operator-facing message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::ConnectionError,
            status_message: message.into(),
            peer_configuration: BTreeMap::new(),
        }
    }
}

/// Specification for a TunnelEndpoint
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "net.peerlink.dev",
    version = "v1alpha1",
    kind = "TunnelEndpoint",
    plural = "tunnelendpoints",
    shortname = "tep",
    namespaced,
    status = "TunnelEndpointStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.endpointIp"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Connection","type":"string","jsonPath":".status.connection.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpointSpec {
    /// Remote cluster this tunnel leads to
    pub cluster_id: String,

    /// Local pod CIDR
    pub local_pod_cidr: String,

    /// Local pod CIDR as seen by the remote cluster, or "None"
    pub local_nat_pod_cidr: String,

    /// Local external CIDR
    pub local_external_cidr: String,

    /// Local external CIDR as seen by the remote cluster, or "None"
    pub local_nat_external_cidr: String,

    /// Remote pod CIDR
    pub remote_pod_cidr: String,

    /// Remote pod CIDR as seen locally, or "None"
    pub remote_nat_pod_cidr: String,

    /// Remote external CIDR
    pub remote_external_cidr: String,

    /// Remote external CIDR as seen locally, or "None"
    pub remote_nat_external_cidr: String,

    /// Public address of the remote tunnel endpoint
    pub endpoint_ip: String,

    /// Tunnel backend to use
    pub backend_type: String,

    /// Remote backend parameters (public key, listening port)
    #[serde(default)]
    pub backend_config: BTreeMap<String, String>,
}

impl TunnelEndpointSpec {
    /// CIDR through which the remote pods are reached locally
    pub fn effective_remote_pod_cidr(&self) -> &str {
        effective(&self.remote_nat_pod_cidr, &self.remote_pod_cidr)
    }

    /// CIDR through which the remote external addresses are reached locally
    pub fn effective_remote_external_cidr(&self) -> &str {
        effective(&self.remote_nat_external_cidr, &self.remote_external_cidr)
    }
}

fn effective<'a>(nat: &'a str, raw: &'a str) -> &'a str {
    if nat.is_empty() || nat == NO_REMAP {
        raw
    } else {
        nat
    }
}

/// Status of a TunnelEndpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpointStatus {
    /// Current phase
    #[serde(default)]
    pub phase: TunnelEndpointPhase,

    /// Last connection reported by the driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
}

impl TunnelEndpoint {
    /// Peer configuration from the last persisted connection, if any
    pub fn peer_configuration(&self) -> Option<&BTreeMap<String, String>> {
        self.status
            .as_ref()
            .and_then(|s| s.connection.as_ref())
            .map(|c| &c.peer_configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_cidr_prefers_nat() {
        let spec = TunnelEndpointSpec {
            remote_pod_cidr: "10.0.0.0/16".to_string(),
            remote_nat_pod_cidr: "192.168.0.0/16".to_string(),
            remote_external_cidr: "10.201.0.0/16".to_string(),
            remote_nat_external_cidr: NO_REMAP.to_string(),
            ..Default::default()
        };
        assert_eq!(spec.effective_remote_pod_cidr(), "192.168.0.0/16");
        assert_eq!(spec.effective_remote_external_cidr(), "10.201.0.0/16");
    }

    #[test]
    fn connection_serializes_camel_case() {
        let conn = Connection::connected(BTreeMap::from([(
            "publicKey".to_string(),
            "abc=".to_string(),
        )]));
        let json = serde_json::to_value(&conn).expect("serialize");
        assert_eq!(json["status"], "Connected");
        assert_eq!(json["peerConfiguration"]["publicKey"], "abc=");
        assert!(json.get("statusMessage").is_none());
    }

    #[test]
    fn error_connection_carries_message() {
        let conn = Connection::error("bad key");
        assert_eq!(conn.status, ConnectionStatus::ConnectionError);
        assert_eq!(conn.status_message, "bad key");
    }

    #[test]
    fn phase_display() {
        assert_eq!(TunnelEndpointPhase::Pending.to_string(), "Pending");
        assert_eq!(TunnelEndpointPhase::Ready.to_string(), "Ready");
        assert_eq!(TunnelEndpointPhase::Error.to_string(), "Error");
        assert_eq!(TunnelEndpointPhase::Terminating.to_string(), "Terminating");
    }

    #[test]
    fn peer_configuration_absent_without_status() {
        let tep = TunnelEndpoint::new("tep", TunnelEndpointSpec::default());
        assert!(tep.peer_configuration().is_none());
    }
}

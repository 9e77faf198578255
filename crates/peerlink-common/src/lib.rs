//! Common types for peerlink: CRDs, errors, labels and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod labels;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for peerlink system resources (network configs, tunnel endpoints, keys)
pub const PEERLINK_SYSTEM_NAMESPACE: &str = "peerlink-system";

/// Sentinel written into NAT fields when a subnet did not need remapping
pub const NO_REMAP: &str = "None";

/// Backend name of the WireGuard tunnel driver
pub const WIREGUARD_BACKEND: &str = "wireguard";

/// Backend config key carrying the sender's WireGuard public key
pub const PUBLIC_KEY_CONFIG: &str = "publicKey";

/// Backend config key carrying the sender's UDP listen port
pub const LISTENING_PORT_CONFIG: &str = "listeningPort";

//! WireGuard backend
//!
//! - [`keys`]: Curve25519 key pair and its Secret-backed store
//! - [`device`]: link and peer operations on the kernel device
//! - [`driver`]: the [`TunnelDriver`](crate::TunnelDriver) implementation

pub mod device;
pub mod driver;
pub mod keys;

pub use device::{CommandDevice, PeerSpec, WireGuardDevice};
pub use driver::{WireGuardConfig, WireGuardDriver, KEEPALIVE_INTERVAL};
pub use keys::{ensure_keys, KeyPair, KeyStore, SecretKeyStore, KEY_SECRET_NAME};

//! Tunnel drivers for peerlink
//!
//! A [`TunnelDriver`] converges one encrypted link per TunnelEndpoint.
//! Drivers live in a [`DriverRegistry`] keyed by backend name. The only
//! backend shipped is [`wireguard`].

#![deny(missing_docs)]

pub mod driver;
pub mod wireguard;

pub use driver::{ConnectFailure, DriverRegistry, TunnelDriver};

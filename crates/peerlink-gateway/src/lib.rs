//! Gateway side of the peerlink fabric
//!
//! Watches TunnelEndpoint records and hands each one to the tunnel driver
//! named by its `backendType`. The driver's Connection is persisted in the
//! record's status so the network side and operators can see link state.

#![deny(missing_docs)]

pub mod context;
pub mod controller;

pub use context::{GatewayContext, GatewayContextBuilder};

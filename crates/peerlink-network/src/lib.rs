//! NetworkConfig and TunnelEndpoint reconciliation for peerlink
//!
//! Two clusters peer by exchanging NetworkConfig records through a
//! replication channel that copies local-origin records to the peer and
//! copies the peer's status back. This crate holds the controllers on either
//! end of that channel:
//!
//! - [`peering`]: one local-origin NetworkConfig per active ForeignCluster
//! - [`controller`]: remap decisions, echo registration and TunnelEndpoint
//!   enforcement
//! - [`peering_config`]: cluster-wide network parameters into the IPAM
//! - [`local`]: gateway endpoint and public key discovery
//!
//! All record access goes through [`store::NetworkStore`].

#![deny(missing_docs)]

pub mod context;
pub mod controller;
pub mod gate;
pub mod local;
pub mod peering;
pub mod peering_config;
pub mod state;
pub mod store;

pub use context::{NetworkContext, NetworkContextBuilder};
pub use gate::{GateSource, LocalNetwork, LocalParameters, ReadinessGate};
pub use state::{remote_cluster_id, PeeringState};
pub use store::{KubeNetworkStore, MemoryStore, NetworkStore};

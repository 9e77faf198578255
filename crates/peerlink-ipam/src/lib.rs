//! Address mapping and subnet allocation for peerlink
//!
//! - [`mapper`]: host-bit-preserving address rewriting
//! - [`pool`]: first-fit block search over network pools
//! - [`ipam`]: the stateful allocator shared by the reconcilers
//! - [`storage`]: snapshot persistence (ConfigMap or memory)

#![deny(missing_docs)]

pub mod ipam;
pub mod mapper;
pub mod pool;
pub mod storage;

pub use ipam::{ClusterAllocation, EndpointMapping, Ipam, IpamState, SubnetMapping};
pub use storage::{ConfigMapStorage, IpamStorage, MemoryStorage};

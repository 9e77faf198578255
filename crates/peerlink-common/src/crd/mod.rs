//! Custom Resource Definitions for peerlink
//!
//! NetworkConfig, TunnelEndpoint and PeeringConfig are owned by peerlink.
//! ForeignCluster belongs to the discovery component and is only read.

mod foreign_cluster;
mod network_config;
mod peering_config;
mod tunnel_endpoint;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use foreign_cluster::{ForeignCluster, ForeignClusterSpec, ForeignClusterStatus};
pub use network_config::{NetworkConfig, NetworkConfigSpec, NetworkConfigStatus};
pub use peering_config::{
    PeeringConfig, PeeringConfigSpec, PeeringConfigStatus, DEFAULT_EXTERNAL_CIDR_PREFIX,
};
pub use tunnel_endpoint::{
    Connection, ConnectionStatus, TunnelEndpoint, TunnelEndpointPhase, TunnelEndpointSpec,
    TunnelEndpointStatus,
};

/// CRDs owned and installed by peerlink
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![
        NetworkConfig::crd(),
        TunnelEndpoint::crd(),
        PeeringConfig::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_carry_peerlink_group() {
        let crds = owned_crds();
        assert_eq!(crds.len(), 3);
        for crd in &crds {
            assert_eq!(crd.spec.group, "net.peerlink.dev");
        }
    }

    #[test]
    fn peering_config_is_cluster_scoped() {
        assert_eq!(PeeringConfig::crd().spec.scope, "Cluster");
        assert_eq!(NetworkConfig::crd().spec.scope, "Namespaced");
    }
}

//! ForeignCluster, as published by the discovery component
//!
//! Only the fields the fabric reads are modelled. Peerlink never writes this
//! resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identity of a discovered peer cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "discovery.peerlink.dev",
    version = "v1alpha1",
    kind = "ForeignCluster",
    plural = "foreignclusters",
    status = "ForeignClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ForeignClusterSpec {
    /// Unique ID of the peer cluster
    pub cluster_id: String,
}

/// Peering state published by discovery
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForeignClusterStatus {
    /// True while the peering is established
    #[serde(default)]
    pub peering_active: bool,
}

impl ForeignCluster {
    /// True while discovery reports an active peering
    pub fn is_peering_active(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.peering_active)
    }
}

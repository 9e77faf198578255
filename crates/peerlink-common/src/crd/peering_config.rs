//! PeeringConfig Custom Resource Definition
//!
//! Cluster-wide network parameters feeding the IPAM. A single instance is
//! expected; changes are applied without disturbing issued allocations.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default prefix length of the external CIDR
pub const DEFAULT_EXTERNAL_CIDR_PREFIX: u8 = 16;

fn default_external_cidr_prefix() -> u8 {
    DEFAULT_EXTERNAL_CIDR_PREFIX
}

/// Specification for a PeeringConfig
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "net.peerlink.dev",
    version = "v1alpha1",
    kind = "PeeringConfig",
    plural = "peeringconfigs",
    status = "PeeringConfigStatus",
    printcolumn = r#"{"name":"PodCIDR","type":"string","jsonPath":".spec.podCidr"}"#,
    printcolumn = r#"{"name":"ServiceCIDR","type":"string","jsonPath":".spec.serviceCidr"}"#,
    printcolumn = r#"{"name":"ExternalCIDR","type":"string","jsonPath":".status.externalCidr"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PeeringConfigSpec {
    /// Local pod CIDR
    pub pod_cidr: String,

    /// Local service CIDR
    pub service_cidr: String,

    /// Subnets that must never be assigned (node ranges etc.)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_subnets: Vec<String>,

    /// Pools added to the private-range defaults
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_pools: Vec<String>,

    /// Prefix length of the external CIDR allocated at startup
    #[serde(default = "default_external_cidr_prefix")]
    pub external_cidr_prefix: u8,
}

/// Status of a PeeringConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeeringConfigStatus {
    /// External CIDR chosen by the IPAM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cidr: Option<String>,

    /// Human-readable message, set when applying the config failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

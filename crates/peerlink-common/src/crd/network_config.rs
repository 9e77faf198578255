//! NetworkConfig Custom Resource Definition
//!
//! One NetworkConfig exists per cluster pair per direction. The local-origin
//! copy describes this cluster's own parameters and is replicated to the peer;
//! the replicated copy describes the peer and is processed here. The receiving
//! cluster writes its remap decision into the status, which the replicator
//! copies back to the origin.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::NO_REMAP;

/// Specification for a NetworkConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "net.peerlink.dev",
    version = "v1alpha1",
    kind = "NetworkConfig",
    plural = "networkconfigs",
    shortname = "nc",
    namespaced,
    status = "NetworkConfigStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"PodCIDR","type":"string","jsonPath":".spec.podCidr"}"#,
    printcolumn = r#"{"name":"PodNAT","type":"string","jsonPath":".status.podCidrNat"}"#,
    printcolumn = r#"{"name":"Processed","type":"boolean","jsonPath":".status.processed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigSpec {
    /// Cluster that will receive (and process) this record
    pub cluster_id: String,

    /// Pod CIDR of the cluster that originated the record
    pub pod_cidr: String,

    /// External CIDR of the cluster that originated the record
    pub external_cidr: String,

    /// Public address of the originating cluster's tunnel endpoint
    pub endpoint_ip: String,

    /// Tunnel backend to use (e.g. "wireguard")
    pub backend_type: String,

    /// Backend specific parameters (public key, listening port)
    #[serde(default)]
    pub backend_config: BTreeMap<String, String>,
}

/// Status of a NetworkConfig, written by the receiving cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigStatus {
    /// Pod CIDR assigned by the receiver, or "None" when no remap was needed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_cidr_nat: String,

    /// External CIDR assigned by the receiver, or "None" when no remap was needed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_cidr_nat: String,

    /// Set once the receiver has stored its remap decision
    #[serde(default)]
    pub processed: bool,
}

impl NetworkConfigStatus {
    /// Status carrying a completed remap decision
    pub fn processed(pod_cidr_nat: impl Into<String>, external_cidr_nat: impl Into<String>) -> Self {
        Self {
            pod_cidr_nat: pod_cidr_nat.into(),
            external_cidr_nat: external_cidr_nat.into(),
            processed: true,
        }
    }

    /// Pod NAT CIDR with the "None" sentinel mapped to `None`
    pub fn pod_nat(&self) -> Option<&str> {
        nat_value(&self.pod_cidr_nat)
    }

    /// External NAT CIDR with the "None" sentinel mapped to `None`
    pub fn external_nat(&self) -> Option<&str> {
        nat_value(&self.external_cidr_nat)
    }
}

fn nat_value(value: &str) -> Option<&str> {
    if value.is_empty() || value == NO_REMAP {
        None
    } else {
        Some(value)
    }
}

impl NetworkConfig {
    /// True once the receiving cluster has processed this record
    pub fn is_processed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.processed)
    }
}

//! Label keys and selectors used to join NetworkConfig and TunnelEndpoint records
//!
//! Labels are the only cross-record join key. The replication collaborator
//! consumes `replication` + `destination` on local-origin records and stamps
//! `replicated` + `origin` on the copies it creates in the peer cluster.

use std::collections::BTreeMap;

/// Remote cluster a record refers to
pub const REMOTE_CLUSTER_ID_LABEL: &str = "net.peerlink.dev/remote-cluster-id";

/// Set to "true" on local-origin records that should be replicated
pub const REPLICATION_LABEL: &str = "net.peerlink.dev/replication";

/// Cluster a local-origin record must be replicated to
pub const DESTINATION_LABEL: &str = "net.peerlink.dev/destination";

/// Set to "true" on copies created by the replicator
pub const REPLICATED_LABEL: &str = "net.peerlink.dev/replicated";

/// Cluster a replicated copy originates from
pub const ORIGIN_LABEL: &str = "net.peerlink.dev/origin";

/// Label value used for boolean labels
pub const TRUE: &str = "true";

/// Labels of a local-origin NetworkConfig destined for `remote_cluster_id`
pub fn local_network_config_labels(remote_cluster_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (REPLICATION_LABEL.to_string(), TRUE.to_string()),
        (DESTINATION_LABEL.to_string(), remote_cluster_id.to_string()),
        (
            REMOTE_CLUSTER_ID_LABEL.to_string(),
            remote_cluster_id.to_string(),
        ),
    ])
}

/// Selector matching the local-origin NetworkConfigs for a remote cluster
pub fn local_network_config_selector(remote_cluster_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (REPLICATION_LABEL.to_string(), TRUE.to_string()),
        (DESTINATION_LABEL.to_string(), remote_cluster_id.to_string()),
    ])
}

/// Selector matching replicated NetworkConfigs originating from a remote cluster
pub fn remote_network_config_selector(remote_cluster_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (REPLICATED_LABEL.to_string(), TRUE.to_string()),
        (ORIGIN_LABEL.to_string(), remote_cluster_id.to_string()),
    ])
}

/// Labels (and selector) of the TunnelEndpoint for a remote cluster
pub fn tunnel_endpoint_labels(remote_cluster_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        REMOTE_CLUSTER_ID_LABEL.to_string(),
        remote_cluster_id.to_string(),
    )])
}

/// True when every selector entry is present in `labels` with the same value
pub fn matches(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

/// Render a selector in the `k=v,k2=v2` form accepted by the API server
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// True when the labels mark a replicated copy
pub fn is_replicated(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(REPLICATED_LABEL))
        .is_some_and(|v| v == TRUE)
}

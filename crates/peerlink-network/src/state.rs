//! Per-peering progress derived from the stored records

use std::fmt;

use kube::ResourceExt;
use peerlink_common::crd::NetworkConfig;
use peerlink_common::labels::{self, ORIGIN_LABEL};
use peerlink_common::{Error, Result};

use crate::store::{is_deleting, NetworkStore};

/// Where a peering stands, from this cluster's point of view
///
/// Nothing stores this value. It is recomputed from the two NetworkConfig
/// copies every time it is needed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeeringState {
    /// The peer's NetworkConfig has not been replicated here yet
    AwaitingRemote,
    /// The peer's NetworkConfig is here but its remap is not persisted
    RemoteSeen,
    /// Remap persisted; waiting for the peer's decision about our CIDRs
    AwaitingLocalEcho,
    /// Both directions processed; the TunnelEndpoint can be built
    Ready,
    /// One of the copies is being deleted
    TearingDown,
}

impl fmt::Display for PeeringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingRemote => "AwaitingRemote",
            Self::RemoteSeen => "RemoteSeen",
            Self::AwaitingLocalEcho => "AwaitingLocalEcho",
            Self::Ready => "Ready",
            Self::TearingDown => "TearingDown",
        };
        f.write_str(s)
    }
}

impl PeeringState {
    /// State given the local-origin and the replicated copy
    pub fn observe(local: Option<&NetworkConfig>, remote: Option<&NetworkConfig>) -> Self {
        if local.is_some_and(is_deleting) || remote.is_some_and(is_deleting) {
            return Self::TearingDown;
        }
        match (local, remote) {
            (_, None) => Self::AwaitingRemote,
            (_, Some(remote)) if !remote.is_processed() => Self::RemoteSeen,
            (Some(local), Some(_)) if local.is_processed() => Self::Ready,
            _ => Self::AwaitingLocalEcho,
        }
    }

    /// State of the peering with `remote_cluster_id` as found in the store
    pub async fn load(
        store: &dyn NetworkStore,
        namespace: &str,
        remote_cluster_id: &str,
    ) -> Result<Self> {
        let local = store
            .list_network_configs(namespace, &labels::local_network_config_selector(remote_cluster_id))
            .await?;
        let remote = store
            .list_network_configs(namespace, &labels::remote_network_config_selector(remote_cluster_id))
            .await?;
        Ok(Self::observe(local.first(), remote.first()))
    }
}

/// ID of the peer a NetworkConfig is about
///
/// Replicated copies name it in the origin label; local-origin records name
/// it in `spec.clusterId`.
pub fn remote_cluster_id(nc: &NetworkConfig) -> Result<String> {
    let record_labels = nc.metadata.labels.as_ref();
    let id = if labels::is_replicated(record_labels) {
        record_labels
            .and_then(|l| l.get(ORIGIN_LABEL))
            .cloned()
            .unwrap_or_default()
    } else {
        nc.spec.cluster_id.clone()
    };
    if id.is_empty() {
        return Err(Error::validation_for(
            format!("NetworkConfig/{}", nc.name_any()),
            "cannot determine the remote cluster",
        ));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_common::crd::{NetworkConfigSpec, NetworkConfigStatus};
    use peerlink_common::labels::{REPLICATED_LABEL, TRUE};
    use std::collections::BTreeMap;

    fn nc(processed: bool) -> NetworkConfig {
        let mut nc = NetworkConfig::new("nc", NetworkConfigSpec::default());
        if processed {
            nc.status = Some(NetworkConfigStatus::processed("None", "None"));
        }
        nc
    }

    #[test]
    fn state_follows_both_copies() {
        assert_eq!(PeeringState::observe(None, None), PeeringState::AwaitingRemote);
        assert_eq!(
            PeeringState::observe(Some(&nc(true)), None),
            PeeringState::AwaitingRemote
        );
        assert_eq!(
            PeeringState::observe(Some(&nc(true)), Some(&nc(false))),
            PeeringState::RemoteSeen
        );
        assert_eq!(
            PeeringState::observe(None, Some(&nc(true))),
            PeeringState::AwaitingLocalEcho
        );
        assert_eq!(
            PeeringState::observe(Some(&nc(false)), Some(&nc(true))),
            PeeringState::AwaitingLocalEcho
        );
        assert_eq!(
            PeeringState::observe(Some(&nc(true)), Some(&nc(true))),
            PeeringState::Ready
        );
    }

    #[test]
    fn deletion_wins() {
        let mut deleting = nc(true);
        deleting.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        assert_eq!(
            PeeringState::observe(Some(&nc(true)), Some(&deleting)),
            PeeringState::TearingDown
        );
    }

    #[test]
    fn remote_id_from_spec_or_origin() {
        let mut local = nc(false);
        local.spec.cluster_id = "cluster-b".to_string();
        assert_eq!(remote_cluster_id(&local).unwrap(), "cluster-b");

        let mut replicated = nc(false);
        replicated.spec.cluster_id = "cluster-a".to_string();
        replicated.metadata.labels = Some(BTreeMap::from([
            (REPLICATED_LABEL.to_string(), TRUE.to_string()),
            (ORIGIN_LABEL.to_string(), "cluster-b".to_string()),
        ]));
        assert_eq!(remote_cluster_id(&replicated).unwrap(), "cluster-b");

        replicated
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(ORIGIN_LABEL);
        assert!(matches!(
            remote_cluster_id(&replicated),
            Err(Error::Validation { .. })
        ));
    }
}

//! ForeignCluster controller
//!
//! Keeps exactly one local-origin NetworkConfig per active peering, built
//! from the current [`LocalParameters`](crate::gate::LocalParameters).

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use peerlink_common::crd::{ForeignCluster, NetworkConfig};
use peerlink_common::kube_utils::owner_reference;
use peerlink_common::labels;
use peerlink_common::retry::retry_on_conflict;
use peerlink_common::{Error, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::context::{backoff_key, NetworkContext};
use crate::store::is_deleting;

/// Name prefix of generated local NetworkConfigs
pub const NETWORK_CONFIG_GENERATE_NAME: &str = "net-config-";

const GATE_REQUEUE: Duration = Duration::from_secs(5);
const DUPLICATE_REQUEUE: Duration = Duration::from_secs(1);
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Reconcile a ForeignCluster
#[instrument(skip(fc, ctx), fields(foreign_cluster = %fc.name_any(), cluster_id = %fc.spec.cluster_id))]
pub async fn reconcile(fc: Arc<ForeignCluster>, ctx: Arc<NetworkContext>) -> Result<Action> {
    if !ctx.gate.is_open() {
        return Ok(Action::requeue(GATE_REQUEUE));
    }

    let remote = fc.spec.cluster_id.as_str();
    if remote.is_empty() {
        return Err(Error::validation_for(
            format!("ForeignCluster/{}", fc.name_any()),
            "spec.clusterId is empty",
        ));
    }
    if remote == ctx.cluster_id {
        warn!("ForeignCluster refers to the local cluster, ignoring");
        return Ok(Action::await_change());
    }

    let existing: Vec<NetworkConfig> = ctx
        .store
        .list_network_configs(&ctx.namespace, &labels::local_network_config_selector(remote))
        .await?
        .into_iter()
        .filter(|nc| !is_deleting(nc))
        .collect();

    if !fc.is_peering_active() || is_deleting(fc.as_ref()) {
        for nc in &existing {
            info!(network_config = %nc.name_any(), "Peering inactive, deleting local NetworkConfig");
            ctx.store
                .delete_network_config(&ctx.namespace, &nc.name_any())
                .await?;
        }
        return Ok(Action::await_change());
    }

    let spec = ctx
        .params
        .network_config_spec(remote)
        .await
        .ok_or_else(|| Error::not_ready("LocalParameters", "local network parameters incomplete"))?;

    match existing.as_slice() {
        [] => {
            let mut nc = NetworkConfig::new("", spec);
            nc.metadata.name = None;
            nc.metadata.generate_name = Some(NETWORK_CONFIG_GENERATE_NAME.to_string());
            nc.metadata.namespace = Some(ctx.namespace.clone());
            nc.metadata.labels = Some(labels::local_network_config_labels(remote));
            nc.metadata.owner_references = owner_reference(fc.as_ref(), false).map(|o| vec![o]);
            let created = ctx.store.create_network_config(&nc).await?;
            info!(network_config = %created.name_any(), "Local NetworkConfig created");
        }
        [current] if current.spec == spec => {
            debug!(network_config = %current.name_any(), "Local NetworkConfig up to date");
        }
        [current] => {
            let name = current.name_any();
            retry_on_conflict(&ctx.conflict_retry, "update_local_network_config", || async {
                let Some(mut latest) = ctx.store.get_network_config(&ctx.namespace, &name).await?
                else {
                    return Ok(());
                };
                latest.spec = spec.clone();
                ctx.store.replace_network_config(&latest).await?;
                Ok(())
            })
            .await?;
            info!(network_config = %name, "Local NetworkConfig updated");
        }
        duplicates => {
            warn!(
                count = duplicates.len(),
                "Multiple local NetworkConfigs for one peer, deleting all of them"
            );
            for nc in duplicates {
                ctx.store
                    .delete_network_config(&ctx.namespace, &nc.name_any())
                    .await?;
            }
            return Ok(Action::requeue(DUPLICATE_REQUEUE));
        }
    }

    ctx.backoff.reset(&backoff_key(fc.as_ref()));
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the ForeignCluster controller
pub fn error_policy(fc: Arc<ForeignCluster>, error: &Error, ctx: Arc<NetworkContext>) -> Action {
    let delay = ctx.backoff.next(&backoff_key(fc.as_ref()));
    error!(
        ?error,
        foreign_cluster = %fc.name_any(),
        retry_in = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::LocalParameters;
    use crate::store::{MemoryStore, NetworkStore};
    use peerlink_common::crd::{ForeignClusterSpec, ForeignClusterStatus};
    use peerlink_common::{PEERLINK_SYSTEM_NAMESPACE as NS, PUBLIC_KEY_CONFIG};
    use peerlink_ipam::Ipam;

    fn foreign_cluster(active: bool) -> ForeignCluster {
        let mut fc = ForeignCluster::new(
            "cluster-b",
            ForeignClusterSpec {
                cluster_id: "cluster-b".to_string(),
            },
        );
        fc.metadata.uid = Some("fc-uid".to_string());
        fc.status = Some(ForeignClusterStatus {
            peering_active: active,
        });
        fc
    }

    async fn context(store: Arc<MemoryStore>) -> Arc<NetworkContext> {
        let params = Arc::new(LocalParameters::new("wireguard"));
        params.set_network("10.0.0.0/16", "10.1.0.0/16").await;
        params.set_endpoint("203.0.113.10", 51820).await;
        params.set_public_key("local-key=").await;
        Arc::new(
            NetworkContext::builder(store, Arc::new(Ipam::in_memory()), "cluster-a")
                .params(params)
                .build(),
        )
    }

    #[tokio::test]
    async fn active_peering_creates_one_local_record() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        let fc = Arc::new(foreign_cluster(true));

        reconcile(fc.clone(), ctx.clone()).await.unwrap();
        reconcile(fc, ctx).await.unwrap();

        let ncs = store.network_configs(NS).await;
        assert_eq!(ncs.len(), 1);
        let nc = &ncs[0];
        assert!(nc.name_any().starts_with(NETWORK_CONFIG_GENERATE_NAME));
        assert_eq!(nc.spec.cluster_id, "cluster-b");
        assert_eq!(nc.spec.pod_cidr, "10.0.0.0/16");
        assert_eq!(nc.spec.backend_config[PUBLIC_KEY_CONFIG], "local-key=");
        assert!(labels::matches(
            nc.metadata.labels.as_ref(),
            &labels::local_network_config_selector("cluster-b")
        ));
        assert_eq!(nc.metadata.owner_references.as_ref().unwrap()[0].uid, "fc-uid");
    }

    #[tokio::test]
    async fn parameter_change_updates_record() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        let fc = Arc::new(foreign_cluster(true));
        reconcile(fc.clone(), ctx.clone()).await.unwrap();

        ctx.params.set_endpoint("198.51.100.7", 51821).await;
        reconcile(fc, ctx).await.unwrap();

        let ncs = store.network_configs(NS).await;
        assert_eq!(ncs.len(), 1);
        assert_eq!(ncs[0].spec.endpoint_ip, "198.51.100.7");
        assert_eq!(ncs[0].spec.backend_config["listeningPort"], "51821");
    }

    #[tokio::test]
    async fn inactive_peering_deletes_record() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        reconcile(Arc::new(foreign_cluster(true)), ctx.clone()).await.unwrap();

        reconcile(Arc::new(foreign_cluster(false)), ctx).await.unwrap();
        assert!(store.network_configs(NS).await.is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_deleted_then_recreated() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone()).await;
        let fc = Arc::new(foreign_cluster(true));
        reconcile(fc.clone(), ctx.clone()).await.unwrap();
        let copy = store.network_configs(NS).await.remove(0);
        let mut duplicate = NetworkConfig::new("net-config-dup", copy.spec.clone());
        duplicate.metadata.namespace = Some(NS.to_string());
        duplicate.metadata.labels = copy.metadata.labels.clone();
        store.create_network_config(&duplicate).await.unwrap();

        let action = reconcile(fc.clone(), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(DUPLICATE_REQUEUE));
        assert!(store.network_configs(NS).await.is_empty());

        reconcile(fc, ctx).await.unwrap();
        assert_eq!(store.network_configs(NS).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_parameters_are_not_ready() {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(
            NetworkContext::builder(store, Arc::new(Ipam::in_memory()), "cluster-a").build(),
        );
        let err = reconcile(Arc::new(foreign_cluster(true)), ctx)
            .await
            .unwrap_err();
        assert!(err.is_not_ready());
    }
}

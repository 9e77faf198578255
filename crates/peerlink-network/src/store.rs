//! Record store boundary for the network reconcilers
//!
//! The reconcilers never talk to the API server directly. Everything goes
//! through [`NetworkStore`], which has a Kubernetes implementation
//! ([`KubeNetworkStore`]) and an in-memory one ([`MemoryStore`]) that keeps
//! the API server semantics the reconcilers depend on:
//!
//! - `create` honours `generateName` and rejects existing names
//! - `replace` and `replace_*_status` fail with [`Error::Conflict`] when the
//!   caller's `resourceVersion` is stale
//! - `replace` never touches status, `replace_*_status` never touches
//!   anything else
//! - `delete` of an object with finalizers only sets `deletionTimestamp`;
//!   the object disappears once the last finalizer is removed

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use peerlink_common::crd::{
    ForeignCluster, NetworkConfig, PeeringConfig, PeeringConfigStatus, TunnelEndpoint,
};
use peerlink_common::kube_utils::{delete_ignore_missing, get_opt};
use peerlink_common::labels;
use peerlink_common::{Error, Result};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

/// Records read and written by the network and gateway reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Get a NetworkConfig by name
    async fn get_network_config(&self, namespace: &str, name: &str)
        -> Result<Option<NetworkConfig>>;

    /// List NetworkConfigs carrying every label of `selector`
    async fn list_network_configs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NetworkConfig>>;

    /// Create a NetworkConfig; `generateName` is honoured
    async fn create_network_config(&self, nc: &NetworkConfig) -> Result<NetworkConfig>;

    /// Replace metadata and spec, checked against `resourceVersion`
    async fn replace_network_config(&self, nc: &NetworkConfig) -> Result<NetworkConfig>;

    /// Replace the status, checked against `resourceVersion`
    async fn replace_network_config_status(&self, nc: &NetworkConfig) -> Result<NetworkConfig>;

    /// Delete a NetworkConfig; a missing record is not an error
    async fn delete_network_config(&self, namespace: &str, name: &str) -> Result<()>;

    /// Get a TunnelEndpoint by name
    async fn get_tunnel_endpoint(&self, namespace: &str, name: &str)
        -> Result<Option<TunnelEndpoint>>;

    /// List TunnelEndpoints carrying every label of `selector`
    async fn list_tunnel_endpoints(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<TunnelEndpoint>>;

    /// Create a TunnelEndpoint; `generateName` is honoured
    async fn create_tunnel_endpoint(&self, tep: &TunnelEndpoint) -> Result<TunnelEndpoint>;

    /// Replace metadata and spec, checked against `resourceVersion`
    async fn replace_tunnel_endpoint(&self, tep: &TunnelEndpoint) -> Result<TunnelEndpoint>;

    /// Replace the status, checked against `resourceVersion`
    async fn replace_tunnel_endpoint_status(&self, tep: &TunnelEndpoint)
        -> Result<TunnelEndpoint>;

    /// Delete a TunnelEndpoint; a missing record is not an error
    async fn delete_tunnel_endpoint(&self, namespace: &str, name: &str) -> Result<()>;

    /// ForeignCluster whose `spec.clusterId` is `cluster_id`
    async fn find_foreign_cluster(&self, cluster_id: &str) -> Result<Option<ForeignCluster>>;

    /// Overwrite the status of a PeeringConfig
    async fn update_peering_config_status(
        &self,
        name: &str,
        status: &PeeringConfigStatus,
    ) -> Result<()>;
}

/// True once the record has been marked for deletion
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

// =============================================================================
// Kubernetes
// =============================================================================

/// [`NetworkStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeNetworkStore {
    client: Client,
}

impl KubeNetworkStore {
    /// Store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn network_configs(&self, namespace: &str) -> Api<NetworkConfig> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn tunnel_endpoints(&self, namespace: &str) -> Api<TunnelEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: Resource<DynamicType = ()>>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::validation_for(K::kind(&()), "metadata.namespace is required"))
}

fn list_params(selector: &BTreeMap<String, String>) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&labels::selector_string(selector))
    }
}

/// Merge patch of the status guarded by the object's resourceVersion
fn status_patch<K: Resource, S: serde::Serialize>(obj: &K, status: &Option<S>) -> serde_json::Value {
    json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": status,
    })
}

#[async_trait]
impl NetworkStore for KubeNetworkStore {
    async fn get_network_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkConfig>> {
        get_opt(&self.network_configs(namespace), name).await
    }

    async fn list_network_configs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NetworkConfig>> {
        let list = self
            .network_configs(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_network_config(&self, nc: &NetworkConfig) -> Result<NetworkConfig> {
        let api = self.network_configs(&namespace_of(nc)?);
        Ok(api.create(&PostParams::default(), nc).await?)
    }

    async fn replace_network_config(&self, nc: &NetworkConfig) -> Result<NetworkConfig> {
        let api = self.network_configs(&namespace_of(nc)?);
        Ok(api.replace(&nc.name_any(), &PostParams::default(), nc).await?)
    }

    async fn replace_network_config_status(&self, nc: &NetworkConfig) -> Result<NetworkConfig> {
        let api = self.network_configs(&namespace_of(nc)?);
        let patch = status_patch(nc, &nc.status);
        Ok(api
            .patch_status(&nc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete_network_config(&self, namespace: &str, name: &str) -> Result<()> {
        delete_ignore_missing(&self.network_configs(namespace), name).await
    }

    async fn get_tunnel_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TunnelEndpoint>> {
        get_opt(&self.tunnel_endpoints(namespace), name).await
    }

    async fn list_tunnel_endpoints(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<TunnelEndpoint>> {
        let list = self
            .tunnel_endpoints(namespace)
            .list(&list_params(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_tunnel_endpoint(&self, tep: &TunnelEndpoint) -> Result<TunnelEndpoint> {
        let api = self.tunnel_endpoints(&namespace_of(tep)?);
        Ok(api.create(&PostParams::default(), tep).await?)
    }

    async fn replace_tunnel_endpoint(&self, tep: &TunnelEndpoint) -> Result<TunnelEndpoint> {
        let api = self.tunnel_endpoints(&namespace_of(tep)?);
        Ok(api.replace(&tep.name_any(), &PostParams::default(), tep).await?)
    }

    async fn replace_tunnel_endpoint_status(
        &self,
        tep: &TunnelEndpoint,
    ) -> Result<TunnelEndpoint> {
        let api = self.tunnel_endpoints(&namespace_of(tep)?);
        let patch = status_patch(tep, &tep.status);
        Ok(api
            .patch_status(&tep.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete_tunnel_endpoint(&self, namespace: &str, name: &str) -> Result<()> {
        delete_ignore_missing(&self.tunnel_endpoints(namespace), name).await
    }

    async fn find_foreign_cluster(&self, cluster_id: &str) -> Result<Option<ForeignCluster>> {
        let api: Api<ForeignCluster> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .find(|fc| fc.spec.cluster_id == cluster_id))
    }

    async fn update_peering_config_status(
        &self,
        name: &str,
        status: &PeeringConfigStatus,
    ) -> Result<()> {
        let api: Api<PeeringConfig> = Api::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// In memory
// =============================================================================

/// Records with a status subresource
trait Record: Resource<DynamicType = ()> + Clone + Send + Sync {
    fn copy_status_from(&mut self, other: &Self);
    fn clear_status(&mut self);
}

impl Record for NetworkConfig {
    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
    fn clear_status(&mut self) {
        self.status = None;
    }
}

impl Record for TunnelEndpoint {
    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
    fn clear_status(&mut self) {
        self.status = None;
    }
}

type Key = (String, String);

fn has_finalizers<K: Resource>(obj: &K) -> bool {
    obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

fn key_of<K: Record>(obj: &K) -> Result<Key> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation_for(K::kind(&()), "metadata.name is required"))?;
    Ok((namespace_of(obj)?, name))
}

/// One kind's worth of records
struct Table<K> {
    records: BTreeMap<Key, K>,
}

impl<K> Default for Table<K> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<K: Record> Table<K> {
    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Vec<K> {
        self.records
            .iter()
            .filter(|((ns, _), obj)| ns == namespace && labels::matches(obj.meta().labels.as_ref(), selector))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn create(&mut self, obj: &K, version: u64) -> Result<K> {
        let mut obj = obj.clone();
        let namespace = namespace_of(&obj)?;
        let meta = obj.meta_mut();
        let name = match (meta.name.clone(), meta.generate_name.clone()) {
            (Some(name), _) => name,
            (None, Some(prefix)) => format!("{prefix}{version:05}"),
            (None, None) => {
                return Err(Error::validation_for(
                    K::kind(&()),
                    "metadata.name or metadata.generateName is required",
                ))
            }
        };
        let key = (namespace, name.clone());
        if self.records.contains_key(&key) {
            return Err(Error::conflict(format!(
                "{} {}/{} already exists",
                K::kind(&()),
                key.0,
                key.1
            )));
        }

        meta.name = Some(name);
        meta.uid = Some(format!("uid-{version}"));
        meta.resource_version = Some(version.to_string());
        meta.deletion_timestamp = None;
        obj.clear_status();

        self.records.insert(key, obj.clone());
        Ok(obj)
    }

    fn current(&self, obj: &K) -> Result<(Key, &K)> {
        let key = key_of(obj)?;
        let stored = self.records.get(&key).ok_or_else(|| {
            Error::not_ready(
                K::kind(&()),
                format!("{}/{} not found", key.0, key.1),
            )
        })?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(Error::conflict(format!(
                "{} {}/{} has been modified",
                K::kind(&()),
                key.0,
                key.1
            )));
        }
        Ok((key, stored))
    }

    fn replace(&mut self, obj: &K, version: u64) -> Result<K> {
        let (key, stored) = self.current(obj)?;
        let mut next = obj.clone();
        next.copy_status_from(stored);
        let meta = next.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
        meta.resource_version = Some(version.to_string());

        if is_deleting(&next) && !has_finalizers(&next) {
            debug!(kind = %K::kind(&()), name = %key.1, "Last finalizer removed, record deleted");
            self.records.remove(&key);
        } else {
            self.records.insert(key, next.clone());
        }
        Ok(next)
    }

    fn replace_status(&mut self, obj: &K, version: u64) -> Result<K> {
        let (key, stored) = self.current(obj)?;
        let mut next = stored.clone();
        next.copy_status_from(obj);
        next.meta_mut().resource_version = Some(version.to_string());
        self.records.insert(key, next.clone());
        Ok(next)
    }

    fn delete(&mut self, namespace: &str, name: &str, version: u64) {
        let key = (namespace.to_string(), name.to_string());
        match self.records.get(&key) {
            None => return,
            Some(stored) if !has_finalizers(stored) => {
                self.records.remove(&key);
                return;
            }
            Some(_) => {}
        }
        let Some(stored) = self.records.get_mut(&key) else {
            return;
        };
        let meta = stored.meta_mut();
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
            meta.resource_version = Some(version.to_string());
        }
    }
}

#[derive(Default)]
struct Records {
    network_configs: Table<NetworkConfig>,
    tunnel_endpoints: Table<TunnelEndpoint>,
    foreign_clusters: BTreeMap<String, ForeignCluster>,
    peering_configs: BTreeMap<String, PeeringConfigStatus>,
}

/// In-memory [`NetworkStore`] with API server write semantics
///
/// Used by tests and by the two-cluster simulation. Foreign clusters are
/// seeded with [`MemoryStore::put_foreign_cluster`] since the fabric only
/// reads them.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
    version: AtomicU64,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or replace a ForeignCluster, assigning a uid when missing
    pub async fn put_foreign_cluster(&self, mut fc: ForeignCluster) {
        let version = self.next_version();
        let name = fc.name_any();
        let meta = fc.meta_mut();
        meta.uid.get_or_insert_with(|| format!("uid-{version}"));
        meta.resource_version = Some(version.to_string());
        self.records.lock().await.foreign_clusters.insert(name, fc);
    }

    /// Remove a ForeignCluster
    pub async fn remove_foreign_cluster(&self, name: &str) {
        self.records.lock().await.foreign_clusters.remove(name);
    }

    /// Last status written for a PeeringConfig
    pub async fn peering_config_status(&self, name: &str) -> Option<PeeringConfigStatus> {
        self.records.lock().await.peering_configs.get(name).cloned()
    }

    /// Every NetworkConfig in a namespace
    pub async fn network_configs(&self, namespace: &str) -> Vec<NetworkConfig> {
        self.records
            .lock()
            .await
            .network_configs
            .list(namespace, &BTreeMap::new())
    }

    /// Every TunnelEndpoint in a namespace
    pub async fn tunnel_endpoints(&self, namespace: &str) -> Vec<TunnelEndpoint> {
        self.records
            .lock()
            .await
            .tunnel_endpoints
            .list(namespace, &BTreeMap::new())
    }
}

#[async_trait]
impl NetworkStore for MemoryStore {
    async fn get_network_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkConfig>> {
        Ok(self.records.lock().await.network_configs.get(namespace, name))
    }

    async fn list_network_configs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NetworkConfig>> {
        Ok(self
            .records
            .lock()
            .await
            .network_configs
            .list(namespace, selector))
    }

    async fn create_network_config(&self, nc: &NetworkConfig) -> Result<NetworkConfig> {
        let version = self.next_version();
        self.records.lock().await.network_configs.create(nc, version)
    }

    async fn replace_network_config(&self, nc: &NetworkConfig) -> Result<NetworkConfig> {
        let version = self.next_version();
        self.records.lock().await.network_configs.replace(nc, version)
    }

    async fn replace_network_config_status(&self, nc: &NetworkConfig) -> Result<NetworkConfig> {
        let version = self.next_version();
        self.records
            .lock()
            .await
            .network_configs
            .replace_status(nc, version)
    }

    async fn delete_network_config(&self, namespace: &str, name: &str) -> Result<()> {
        let version = self.next_version();
        self.records
            .lock()
            .await
            .network_configs
            .delete(namespace, name, version);
        Ok(())
    }

    async fn get_tunnel_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<TunnelEndpoint>> {
        Ok(self.records.lock().await.tunnel_endpoints.get(namespace, name))
    }

    async fn list_tunnel_endpoints(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<TunnelEndpoint>> {
        Ok(self
            .records
            .lock()
            .await
            .tunnel_endpoints
            .list(namespace, selector))
    }

    async fn create_tunnel_endpoint(&self, tep: &TunnelEndpoint) -> Result<TunnelEndpoint> {
        let version = self.next_version();
        self.records.lock().await.tunnel_endpoints.create(tep, version)
    }

    async fn replace_tunnel_endpoint(&self, tep: &TunnelEndpoint) -> Result<TunnelEndpoint> {
        let version = self.next_version();
        self.records.lock().await.tunnel_endpoints.replace(tep, version)
    }

    async fn replace_tunnel_endpoint_status(
        &self,
        tep: &TunnelEndpoint,
    ) -> Result<TunnelEndpoint> {
        let version = self.next_version();
        self.records
            .lock()
            .await
            .tunnel_endpoints
            .replace_status(tep, version)
    }

    async fn delete_tunnel_endpoint(&self, namespace: &str, name: &str) -> Result<()> {
        let version = self.next_version();
        self.records
            .lock()
            .await
            .tunnel_endpoints
            .delete(namespace, name, version);
        Ok(())
    }

    async fn find_foreign_cluster(&self, cluster_id: &str) -> Result<Option<ForeignCluster>> {
        Ok(self
            .records
            .lock()
            .await
            .foreign_clusters
            .values()
            .find(|fc| fc.spec.cluster_id == cluster_id)
            .cloned())
    }

    async fn update_peering_config_status(
        &self,
        name: &str,
        status: &PeeringConfigStatus,
    ) -> Result<()> {
        self.records
            .lock()
            .await
            .peering_configs
            .insert(name.to_string(), status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_common::crd::{NetworkConfigSpec, NetworkConfigStatus};
    use peerlink_common::PEERLINK_SYSTEM_NAMESPACE as NS;

    fn generated(prefix: &str) -> NetworkConfig {
        let mut nc = NetworkConfig::new("", NetworkConfigSpec::default());
        nc.metadata.name = None;
        nc.metadata.generate_name = Some(prefix.to_string());
        nc.metadata.namespace = Some(NS.to_string());
        nc.metadata.labels = Some(labels::local_network_config_labels("cluster-b"));
        nc
    }

    #[tokio::test]
    async fn create_generates_unique_names() {
        let store = MemoryStore::new();
        let a = store.create_network_config(&generated("net-config-")).await.unwrap();
        let b = store.create_network_config(&generated("net-config-")).await.unwrap();

        assert!(a.name_any().starts_with("net-config-"));
        assert_ne!(a.name_any(), b.name_any());
        assert_ne!(a.uid(), b.uid());
        assert_eq!(store.network_configs(NS).await.len(), 2);
    }

    #[tokio::test]
    async fn create_drops_status_and_rejects_existing_names() {
        let store = MemoryStore::new();
        let mut nc = NetworkConfig::new("nc", NetworkConfigSpec::default());
        nc.metadata.namespace = Some(NS.to_string());
        nc.status = Some(NetworkConfigStatus::processed("None", "None"));

        let created = store.create_network_config(&nc).await.unwrap();
        assert!(created.status.is_none());

        let err = store.create_network_config(&nc).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create_network_config(&generated("nc-")).await.unwrap();

        let mut first = created.clone();
        first.spec.pod_cidr = "10.0.0.0/16".to_string();
        store.replace_network_config(&first).await.unwrap();

        let mut second = created;
        second.spec.pod_cidr = "10.1.0.0/16".to_string();
        let err = store.replace_network_config(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn replace_and_status_do_not_overlap() {
        let store = MemoryStore::new();
        let created = store.create_network_config(&generated("nc-")).await.unwrap();

        let mut with_status = created.clone();
        with_status.status = Some(NetworkConfigStatus::processed("None", "None"));
        with_status.spec.pod_cidr = "ignored".to_string();
        let after_status = store
            .replace_network_config_status(&with_status)
            .await
            .unwrap();
        assert!(after_status.is_processed());
        assert_eq!(after_status.spec.pod_cidr, "");

        let mut with_spec = after_status.clone();
        with_spec.status = None;
        with_spec.spec.pod_cidr = "10.0.0.0/16".to_string();
        let after_spec = store.replace_network_config(&with_spec).await.unwrap();
        assert!(after_spec.is_processed());
        assert_eq!(after_spec.spec.pod_cidr, "10.0.0.0/16");
    }

    #[tokio::test]
    async fn finalizers_hold_deletion() {
        let store = MemoryStore::new();
        let mut nc = generated("nc-");
        nc.metadata.finalizers = Some(vec!["net.peerlink.dev/test".to_string()]);
        let created = store.create_network_config(&nc).await.unwrap();
        let name = created.name_any();

        store.delete_network_config(NS, &name).await.unwrap();
        let deleting = store.get_network_config(NS, &name).await.unwrap().unwrap();
        assert!(is_deleting(&deleting));

        let mut released = deleting;
        released.metadata.finalizers = Some(vec![]);
        store.replace_network_config(&released).await.unwrap();
        assert!(store.get_network_config(NS, &name).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_selector() {
        let store = MemoryStore::new();
        store.create_network_config(&generated("nc-")).await.unwrap();

        let hits = store
            .list_network_configs(NS, &labels::local_network_config_selector("cluster-b"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = store
            .list_network_configs(NS, &labels::remote_network_config_selector("cluster-b"))
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete_tunnel_endpoint(NS, "missing").await.unwrap();
    }
}

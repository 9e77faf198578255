//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use tracing::info;

use crate::Error;

/// Field manager used for every server-side apply issued by peerlink
pub const FIELD_MANAGER: &str = "peerlink-operator";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Install or update CRDs with server-side apply
pub async fn apply_crds(client: &Client, crds: &[CustomResourceDefinition]) -> Result<(), Error> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in crds {
        let name = crd.name_any();
        api.patch(&name, &params, &Patch::Apply(crd)).await?;
        info!(crd = %name, "CRD applied");
    }
    Ok(())
}

/// Get a resource, mapping 404 to `None`
pub async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete a resource, treating 404 as success
pub async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True if the object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Owner reference pointing at `owner`
///
/// Returns `None` when the owner has not been persisted yet (no uid).
pub fn owner_reference<K>(owner: &K, controller: bool) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: controller.then_some(true),
        block_owner_deletion: controller.then_some(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ForeignCluster, ForeignClusterSpec, NetworkConfig, NetworkConfigSpec};

    #[test]
    fn owner_reference_requires_uid() {
        let nc = NetworkConfig::new("net-config-abc", NetworkConfigSpec::default());
        assert!(owner_reference(&nc, true).is_none());
    }

    #[test]
    fn controller_owner_reference() {
        let mut nc = NetworkConfig::new("net-config-abc", NetworkConfigSpec::default());
        nc.metadata.uid = Some("uid-1".to_string());

        let owner = owner_reference(&nc, true).expect("owner reference");
        assert_eq!(owner.kind, "NetworkConfig");
        assert_eq!(owner.api_version, "net.peerlink.dev/v1alpha1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn secondary_owner_is_not_controller() {
        let mut fc = ForeignCluster::new(
            "cluster-b",
            ForeignClusterSpec {
                cluster_id: "cluster-b".to_string(),
            },
        );
        fc.metadata.uid = Some("uid-fc".to_string());

        let owner = owner_reference(&fc, false).expect("owner reference");
        assert_eq!(owner.api_version, "discovery.peerlink.dev/v1alpha1");
        assert_eq!(owner.controller, None);
    }

    #[test]
    fn finalizer_detection() {
        let mut nc = NetworkConfig::new("nc", NetworkConfigSpec::default());
        assert!(!has_finalizer(&nc, "net.peerlink.dev/finalizer"));
        nc.metadata.finalizers = Some(vec!["net.peerlink.dev/finalizer".to_string()]);
        assert!(has_finalizer(&nc, "net.peerlink.dev/finalizer"));
    }
}

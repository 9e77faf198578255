//! Persistence backends for IPAM state
//!
//! The IPAM writes a full snapshot after every mutation and reads it once at
//! startup, so allocations survive process restarts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use peerlink_common::kube_utils::{get_opt, FIELD_MANAGER};
use peerlink_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ipam::IpamState;

/// Name of the ConfigMap holding the IPAM snapshot
pub const IPAM_CONFIGMAP: &str = "peerlink-ipam-storage";

/// Key of the snapshot inside the ConfigMap
pub const IPAM_DATA_KEY: &str = "ipam.json";

/// Durable store for the IPAM snapshot
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IpamStorage: Send + Sync {
    /// Load the last saved snapshot, if any
    async fn load(&self) -> Result<Option<IpamState>>;

    /// Replace the stored snapshot
    async fn save(&self, state: &IpamState) -> Result<()>;
}

/// Snapshot kept in a ConfigMap
pub struct ConfigMapStorage {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapStorage {
    /// Storage in the default ConfigMap of `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self::with_name(client, namespace, IPAM_CONFIGMAP)
    }

    /// Storage in a named ConfigMap
    pub fn with_name(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait]
impl IpamStorage for ConfigMapStorage {
    async fn load(&self) -> Result<Option<IpamState>> {
        let Some(cm) = get_opt(&self.api, &self.name).await? else {
            debug!(configmap = %self.name, "No IPAM snapshot stored yet");
            return Ok(None);
        };
        let Some(raw) = cm.data.as_ref().and_then(|d| d.get(IPAM_DATA_KEY)) else {
            return Ok(None);
        };
        let state = serde_json::from_str(raw).map_err(|e| {
            Error::storage(format!(
                "corrupt IPAM snapshot in configmap {}: {}",
                self.name, e
            ))
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &IpamState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        let cm = ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(IPAM_DATA_KEY.to_string(), raw)])),
            ..Default::default()
        };
        self.api
            .patch(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&cm),
            )
            .await
            .map_err(|e| {
                Error::storage(format!("failed to save configmap {}: {}", self.name, e))
            })?;
        Ok(())
    }
}

/// Snapshot kept in process memory
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<Option<IpamState>>,
}

impl MemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with a snapshot
    pub fn with_state(state: IpamState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

#[async_trait]
impl IpamStorage for MemoryStorage {
    async fn load(&self) -> Result<Option<IpamState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &IpamState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }
}

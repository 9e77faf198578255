//! WireGuard key pair and its durable storage
//!
//! The key pair is generated once and kept in a Secret, so restarts never
//! rotate the public key peers have already been configured with.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use peerlink_common::kube_utils::get_opt;
use peerlink_common::{Error, Result, WIREGUARD_BACKEND};
use rand_core::OsRng;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a Curve25519 key in bytes
pub const KEY_LENGTH: usize = 32;

/// Name of the Secret holding the key pair
pub const KEY_SECRET_NAME: &str = "peerlink-wireguard-keys";

/// Secret key holding the base64 private key
pub const PRIVATE_KEY_FIELD: &str = "privateKey";

/// Secret key holding the base64 public key
pub const PUBLIC_KEY_FIELD: &str = "publicKey";

/// A WireGuard key pair
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    private_key: [u8; KEY_LENGTH],
    public_key: [u8; KEY_LENGTH],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_private_key(secret.to_bytes())
    }

    /// Derive the key pair from an existing private key
    pub fn from_private_key(private_key: [u8; KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(private_key);
        let public = PublicKey::from(&secret);
        Self {
            private_key,
            public_key: public.to_bytes(),
        }
    }

    /// Derive the key pair from a base64 private key
    pub fn from_private_key_base64(private_key: &str) -> Result<Self> {
        Ok(Self::from_private_key(decode_key(private_key)?))
    }

    /// Private key as base64
    pub fn private_key_base64(&self) -> String {
        STANDARD.encode(self.private_key)
    }

    /// Public key as base64
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Decode a base64 Curve25519 key
pub fn decode_key(key: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = STANDARD
        .decode(key.trim())
        .map_err(|e| Error::driver(WIREGUARD_BACKEND, format!("invalid key encoding: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        Error::driver(
            WIREGUARD_BACKEND,
            format!("invalid key length: expected {}, got {}", KEY_LENGTH, b.len()),
        )
    })
}

/// Durable location of the key pair
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load the stored key pair, if any
    async fn load(&self) -> Result<Option<KeyPair>>;

    /// Store a new key pair; fails with a conflict when one already exists
    async fn create(&self, keys: &KeyPair) -> Result<()>;
}

/// Load the stored key pair or create one
///
/// When another replica wins the creation race, its key pair is used.
pub async fn ensure_keys(store: &dyn KeyStore) -> Result<KeyPair> {
    if let Some(keys) = store.load().await? {
        debug!(public_key = %keys.public_key_base64(), "Loaded WireGuard keys");
        return Ok(keys);
    }

    let keys = KeyPair::generate();
    match store.create(&keys).await {
        Ok(()) => {
            info!(public_key = %keys.public_key_base64(), "Generated WireGuard keys");
            Ok(keys)
        }
        Err(e) if e.is_conflict() => store.load().await?.ok_or_else(|| {
            Error::not_ready("Secret", "key secret created concurrently but not readable yet")
        }),
        Err(e) => Err(e),
    }
}

/// Key pair kept in a Kubernetes Secret
pub struct SecretKeyStore {
    api: Api<Secret>,
    name: String,
}

impl SecretKeyStore {
    /// Store in the default Secret of `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self::with_name(client, namespace, KEY_SECRET_NAME)
    }

    /// Store in a named Secret
    pub fn with_name(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }
}

#[async_trait]
impl KeyStore for SecretKeyStore {
    async fn load(&self) -> Result<Option<KeyPair>> {
        let Some(secret) = get_opt(&self.api, &self.name).await? else {
            return Ok(None);
        };
        let Some(raw) = secret.data.as_ref().and_then(|d| d.get(PRIVATE_KEY_FIELD)) else {
            return Err(Error::validation_for(
                format!("Secret/{}", self.name),
                format!("missing key {}", PRIVATE_KEY_FIELD),
            ));
        };
        let encoded = std::str::from_utf8(&raw.0).map_err(|e| {
            Error::validation_for(format!("Secret/{}", self.name), e.to_string())
        })?;
        KeyPair::from_private_key_base64(encoded).map(Some)
    }

    async fn create(&self, keys: &KeyPair) -> Result<()> {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([
                (PRIVATE_KEY_FIELD.to_string(), keys.private_key_base64()),
                (PUBLIC_KEY_FIELD.to_string(), keys.public_key_base64()),
            ])),
            ..Default::default()
        };
        self.api.create(&PostParams::default(), &secret).await?;
        Ok(())
    }
}

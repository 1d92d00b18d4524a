//! Scoped secrets
//!
//! One secret object per scope holds every key for that scope; its id is
//! published in peer data under `internal-secret` so other units can find
//! it. `SecretStore` caches the content for the lifetime of one event and
//! skips writes that would not change anything. Deleted keys are overwritten
//! with a tombstone instead of being removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::secrets::{INTERNAL_LABEL, TOMBSTONE};
use crate::resources::common::{patch_params, standard_labels};
use crate::resources::peer_data::{PeerStore, PeerStoreError, Scope};

pub type SecretContent = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Peer data error: {0}")]
    PeerStore(#[from] PeerStoreError),

    #[error("Couldn't set secret {scope}:{key}")]
    NotAdded { scope: Scope, key: String },
}

/// Storage for whole secret objects
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Create a secret for `scope` and return its id
    async fn create(&self, scope: Scope, content: &SecretContent) -> Result<String, SecretError>;

    /// Fetch secret content; `None` when the id is unknown
    async fn get(&self, id: &str) -> Result<Option<SecretContent>, SecretError>;

    async fn set_content(&self, id: &str, content: &SecretContent) -> Result<(), SecretError>;
}

/// Generate a random alphanumeric password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate replica set keyfile content (mongod accepts 6..=1024 base64 chars)
pub fn generate_keyfile() -> String {
    generate_password(1024)
}

/// Compare secret ids regardless of form
///
/// Ids may be fully qualified (`secret://<model>/<id>`) or short
/// (`secret:<id>`); only the trailing id is significant.
pub fn compare_secret_ids(a: &str, b: &str) -> bool {
    fn pure(id: &str) -> &str {
        id.rsplit(['/', ':']).next().unwrap_or(id)
    }
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let (a, b) = (pure(a), pure(b));
    !a.is_empty() && a == b
}

#[derive(Clone, Debug)]
struct CachedSecret {
    id: String,
    content: SecretContent,
}

/// Secret accessor with a per-event cache
pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
    peers: Arc<dyn PeerStore>,
    cache: Mutex<HashMap<Scope, CachedSecret>>,
}

impl SecretStore {
    pub fn new(backend: Arc<dyn SecretBackend>, peers: Arc<dyn PeerStore>) -> Self {
        Self {
            backend,
            peers,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop cached content; called before each delivered event
    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }

    /// Drop cached content for one scope
    pub async fn invalidate_scope(&self, scope: Scope) {
        self.cache.lock().await.remove(&scope);
    }

    /// Re-read the scope's secret from the backend
    pub async fn reload(&self, scope: Scope) -> Result<(), SecretError> {
        self.invalidate_scope(scope).await;
        self.load(scope).await?;
        Ok(())
    }

    /// Id of the scope's secret as published in peer data
    pub async fn secret_id(&self, scope: Scope) -> Result<Option<String>, SecretError> {
        Ok(self.peers.get(scope, INTERNAL_LABEL).await?)
    }

    /// Load the scope's secret into the cache if not already there
    async fn load(&self, scope: Scope) -> Result<Option<CachedSecret>, SecretError> {
        if let Some(cached) = self.cache.lock().await.get(&scope) {
            return Ok(Some(cached.clone()));
        }

        let Some(id) = self.secret_id(scope).await? else {
            return Ok(None);
        };

        let Some(content) = self.backend.get(&id).await? else {
            debug!("No secret found for ID {}", id);
            return Ok(None);
        };
        debug!("Secret {} downloaded", id);

        let cached = CachedSecret { id, content };
        self.cache.lock().await.insert(scope, cached.clone());
        Ok(Some(cached))
    }

    pub async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, SecretError> {
        if key.is_empty() {
            return Ok(None);
        }
        let value = self
            .load(scope)
            .await?
            .and_then(|s| s.content.get(key).cloned())
            .filter(|v| !v.is_empty() && v != TOMBSTONE);
        if value.is_none() {
            debug!("No value found for secret {}:{}", scope, key);
        }
        Ok(value)
    }

    /// Set a key, returning the id of the scope's secret
    ///
    /// An empty value removes the key. Setting the cached value again is a
    /// no-op that performs no backend write.
    pub async fn set(
        &self,
        scope: Scope,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, SecretError> {
        if value.is_empty() {
            self.remove(scope, key).await?;
            return Ok(None);
        }

        if let Some(mut secret) = self.load(scope).await? {
            if secret.content.get(key).map(String::as_str) == Some(value) {
                debug!("Key {}:{} has this value defined already", scope, key);
                return Ok(Some(secret.id));
            }
            secret.content.insert(key.to_string(), value.to_string());
            if let Err(e) = self.backend.set_content(&secret.id, &secret.content).await {
                error!(
                    "Error in attempt to set {}:{}. Existing keys were: {:?}. {}",
                    scope,
                    key,
                    secret.content.keys().collect::<Vec<_>>(),
                    e
                );
                return Err(e);
            }
            debug!("Secret {}:{} was set", scope, key);
            let id = secret.id.clone();
            self.cache.lock().await.insert(scope, secret);
            return Ok(Some(id));
        }

        let content = SecretContent::from([(key.to_string(), value.to_string())]);
        let id = self.backend.create(scope, &content).await?;
        if id.is_empty() {
            return Err(SecretError::NotAdded {
                scope,
                key: key.to_string(),
            });
        }
        self.peers.set(scope, INTERNAL_LABEL, &id).await?;
        debug!("Secret {}:{} published (as first). ID: {}", scope, key, id);
        self.cache.lock().await.insert(
            scope,
            CachedSecret {
                id: id.clone(),
                content,
            },
        );
        Ok(Some(id))
    }

    /// Logically delete a key by writing the tombstone
    pub async fn remove(&self, scope: Scope, key: &str) -> Result<(), SecretError> {
        let Some(mut secret) = self.load(scope).await? else {
            error!("Secret {}:{} wasn't deleted: no secrets are available", scope, key);
            return Ok(());
        };
        if !secret.content.contains_key(key) {
            error!("No secret {}:{}", scope, key);
            return Ok(());
        }
        secret.content.insert(key.to_string(), TOMBSTONE.to_string());
        self.backend.set_content(&secret.id, &secret.content).await?;
        debug!("Secret {}:{} deleted", scope, key);
        self.cache.lock().await.insert(scope, secret);
        Ok(())
    }
}

/// Secret backend storing each scope's content in a Kubernetes Secret
pub struct KubeSecretBackend {
    api: Api<Secret>,
    app_name: String,
    unit_key: String,
}

impl KubeSecretBackend {
    pub fn new(client: Client, namespace: &str, app_name: &str, unit_key: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            app_name: app_name.to_string(),
            unit_key: unit_key.to_string(),
        }
    }
}

#[async_trait]
impl SecretBackend for KubeSecretBackend {
    async fn create(&self, scope: Scope, content: &SecretContent) -> Result<String, SecretError> {
        let owner = match scope {
            Scope::App => self.app_name.as_str(),
            Scope::Unit => self.unit_key.as_str(),
        };
        let name = format!("{}-secret-{}", owner, generate_password(8).to_lowercase());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(standard_labels(&self.app_name)),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(content.clone()),
            ..Default::default()
        };
        self.api.create(&PostParams::default(), &secret).await?;
        Ok(name)
    }

    async fn get(&self, id: &str) -> Result<Option<SecretContent>, SecretError> {
        let Some(secret) = self.api.get_opt(id).await? else {
            return Ok(None);
        };
        Ok(Some(
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).to_string()))
                .collect(),
        ))
    }

    async fn set_content(&self, id: &str, content: &SecretContent) -> Result<(), SecretError> {
        let patch = json!({ "stringData": content });
        self.api
            .patch(id, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

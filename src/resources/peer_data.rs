//! Shared peer data
//!
//! Small key/value store visible to every unit of the application. The
//! application scope is shared by all units and written (by convention) by
//! the coordinator; the unit scope is private to one unit. Backed by one
//! ConfigMap per scope.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use serde_json::json;
use thiserror::Error;

use crate::resources::common::{patch_params, standard_labels};

/// Partition of peer data and secrets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Shared by all units of the application
    App,
    /// Private to this unit
    Unit,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::App => write!(f, "app"),
            Scope::Unit => write!(f, "unit"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PeerStoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Scoped key/value peer data
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, PeerStoreError>;

    async fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), PeerStoreError>;

    async fn remove(&self, scope: Scope, key: &str) -> Result<(), PeerStoreError>;
}

/// Peer data held in ConfigMaps `<app>-peers` and `<unit>-peer`
pub struct ConfigMapPeerStore {
    api: Api<ConfigMap>,
    app_name: String,
    unit_key: String,
}

impl ConfigMapPeerStore {
    pub fn new(client: Client, namespace: &str, app_name: &str, unit_key: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            app_name: app_name.to_string(),
            unit_key: unit_key.to_string(),
        }
    }

    fn name(&self, scope: Scope) -> String {
        match scope {
            Scope::App => format!("{}-peers", self.app_name),
            Scope::Unit => format!("{}-peer", self.unit_key),
        }
    }

    async fn patch(&self, scope: Scope, data: serde_json::Value) -> Result<(), PeerStoreError> {
        let name = self.name(scope);
        let patch = json!({ "data": data });
        match self
            .api
            .patch(&name, &patch_params(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                let values: BTreeMap<String, Option<String>> =
                    serde_json::from_value(patch["data"].clone()).unwrap_or_default();
                let data: BTreeMap<String, String> = values
                    .into_iter()
                    .filter_map(|(k, v)| v.map(|v| (k, v)))
                    .collect();
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name),
                        labels: Some(standard_labels(&self.app_name)),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.api.create(&PostParams::default(), &cm).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PeerStore for ConfigMapPeerStore {
    async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, PeerStoreError> {
        let cm = self.api.get_opt(&self.name(scope)).await?;
        Ok(cm.and_then(|cm| cm.data).and_then(|mut d| d.remove(key)))
    }

    async fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), PeerStoreError> {
        self.patch(scope, json!({ key: value })).await
    }

    async fn remove(&self, scope: Scope, key: &str) -> Result<(), PeerStoreError> {
        // null removes the key under a merge patch
        self.patch(scope, json!({ key: null })).await
    }
}

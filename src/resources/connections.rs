//! Client connection publishing
//!
//! Applications consuming the database each get a Secret labelled with
//! their database username. After membership changes the operator rewrites
//! the host list and connection URI in those Secrets.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::config::actions::PASSWORD_PARAM;
use crate::resources::common::{CLIENT_USER_LABEL, patch_params};
use crate::resources::driver::MongoConfiguration;

/// Consumers of the replica set's host list
#[async_trait]
pub trait ConnectionPublisher: Send + Sync {
    /// Publish `hosts` to every consumer whose user exists in `database_users`
    ///
    /// `base` carries the replica set name; user, password and database are
    /// taken from each consumer's own record.
    async fn publish(
        &self,
        base: &MongoConfiguration,
        database_users: &BTreeSet<String>,
    ) -> Result<(), kube::Error>;
}

pub struct SecretConnectionPublisher {
    api: Api<Secret>,
}

impl SecretConnectionPublisher {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).to_string())
}

#[async_trait]
impl ConnectionPublisher for SecretConnectionPublisher {
    async fn publish(
        &self,
        base: &MongoConfiguration,
        database_users: &BTreeSet<String>,
    ) -> Result<(), kube::Error> {
        let secrets = self
            .api
            .list(&ListParams::default().labels(CLIENT_USER_LABEL))
            .await?;

        for secret in secrets.items {
            let name = secret.name_any();
            let Some(username) = secret.labels().get(CLIENT_USER_LABEL).cloned() else {
                continue;
            };
            if !database_users.contains(&username) {
                debug!(secret = %name, user = %username, "Client user not created yet");
                continue;
            }

            let config = MongoConfiguration {
                username: username.clone(),
                password: secret_value(&secret, PASSWORD_PARAM).unwrap_or_default(),
                database: secret_value(&secret, "database").unwrap_or_else(|| username.clone()),
                roles: BTreeSet::new(),
                ..base.clone()
            };
            let endpoints: Vec<&str> = config.hosts.iter().map(String::as_str).collect();
            let patch = json!({
                "stringData": {
                    "endpoints": endpoints.join(","),
                    "uris": config.uri(),
                }
            });
            self.api
                .patch(&name, &patch_params(), &Patch::Merge(&patch))
                .await?;
            info!(secret = %name, user = %username, "Updated client connection hosts");
        }
        Ok(())
    }
}

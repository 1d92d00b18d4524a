//! Peer inventory
//!
//! Lists the identities of the other units of the application. The
//! StatefulSet's replica count is the inventory: every ordinal below
//! `spec.replicas` is a unit, whether or not its pod is currently running.
//! A pod that restarts, is evicted or is drained keeps its membership; only
//! a scale-down takes a unit out of the inventory.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Api, Client};
use tracing::warn;

use crate::controller::membership::UnitId;

/// Source of peer unit identities
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Peer units excluding this unit
    async fn peer_units(&self) -> Result<Vec<UnitId>, kube::Error>;
}

/// Replica count of the application's StatefulSet
///
/// A StatefulSet without `spec.replicas` runs one pod.
pub async fn desired_replicas(api: &Api<StatefulSet>, app_name: &str) -> Result<u32, kube::Error> {
    let sts = api.get(app_name).await?;
    let replicas = sts.spec.and_then(|s| s.replicas).unwrap_or(1);
    Ok(u32::try_from(replicas).unwrap_or(0))
}

/// Units of the application other than `self_unit` for `replicas` pods
pub fn peer_units_for(self_unit: &UnitId, replicas: u32) -> Vec<UnitId> {
    (0..replicas)
        .filter(|ordinal| *ordinal != self_unit.ordinal())
        .filter_map(|ordinal| match UnitId::new(self_unit.app(), ordinal) {
            Ok(unit) => Some(unit),
            Err(e) => {
                warn!(ordinal, error = %e, "Skipping invalid unit");
                None
            }
        })
        .collect()
}

/// Whether `unit` has been scaled away, as opposed to restarting
pub fn is_scaled_away(unit: &UnitId, replicas: u32) -> bool {
    unit.ordinal() >= replicas
}

pub struct StatefulSetInventory {
    api: Api<StatefulSet>,
    self_unit: UnitId,
}

impl StatefulSetInventory {
    pub fn new(client: Client, namespace: &str, self_unit: UnitId) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            self_unit,
        }
    }
}

#[async_trait]
impl Inventory for StatefulSetInventory {
    async fn peer_units(&self) -> Result<Vec<UnitId>, kube::Error> {
        let replicas = desired_replicas(&self.api, self.self_unit.app()).await?;
        Ok(peer_units_for(&self.self_unit, replicas))
    }
}

//! Unit status reporting
//!
//! The projected unit status is written onto the unit's pod as a pair of
//! annotations, which is where `kubectl describe` users look for it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Patch;
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::warn;

use crate::controller::status::UnitStatus;
use crate::resources::common::{
    STATUS_ANNOTATION, STATUS_MESSAGE_ANNOTATION, patch_params,
};

/// Sink for the unit-visible status
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, status: &UnitStatus);

    /// Last status reported by this process, if any
    async fn current(&self) -> Option<UnitStatus>;
}

/// Destination of a status write
#[async_trait]
pub trait StatusWriter: Send + Sync {
    type Error: std::fmt::Display + Send;

    async fn write(&self, status: &UnitStatus) -> Result<(), Self::Error>;
}

/// Writes the status as annotations on the unit's pod
pub struct PodAnnotationWriter {
    api: Api<Pod>,
    pod_name: String,
}

#[async_trait]
impl StatusWriter for PodAnnotationWriter {
    type Error = kube::Error;

    async fn write(&self, status: &UnitStatus) -> Result<(), kube::Error> {
        let patch = json!({
            "metadata": {
                "annotations": {
                    STATUS_ANNOTATION: status.category(),
                    STATUS_MESSAGE_ANNOTATION: status.message(),
                }
            }
        });
        self.api
            .patch(&self.pod_name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Reporter skipping writes of an unchanged status
///
/// Only a successful write is remembered, so a failed one is retried by the
/// next report of the same status.
pub struct PodStatusReporter<W = PodAnnotationWriter> {
    writer: W,
    last: RwLock<Option<UnitStatus>>,
}

impl PodStatusReporter {
    pub fn new(client: Client, namespace: &str, pod_name: &str) -> Self {
        Self::with_writer(PodAnnotationWriter {
            api: Api::namespaced(client, namespace),
            pod_name: pod_name.to_string(),
        })
    }
}

impl<W: StatusWriter> PodStatusReporter<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            writer,
            last: RwLock::new(None),
        }
    }
}

#[async_trait]
impl<W: StatusWriter> StatusReporter for PodStatusReporter<W> {
    async fn report(&self, status: &UnitStatus) {
        let mut last = self.last.write().await;
        if last.as_ref() == Some(status) {
            return;
        }
        // Status is advisory; a failed write must never fail a handler
        match self.writer.write(status).await {
            Ok(()) => *last = Some(status.clone()),
            Err(e) => warn!(status = %status, error = %e, "Failed to publish unit status"),
        }
    }

    async fn current(&self) -> Option<UnitStatus> {
        self.last.read().await.clone()
    }
}

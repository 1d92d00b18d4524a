pub mod actions;
pub mod backup;
pub mod config;
pub mod controller;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{Context, Error, Event, Handled, Result, Retry, run_dispatcher};
pub use health::{HealthState, Metrics};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::backup::S3Credentials;
use crate::controller::{Collaborators, TokioSleeper, UnitId};
use crate::resources::common::app_selector;
use crate::resources::connections::SecretConnectionPublisher;
use crate::resources::inventory::{StatefulSetInventory, desired_replicas, is_scaled_away};
use crate::resources::peer_data::ConfigMapPeerStore;
use crate::resources::secret::KubeSecretBackend;
use crate::resources::status_reporter::PodStatusReporter;
use crate::resources::workload::PodWorkload;
use crate::resources::{MongoshDriver, SecretStore};

/// Build the handler context with Kubernetes-backed collaborators
pub fn build_context(
    client: Client,
    config: OperatorConfig,
    leader: Arc<AtomicBool>,
    health: Option<Arc<HealthState>>,
) -> Result<Context> {
    let unit: UnitId = config.unit_name.parse()?;
    let namespace = config.namespace.as_str();
    let pod_name = unit.pod_name();

    let workload = Arc::new(PodWorkload::new(
        client.clone(),
        namespace,
        &pod_name,
        config::CONTAINER_NAME,
    ));
    let peers = Arc::new(ConfigMapPeerStore::new(
        client.clone(),
        namespace,
        &config.app_name,
        &pod_name,
    ));
    let backend = Arc::new(KubeSecretBackend::new(
        client.clone(),
        namespace,
        &config.app_name,
        &pod_name,
    ));

    let collaborators = Collaborators {
        driver: Arc::new(MongoshDriver::new(workload.clone())),
        secrets: Arc::new(SecretStore::new(backend, peers.clone())),
        inventory: Arc::new(StatefulSetInventory::new(
            client.clone(),
            namespace,
            unit.clone(),
        )),
        publisher: Arc::new(SecretConnectionPublisher::new(client.clone(), namespace)),
        reporter: Arc::new(PodStatusReporter::new(client, namespace, &pod_name)),
        sleeper: Arc::new(TokioSleeper),
        workload,
        peers,
    };

    let ctx = Context::new(config, unit, collaborators, leader);
    Ok(match health {
        Some(health) => ctx.with_health(health),
        None => ctx,
    })
}

/// Whether the pod's Ready condition is true
fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Turn pod watch events into peer events
///
/// Only appearance, readiness flips and removal of application pods are
/// forwarded; annotation updates (including our own status writes) are not.
/// A removed pod is a departure only when the StatefulSet has been scaled
/// below its ordinal; restarts, evictions and drains keep the member.
pub async fn watch_peers(client: Client, config: OperatorConfig, events: mpsc::Sender<Event>) {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let stateful_sets: Api<StatefulSet> = Api::namespaced(client, &config.namespace);
    let watcher_config = WatcherConfig::default().labels(&app_selector(&config.app_name));
    let mut known: HashMap<String, bool> = HashMap::new();

    let mut stream = watcher::watcher(pods, watcher_config)
        .default_backoff()
        .boxed();
    loop {
        let event = match stream.try_next().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Pod watch error: {}", e);
                continue;
            }
        };

        let outgoing = match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                let name = pod.name_any();
                if pod.metadata.deletion_timestamp.is_some() {
                    match known.remove(&name) {
                        Some(_) => removed(&stateful_sets, &config.app_name, &name).await,
                        None => None,
                    }
                } else {
                    let ready = pod_ready(&pod);
                    match known.insert(name, ready) {
                        Some(was_ready) if was_ready == ready => None,
                        _ => Some(Event::PeerChanged),
                    }
                }
            }
            watcher::Event::Delete(pod) => {
                let name = pod.name_any();
                match known.remove(&name) {
                    Some(_) => removed(&stateful_sets, &config.app_name, &name).await,
                    None => None,
                }
            }
            watcher::Event::Init => None,
            watcher::Event::InitDone => Some(Event::PeerChanged),
        };

        if let Some(event) = outgoing
            && events.send(event).await.is_err()
        {
            break;
        }
    }
    tracing::error!("Pod watch stream ended unexpectedly");
}

/// Event for a pod going away: a departure after a scale-down, otherwise
/// nothing until the pod comes back
async fn removed(
    stateful_sets: &Api<StatefulSet>,
    app_name: &str,
    pod_name: &str,
) -> Option<Event> {
    let unit = match UnitId::from_pod_name(pod_name) {
        Ok(unit) => unit,
        Err(e) => {
            tracing::warn!(pod = %pod_name, "Ignoring removal: {}", e);
            return None;
        }
    };
    match desired_replicas(stateful_sets, app_name).await {
        Ok(replicas) if is_scaled_away(&unit, replicas) => Some(Event::PeerDeparted { unit }),
        Ok(_) => {
            tracing::debug!(pod = %pod_name, "Pod restarting, membership kept");
            None
        }
        Err(e) => {
            // reconcile re-derives membership from live state
            tracing::warn!(pod = %pod_name, "Cannot read replica count: {}", e);
            Some(Event::PeerChanged)
        }
    }
}

fn s3_credentials(secret: &Secret) -> S3Credentials {
    secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).to_string()))
        .collect()
}

/// Forward changes of the S3 credentials Secret and of our internal secrets
pub async fn watch_secrets(client: Client, config: OperatorConfig, events: mpsc::Sender<Event>) {
    let secrets: Api<Secret> = Api::namespaced(client, &config.namespace);

    let credentials = watcher::watcher(
        secrets.clone(),
        WatcherConfig::default().fields(&format!("metadata.name={}", config.s3_credentials_secret)),
    )
    .default_backoff()
    .map_ok(|event| match event {
        watcher::Event::Apply(s) | watcher::Event::InitApply(s) => {
            Some(Event::CredentialsChanged(Some(s3_credentials(&s))))
        }
        watcher::Event::Delete(_) => Some(Event::CredentialsChanged(None)),
        watcher::Event::Init | watcher::Event::InitDone => None,
    });

    let internal = watcher::watcher(
        secrets,
        WatcherConfig::default().labels(&app_selector(&config.app_name)),
    )
    .default_backoff()
    .map_ok(|event| match event {
        watcher::Event::Apply(s) => Some(Event::SecretChanged { id: s.name_any() }),
        _ => None,
    });

    let mut merged = futures::stream::select(credentials.boxed(), internal.boxed());
    while let Some(event) = merged.next().await {
        match event {
            Ok(Some(event)) => {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Secret watch error: {}", e),
        }
    }
    tracing::error!("Secret watch stream ended unexpectedly");
}

/// Emit `UpdateStatus` on the configured interval
pub async fn tick_status(config: OperatorConfig, events: mpsc::Sender<Event>) {
    let mut interval = tokio::time::interval(config.update_status_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; Start covers it
    interval.tick().await;
    loop {
        interval.tick().await;
        if events.send(Event::UpdateStatus).await.is_err() {
            break;
        }
    }
}

/// Run the agent: event sources plus the dispatcher
///
/// Returns when the dispatcher has handled `Stop`.
pub async fn run_agent(
    client: Client,
    ctx: Arc<Context>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
) {
    let config = ctx.config.clone();
    tracing::info!(
        unit = %ctx.unit,
        namespace = %config.namespace,
        "Starting mongodb-operator agent"
    );

    if events_tx.send(Event::Start).await.is_err() {
        tracing::error!("Event channel closed before start");
        return;
    }

    let sources = [
        tokio::spawn(watch_peers(client.clone(), config.clone(), events_tx.clone())),
        tokio::spawn(watch_secrets(client, config.clone(), events_tx.clone())),
        tokio::spawn(tick_status(config, events_tx.clone())),
    ];

    run_dispatcher(ctx, events_tx.downgrade(), events_rx).await;

    for source in sources {
        source.abort();
    }
}

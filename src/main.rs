use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use mongodb_operator::health::{HealthState, run_health_server};
use mongodb_operator::{Event, OperatorConfig, actions, build_context, run_agent};

/// Lease configuration
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Time allowed for the stop handler once a shutdown signal arrives
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

/// Capacity of the event queue
const EVENT_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mongodb_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting mongodb-operator");

    let config = OperatorConfig::from_env()?;
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());
    let is_leader = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_QUEUE_CAPACITY);

    let ctx = Arc::new(build_context(
        client.clone(),
        config.clone(),
        is_leader.clone(),
        Some(health_state.clone()),
    )?);

    // Probes and actions are served on every unit, coordinator or not
    let health_handle = {
        let health_state = health_state.clone();
        let routes = actions::create_router(events_tx.clone());
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port, routes).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease_name = format!("{}-coordinator", config.app_name);
    info!(
        holder_id = %config.unit_name,
        namespace = %config.namespace,
        lease_name = %lease_name,
        "Initializing leader election"
    );
    let lease_lock = LeaseLock::new(
        client.clone(),
        &config.namespace,
        LeaseLockParams {
            holder_id: config.unit_name.clone(),
            lease_name,
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    // Every unit keeps running; only the coordinator flag follows the lease
    let lease_handle = {
        let is_leader = is_leader.clone();
        let events = events_tx.clone();
        tokio::spawn(async move {
            loop {
                let acquired = match lease_lock.try_acquire_or_renew().await {
                    Ok(result) => result.acquired_lease,
                    Err(e) => {
                        warn!("Failed to acquire or renew lease: {}", e);
                        false
                    }
                };
                let was_leader = is_leader.swap(acquired, Ordering::SeqCst);
                match (was_leader, acquired) {
                    (false, true) => {
                        info!("Acquired coordinator lease");
                        if events.send(Event::LeaderElected).await.is_err() {
                            break;
                        }
                    }
                    (true, false) => warn!("Lost coordinator lease"),
                    _ => {}
                }
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            }
        })
    };

    let stop_tx = events_tx.clone();
    let mut agent_handle = tokio::spawn(run_agent(client, ctx, events_tx, events_rx));

    let shutdown = tokio::select! {
        result = &mut agent_handle => {
            if let Err(e) = result {
                error!("Agent task panicked: {}", e);
            }
            false
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
            false
        }
        Err(e) = lease_handle => {
            error!("Lease task panicked: {}", e);
            false
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => true,
    };

    if shutdown {
        info!("Received shutdown signal, initiating graceful shutdown...");
        health_state.set_ready(false).await;

        if stop_tx.send(Event::Stop).await.is_ok() {
            match tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
                agent_handle,
            )
            .await
            {
                Ok(_) => info!("Stop handled"),
                Err(_) => warn!(
                    "Stop not handled within {}s, shutting down anyway",
                    SHUTDOWN_GRACE_PERIOD_SECS
                ),
            }
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

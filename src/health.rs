//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the agent dispatching events?)
//! - `/metrics` - Prometheus metrics
//!
//! The action endpoints are merged into the same router by `run_health_server`.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::controller::status::UnitStatus;

const STATUS_CATEGORIES: [&str; 4] = ["active", "maintenance", "waiting", "blocked"];

/// Labels for per-event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EventLabels {
    pub event: String,
}

impl prometheus_client::encoding::EncodeLabelSet for EventLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("event", self.event.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for membership change metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ChangeLabels {
    pub change: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ChangeLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("change", self.change.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the unit status gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StatusLabels {
    pub category: String,
}

impl prometheus_client::encoding::EncodeLabelSet for StatusLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("category", self.category.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Handled events by kind
    pub events_total: Family<EventLabels, Counter>,
    /// Events that asked to be redelivered
    pub deferred_events_total: Family<EventLabels, Counter>,
    /// Handler duration histogram
    pub handler_duration_seconds: Family<EventLabels, Histogram>,
    /// Replica set members added or removed
    pub membership_changes_total: Family<ChangeLabels, Counter>,
    /// pbm resyncs requested
    pub resync_attempts_total: Counter,
    /// 1 for the current unit status category, 0 otherwise
    pub unit_status: Family<StatusLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "mongodb_operator_events",
            "Total number of handled events",
            events_total.clone(),
        );

        let deferred_events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "mongodb_operator_deferred_events",
            "Total number of deferred events",
            deferred_events_total.clone(),
        );

        let handler_duration_seconds =
            Family::<EventLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 18))
            });
        registry.register(
            "mongodb_operator_handler_duration_seconds",
            "Duration of event handlers in seconds",
            handler_duration_seconds.clone(),
        );

        let membership_changes_total = Family::<ChangeLabels, Counter>::default();
        registry.register(
            "mongodb_operator_membership_changes",
            "Total number of replica set members added or removed",
            membership_changes_total.clone(),
        );

        let resync_attempts_total = Counter::default();
        registry.register(
            "mongodb_operator_pbm_resync_attempts",
            "Total number of pbm resyncs requested",
            resync_attempts_total.clone(),
        );

        let unit_status = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_unit_status",
            "Current unit status category",
            unit_status.clone(),
        );

        Self {
            events_total,
            deferred_events_total,
            handler_duration_seconds,
            membership_changes_total,
            resync_attempts_total,
            unit_status,
            registry,
        }
    }

    fn event_labels(event: &str) -> EventLabels {
        EventLabels {
            event: event.to_string(),
        }
    }

    /// Record a handled event
    pub fn record_event(&self, event: &str, duration_secs: f64) {
        let labels = Self::event_labels(event);
        self.events_total.get_or_create(&labels).inc();
        self.handler_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_deferred(&self, event: &str) {
        self.deferred_events_total
            .get_or_create(&Self::event_labels(event))
            .inc();
    }

    /// `change` is `added` or `removed`
    pub fn record_membership_change(&self, change: &str) {
        let labels = ChangeLabels {
            change: change.to_string(),
        };
        self.membership_changes_total.get_or_create(&labels).inc();
    }

    pub fn record_resync(&self) {
        self.resync_attempts_total.inc();
    }

    pub fn set_unit_status(&self, status: &UnitStatus) {
        for category in STATUS_CATEGORIES {
            let labels = StatusLabels {
                category: category.to_string(),
            };
            let value = i64::from(status.category() == category);
            self.unit_status.get_or_create(&labels).set(value);
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails.
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the dispatcher is running
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Unix time of the last handled event
    pub last_event: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_event: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp();
        self.last_event
            .store(u64::try_from(now).unwrap_or_default(), Ordering::Relaxed);
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the dispatcher runs.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server with `extra` routes merged in
pub async fn run_health_server(
    state: Arc<HealthState>,
    port: u16,
    extra: Router,
) -> Result<(), std::io::Error> {
    let app = create_router(state).merge(extra);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health server listening on {}", addr);
    axum::serve(listener, app).await
}

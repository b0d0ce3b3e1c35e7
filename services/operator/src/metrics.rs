//! Prometheus metrics for the fleet operator.
//!
//! Initialize once at startup and clone the handle into every component:
//! ```ignore
//! let metrics = fleet_operator::metrics::init()?;
//! metrics.record_allocation("my-build", AllocationOutcome::Succeeded);
//! ```
//! The API router serves the registry at `/metrics`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus::{core::Collector, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::error;

use crate::model::InstanceState;
use crate::state::AppState;

/// Outcome label for allocation attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Attempted,
    Succeeded,
    Throttled,
    Retried,
    Failed,
}

impl AllocationOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AllocationOutcome::Attempted => "attempted",
            AllocationOutcome::Succeeded => "succeeded",
            AllocationOutcome::Throttled => "throttled",
            AllocationOutcome::Retried => "retried",
            AllocationOutcome::Failed => "failed",
        }
    }
}

/// Operator metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Instance lifecycle
    instances_created: CounterVec,
    instances_deleted: CounterVec,
    instances_crashed: CounterVec,
    instances_unhealthy: CounterVec,
    sessions_ended: CounterVec,
    instances_current: GaugeVec,

    // Allocation
    allocations: CounterVec,

    // Ports
    ports_free: Gauge,
    nodes: Gauge,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_created(&self, build: &str) {
        self.instances_created.with_label_values(&[build]).inc();
    }

    pub fn record_deleted(&self, build: &str) {
        self.instances_deleted.with_label_values(&[build]).inc();
    }

    pub fn record_crashed(&self, build: &str) {
        self.instances_crashed.with_label_values(&[build]).inc();
    }

    pub fn record_unhealthy(&self, build: &str) {
        self.instances_unhealthy.with_label_values(&[build]).inc();
    }

    pub fn record_session_ended(&self, build: &str) {
        self.sessions_ended.with_label_values(&[build]).inc();
    }

    /// Update the current instance count for one state of a build.
    pub fn set_current(&self, build: &str, state: InstanceState, count: usize) {
        self.instances_current
            .with_label_values(&[build, state.as_str()])
            .set(count as f64);
    }

    pub fn record_allocation(&self, build: &str, outcome: AllocationOutcome) {
        self.allocations
            .with_label_values(&[build, outcome.as_str()])
            .inc();
    }

    pub fn set_ports_free(&self, free: usize) {
        self.ports_free.set(free as f64);
    }

    pub fn set_nodes(&self, count: usize) {
        self.nodes.set(count as f64);
    }
}

/// Helper to register a metric and return it.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

fn build_counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<CounterVec> {
    Ok(register(registry, CounterVec::new(Opts::new(name, help), &["build"])?))
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> prometheus::Result<Metrics> {
    let registry = Registry::new();

    let instances_created = build_counter(
        &registry,
        "fleet_instances_created_total",
        "Instances created by the scaler",
    )?;
    let instances_deleted = build_counter(
        &registry,
        "fleet_instances_deleted_total",
        "Instances whose deletion completed",
    )?;
    let instances_crashed = build_counter(
        &registry,
        "fleet_instances_crashed_total",
        "Instances that exited with a nonzero code",
    )?;
    let instances_unhealthy = build_counter(
        &registry,
        "fleet_instances_unhealthy_total",
        "Instances cleaned up after being reported unhealthy",
    )?;
    let sessions_ended = build_counter(
        &registry,
        "fleet_sessions_ended_total",
        "Instances that completed their game session",
    )?;

    let instances_current = register(
        &registry,
        GaugeVec::new(
            Opts::new("fleet_instances_current", "Current instances per build and state"),
            &["build", "state"],
        )?,
    );

    let allocations = register(
        &registry,
        CounterVec::new(
            Opts::new("fleet_allocations_total", "Allocation requests by outcome"),
            &["build", "outcome"],
        )?,
    );

    let ports_free = register(
        &registry,
        Gauge::new("fleet_ports_free", "Host port reservations still available")?,
    );
    let nodes = register(
        &registry,
        Gauge::new("fleet_nodes", "Nodes contributing host port capacity")?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        instances_created,
        instances_deleted,
        instances_crashed,
        instances_unhealthy,
        sessions_ended,
        instances_current,
        allocations,
        ports_free,
        nodes,
    })
}

/// Axum handler for `/metrics`.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics().registry().gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered(metrics: &Metrics) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry().gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_init_twice_is_independent() {
        let a = init().unwrap();
        let b = init().unwrap();
        a.record_created("build-a");
        assert!(gathered(&a).contains("fleet_instances_created_total{build=\"build-a\"} 1"));
        assert!(!gathered(&b).contains("build-a"));
    }

    #[test]
    fn test_allocation_outcomes() {
        let metrics = init().unwrap();
        metrics.record_allocation("b", AllocationOutcome::Attempted);
        metrics.record_allocation("b", AllocationOutcome::Throttled);
        let text = gathered(&metrics);
        assert!(text.contains("fleet_allocations_total{build=\"b\",outcome=\"attempted\"} 1"));
        assert!(text.contains("fleet_allocations_total{build=\"b\",outcome=\"throttled\"} 1"));
    }

    #[test]
    fn test_current_gauge() {
        let metrics = init().unwrap();
        metrics.set_current("b", InstanceState::StandingBy, 3);
        metrics.set_ports_free(17);
        let text = gathered(&metrics);
        assert!(text.contains("fleet_instances_current{build=\"b\",state=\"StandingBy\"} 3"));
        assert!(text.contains("fleet_ports_free 17"));
    }
}

//! Lightweight metrics helpers for Switchyard.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. No exporter is embedded; the
//! application can install any compatible recorder.
//!
//! Provided metrics (labels vary by family):
//! * `switchyard_requests_total` (counter)
//! * `switchyard_request_duration_seconds` (histogram)
//! * `switchyard_backend_attempts_total` (counter)
//! * `switchyard_backend_request_duration_seconds` (histogram)
//! * `switchyard_backend_retries_total` (counter)
//! * `switchyard_node_status` (gauge per node: 1 up, 0.5 takeout, 0 down)
//! * `switchyard_open_connections` (gauge)
//! * `switchyard_cluster_commands_total` (counter)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

use crate::core::balancer::NodeStatus;

pub const SWITCHYARD_REQUESTS_TOTAL: &str = "switchyard_requests_total";
pub const SWITCHYARD_REQUEST_DURATION_SECONDS: &str = "switchyard_request_duration_seconds";
pub const SWITCHYARD_BACKEND_ATTEMPTS_TOTAL: &str = "switchyard_backend_attempts_total";
pub const SWITCHYARD_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "switchyard_backend_request_duration_seconds";
pub const SWITCHYARD_BACKEND_RETRIES_TOTAL: &str = "switchyard_backend_retries_total";
pub const SWITCHYARD_NODE_STATUS: &str = "switchyard_node_status";
pub const SWITCHYARD_OPEN_CONNECTIONS: &str = "switchyard_open_connections";
pub const SWITCHYARD_CLUSTER_COMMANDS_TOTAL: &str = "switchyard_cluster_commands_total"; // labels: command, result

/// Last reported node status gauges, keyed by `cluster/node`
pub static NODE_STATUS_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    // Register metric descriptions
    describe_counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        SWITCHYARD_BACKEND_ATTEMPTS_TOTAL,
        Unit::Count,
        "Delivery attempts made against backend destinations, by outcome."
    );
    describe_histogram!(
        SWITCHYARD_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to backend services."
    );
    describe_counter!(
        SWITCHYARD_BACKEND_RETRIES_TOTAL,
        Unit::Count,
        "Attempts made after the first one of a call."
    );
    describe_gauge!(
        SWITCHYARD_NODE_STATUS,
        "Status of load balancer nodes (1 up, 0.5 takeout, 0 down)."
    );
    describe_gauge!(
        SWITCHYARD_OPEN_CONNECTIONS,
        "Backend connections currently open, pooled or in use."
    );
    describe_counter!(
        SWITCHYARD_CLUSTER_COMMANDS_TOTAL,
        Unit::Count,
        "Administrative node commands received (by command and result)."
    );

    Mutex::new(HashMap::new())
});

fn status_value(status: NodeStatus) -> f64 {
    match status {
        NodeStatus::Up => 1.0,
        NodeStatus::Takeout => 0.5,
        NodeStatus::Down => 0.0,
    }
}

/// Set (and record) the status gauge of a node.
pub fn set_node_status(cluster: &str, node: &str, status: NodeStatus) {
    let value = status_value(status);

    if let Ok(mut gauges) = NODE_STATUS_GAUGES.lock() {
        gauges.insert(format!("{cluster}/{node}"), value);
    } else {
        tracing::error!("Failed to acquire lock for node status gauges");
        return;
    }

    gauge!(
        SWITCHYARD_NODE_STATUS,
        "cluster" => cluster.to_string(),
        "node" => node.to_string()
    )
    .set(value);
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(rule: &str, method: &str, status: u16) {
    counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        "rule" => rule.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(rule: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        "rule" => rule.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Count one delivery attempt; `outcome` is a status code or an error kind.
pub fn increment_backend_attempt(backend: &str, outcome: &str) {
    counter!(
        SWITCHYARD_BACKEND_ATTEMPTS_TOTAL,
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn increment_backend_retries() {
    counter!(SWITCHYARD_BACKEND_RETRIES_TOTAL).increment(1);
}

/// Record a completed backend request duration.
pub fn record_backend_request_duration(backend: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        SWITCHYARD_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the number of open backend connections.
pub fn set_open_connections(count: usize) {
    gauge!(SWITCHYARD_OPEN_CONNECTIONS).set(count as f64);
}

pub fn increment_cluster_command(command: &str, result: &str) {
    counter!(
        SWITCHYARD_CLUSTER_COMMANDS_TOTAL,
        "command" => command.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    rule: String,
    method: String,
}

impl RequestTimer {
    pub fn new(rule: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            rule: rule.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.rule, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring one backend attempt.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
    method: String,
}

impl BackendRequestTimer {
    pub fn new(backend: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(&self.backend, &self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::debug!("Initializing Switchyard metrics descriptions");
    Lazy::force(&NODE_STATUS_GAUGES);
    Ok(())
}

/// Snapshot of node status gauges, keyed by `cluster/node`.
pub fn node_status_snapshot() -> HashMap<String, f64> {
    NODE_STATUS_GAUGES
        .lock()
        .map(|gauges| gauges.clone())
        .unwrap_or_default()
}

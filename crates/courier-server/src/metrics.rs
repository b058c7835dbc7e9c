//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const MESSAGES_BYTES: &str = "courier_messages_bytes";
    pub const TRANSPORT_ERRORS_TOTAL: &str = "courier_transport_errors_total";
    pub use courier_core::delivery::DELIVERY_FAILURES_TOTAL;
    pub use courier_core::router::{ERRORS_TOTAL, MESSAGES_ROUTED_TOTAL, RETIREMENTS_TOTAL};
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames read or written");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames read or written");
    metrics::describe_counter!(
        names::TRANSPORT_ERRORS_TOTAL,
        "Total number of WebSocket read or write errors"
    );
    metrics::describe_counter!(
        names::MESSAGES_ROUTED_TOTAL,
        "Total number of messages taken off the routing queue"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of rejected messages");
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Total number of per-recipient delivery failures"
    );
    metrics::describe_counter!(names::RETIREMENTS_TOTAL, "Total number of retired sessions");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a transport error.
pub fn record_transport_error(stage: &'static str) {
    counter!(names::TRANSPORT_ERRORS_TOTAL, "stage" => stage).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording must be a no-op
        let _guard = ConnectionMetricsGuard::new();
        record_message(42, "inbound");
        record_transport_error("read");
    }
}

//! Metric names and the `/metrics` renderer.

use metrics_exporter_prometheus::PrometheusHandle;

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Commands submitted (counter, labels: kind).
pub const COMMANDS_SUBMITTED_TOTAL: &str = "commands_submitted_total";
/// Commands resolved by an agent reply (counter, labels: kind).
pub const COMMANDS_RESOLVED_TOTAL: &str = "commands_resolved_total";
/// Awaits that ended without a reply (counter, labels: kind).
pub const COMMANDS_TIMED_OUT_TOTAL: &str = "commands_timed_out_total";
/// Pending entries evicted by the reaper (counter, labels: kind).
pub const COMMANDS_EXPIRED_TOTAL: &str = "commands_expired_total";
/// Submit-to-reply latency seconds (histogram, labels: kind).
pub const COMMAND_LATENCY_SECONDS: &str = "command_latency_seconds";
/// Pending request table size (gauge).
pub const PENDING_REQUESTS: &str = "pending_requests";
/// Inbound agent messages that resolved nothing (counter, labels: reason).
pub const REPLIES_DROPPED_TOTAL: &str = "replies_dropped_total";
/// Per-connection broadcast drops (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";
/// Agent WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Agent WebSocket connections closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active agent WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";

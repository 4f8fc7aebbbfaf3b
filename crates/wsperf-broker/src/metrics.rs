//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Call once at
/// startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// Identified workers currently registered (gauge).
pub const WORKERS_CONNECTED: &str = "wsperf_workers_connected";
/// Worker connections accepted (counter).
pub const WORKER_CONNECTIONS_TOTAL: &str = "wsperf_worker_connections_total";
/// Worker protocol violations (counter, labels: kind).
pub const PROTOCOL_ERRORS_TOTAL: &str = "wsperf_protocol_errors_total";
/// Runs dispatched (counter).
pub const RUNS_DISPATCHED_TOTAL: &str = "wsperf_runs_dispatched_total";
/// Commands queued to workers (counter).
pub const COMMANDS_SENT_TOTAL: &str = "wsperf_commands_sent_total";
/// Commands dropped because the worker queue was full or closed (counter).
pub const COMMANDS_DROPPED_TOTAL: &str = "wsperf_commands_dropped_total";
/// Result batches relayed to observers (counter).
pub const RESULTS_RELAYED_TOTAL: &str = "wsperf_results_relayed_total";
/// Observer connections currently open (gauge).
pub const OBSERVERS_CONNECTED: &str = "wsperf_observers_connected";
/// Observer RPC requests (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "wsperf_rpc_requests_total";

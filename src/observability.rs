use std::net::SocketAddr;

use crate::sql::Command;

// ── Reservation engine ──────────────────────────────────────────

/// Counter: reserve calls. Labels: outcome (reserved, already_reserved, full,
/// not_found, conflict_exhausted, duplicate_in_flight, error).
pub const RESERVATIONS_TOTAL: &str = "claimd_reservations_total";

/// Counter: cancel calls. Labels: outcome (released, not_claimed, not_found, error).
pub const CANCELLATIONS_TOTAL: &str = "claimd_cancellations_total";

/// Counter: conditioned writes rejected by a concurrent writer and retried.
pub const CONFLICT_RETRIES_TOTAL: &str = "claimd_conflict_retries_total";

/// Counter: reserve calls short-circuited by the in-process duplicate guard.
pub const DEBOUNCE_REJECTIONS_TOTAL: &str = "claimd_debounce_rejections_total";

/// Histogram: reserve latency in seconds, including backoff sleeps.
pub const RESERVE_DURATION_SECONDS: &str = "claimd_reserve_duration_seconds";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "claimd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "claimd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "claimd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "claimd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "claimd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "claimd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "claimd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "claimd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "claimd_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::InsertClaim { .. } => "insert_claim",
        Command::DeleteClaim { .. } => "delete_claim",
        Command::SelectClaims { .. } => "select_claims",
    }
}

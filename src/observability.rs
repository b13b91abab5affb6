use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "sessiond_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "sessiond_query_duration_seconds";

/// Counter: writes rejected by the scheduling validator. Labels: rule.
pub const CONFLICTS_TOTAL: &str = "sessiond_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "sessiond_connections_active";
pub const CONNECTIONS_TOTAL: &str = "sessiond_connections_total";

/// Counter: connections refused because the connection limit was reached.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "sessiond_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "sessiond_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "sessiond_wal_flush_batch_size";

/// Counter: background compactions run.
pub const WAL_COMPACTIONS_TOTAL: &str = "sessiond_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op without a port; an
/// install failure is logged and the server keeps running unobserved.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProfessional { .. } => "insert_professional",
        Command::DeleteProfessional { .. } => "delete_professional",
        Command::InsertLocal { .. } => "insert_local",
        Command::DeleteLocal { .. } => "delete_local",
        Command::InsertSession { .. } => "insert_session",
        Command::BatchInsertSessions { .. } => "batch_insert_sessions",
        Command::UpdateSession { .. } => "update_session",
        Command::DeleteSession { .. } => "delete_session",
        Command::BatchDeleteSessions { .. } => "batch_delete_sessions",
        Command::SelectSession { .. } => "select_session",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectProfessionals => "select_professionals",
        Command::SelectLocals => "select_locals",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAvailability { .. } => "select_availability",
    }
}

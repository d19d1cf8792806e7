use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotguard_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotguard_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (ok or error kind).
pub const RESERVATIONS_TOTAL: &str = "slotguard_reservations_total";

/// Counter: reservation retries after storage contention.
pub const RESERVATION_RETRIES_TOTAL: &str = "slotguard_reservation_retries_total";

/// Histogram: end-to-end reserve latency in seconds, retries included.
pub const RESERVE_DURATION_SECONDS: &str = "slotguard_reserve_duration_seconds";

/// Counter: status transitions. Labels: to, outcome.
pub const TRANSITIONS_TOTAL: &str = "slotguard_transitions_total";

/// Counter: slot computations served.
pub const SLOT_QUERIES_TOTAL: &str = "slotguard_slot_queries_total";

/// Counter: notifications the sink refused.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "slotguard_notification_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotguard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotguard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotguard_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotguard_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertService { .. } => "insert_service",
        Command::DeleteService { .. } => "delete_service",
        Command::InsertRecurringWindow { .. } => "insert_recurring_window",
        Command::InsertOnceWindow { .. } => "insert_once_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertTransition { .. } => "insert_transition",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectServices { .. } => "select_services",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSlots { .. } => "select_slots",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}

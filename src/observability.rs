use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "vacancy_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "vacancy_query_duration_seconds";

/// Counter: reservations committed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "vacancy_reservations_created_total";

/// Counter: creation attempts rejected on overlap.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "vacancy_reservation_conflicts_total";

/// Counter: room-lock waits that hit the bound and surfaced Busy.
pub const LOCK_TIMEOUTS_TOTAL: &str = "vacancy_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "vacancy_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "vacancy_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "vacancy_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "vacancy_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vacancy_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vacancy_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProperty { .. } => "insert_property",
        Command::DeleteProperty { .. } => "delete_property",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::SelectProperties => "select_properties",
        Command::SelectRooms { .. } => "select_rooms",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeNights { .. } => "select_free_nights",
        Command::RefreshAvailability { .. } => "refresh_availability",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::PollNotices { .. } => "poll_notices",
    }
}

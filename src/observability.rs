use std::net::SocketAddr;

use tracing::{error, info};

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbay_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbay_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome (booked, slot_occupied, rejected).
pub const BOOKINGS_TOTAL: &str = "slotbay_bookings_total";

/// Counter: terminal appointments removed by retention cleanup.
pub const APPOINTMENTS_PURGED_TOTAL: &str = "slotbay_appointments_purged_total";

// ── Resource metrics ────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotbay_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotbay_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbay_connections_rejected_total";

/// Counter: logins or statements refused because the caller could not be identified.
pub const AUTH_FAILURES_TOTAL: &str = "slotbay_auth_failures_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbay_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbay_wal_flush_batch_size";

/// Install the Prometheus exporter when a port is configured. A failure to
/// bind is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!("metrics endpoint: http://{addr}/metrics"),
        Err(e) => error!("metrics exporter disabled: {e}"),
    }
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertService { .. } => "insert_service",
        Command::InsertEmployee { .. } => "insert_employee",
        Command::UpdateEmployee { .. } => "update_employee",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertAssignment { .. } => "insert_assignment",
        Command::UpdateAssignment { .. } => "update_assignment",
        Command::SelectAvailableSlots { .. } => "select_available_slots",
        Command::SelectDailyDetail { .. } => "select_daily_detail",
        Command::SelectDailySummary { .. } => "select_daily_summary",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAvailableWork => "select_available_work",
        Command::SelectAssignments { .. } => "select_assignments",
        Command::SelectEmployees { .. } => "select_employees",
        Command::SelectWorkload { .. } => "select_workload",
    }
}

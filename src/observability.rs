use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings created. Labels: payment_method.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: booking requests rejected. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotbook_bookings_rejected_total";

pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotbook_bookings_cancelled_total";

/// Counter: cancellations inside the late-cancel window.
pub const LATE_CANCELLATIONS_TOTAL: &str = "slotbook_late_cancellations_total";

/// Counter: calendar mirror calls that failed. Labels: op.
pub const CALENDAR_SYNC_FAILURES_TOTAL: &str = "slotbook_calendar_sync_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

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
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SelectResources => "select_resources",
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUserRole { .. } => "update_user_role",
        Command::UpdateCreditLimit { .. } => "update_credit_limit",
        Command::SelectUsers { .. } => "select_users",
        Command::InsertDeposit { .. } => "insert_deposit",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::InsertDiscount { .. } => "insert_discount",
        Command::FreezeSubscription { .. } => "freeze_subscription",
        Command::InsertBooking(_) => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SetReRentListed { .. } => "set_re_rent_listed",
        Command::SelectBookings(_) => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlotCheck { .. } => "select_slot_check",
        Command::InsertWaitlist { .. } => "insert_waitlist",
        Command::DeleteWaitlist { .. } => "delete_waitlist",
        Command::SelectWaitlist => "select_waitlist",
        Command::SelectTimeline(_) => "select_timeline",
    }
}

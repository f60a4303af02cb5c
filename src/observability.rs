use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "bookd_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "bookd_op_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Gauge: number of active campuses (loaded engines).
pub const CAMPUSES_ACTIVE: &str = "bookd_campuses_active";

/// Counter: hello/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "bookd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::RegisterRoom { .. } => "register_room",
        Request::RetireRoom { .. } => "retire_room",
        Request::CreateReservation { .. } => "create_reservation",
        Request::SetStatus { .. } => "set_status",
        Request::RequestExtension { .. } => "request_extension",
        Request::DecideExtension { .. } => "decide_extension",
        Request::RegisterStaff { .. } => "register_staff",
        Request::RemoveStaff { .. } => "remove_staff",
        Request::FileReport { .. } => "file_report",
        Request::AssignReport { .. } => "assign_report",
        Request::StartReport { .. } => "start_report",
        Request::ResolveReport { .. } => "resolve_report",
        Request::ArchiveReport { .. } => "archive_report",
        Request::Rooms => "rooms",
        Request::Reservation { .. } => "reservation",
        Request::Schedule { .. } => "schedule",
        Request::Availability { .. } => "availability",
        Request::Staff { .. } => "staff",
        Request::Reports { .. } => "reports",
        Request::Workloads { .. } => "workloads",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}

use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "cabinbook_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "cabinbook_http_request_duration_seconds";

/// Counter: gateway calls. Labels: operation, outcome.
pub const GATEWAY_REQUESTS_TOTAL: &str = "cabinbook_gateway_requests_total";

/// Counter: payment notifications received. Labels: result.
pub const NOTIFICATIONS_TOTAL: &str = "cabinbook_notifications_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings created. Labels: source.
pub const BOOKINGS_CREATED_TOTAL: &str = "cabinbook_bookings_created_total";

/// Counter: payment status changes requested. Labels: outcome (applied, unchanged, ignored).
pub const PAYMENT_TRANSITIONS_TOTAL: &str = "cabinbook_payment_transitions_total";

/// Counter: pending bookings expired by the reaper.
pub const BOOKINGS_REAPED_TOTAL: &str = "cabinbook_bookings_reaped_total";

/// Counter: calendar source syncs. Labels: outcome (success, error).
pub const CALENDAR_SYNC_RUNS_TOTAL: &str = "cabinbook_calendar_sync_runs_total";

/// Counter: external calendar events processed. Labels: outcome (imported, updated, skipped).
pub const CALENDAR_SYNC_EVENTS_TOTAL: &str = "cabinbook_calendar_sync_events_total";

/// Counter: confirmation emails rendered.
pub const EMAILS_SENT_TOTAL: &str = "cabinbook_emails_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cabinbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cabinbook_wal_flush_batch_size";

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

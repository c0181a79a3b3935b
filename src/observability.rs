use std::net::SocketAddr;

// ── Reconcile metrics ───────────────────────────────────────────

/// Counter: reconcile batches. Labels: status (`ok`, `invalid`, `error`).
pub const COVERAGE_BATCHES_TOTAL: &str = "circulate_coverage_batches_total";

/// Counter: coverage records created.
pub const COVERAGE_RECORDS_INSERTED_TOTAL: &str = "circulate_coverage_records_inserted_total";

/// Counter: existing coverage records overwritten by a forced batch.
pub const COVERAGE_RECORDS_UPDATED_TOTAL: &str = "circulate_coverage_records_updated_total";

/// Counter: commits rejected by the uniqueness check and retried.
pub const COVERAGE_CONFLICTS_TOTAL: &str = "circulate_coverage_conflicts_total";

// ── Ledger metrics ──────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "circulate_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "circulate_wal_flush_batch_size";

/// Counter: WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "circulate_wal_compactions_total";

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

// Prometheus instrumentation for the audit scheduler.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Scheduler ticks executed
    /// Labels: task (check_all, check_job, clean_all)
    pub static ref TICKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chainaudit_ticks_total", "Scheduler ticks executed by task"),
        &["task"]
    ).unwrap();

    /// Tick latency
    /// Labels: task (check_all, check_job, clean_all)
    pub static ref TICK_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("chainaudit_tick_duration_seconds", "Tick latency by task")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["task"]
    ).unwrap();

    /// Block checks enqueued by a job tick
    /// Labels: reason (expiry, gap, retry)
    pub static ref BLOCKS_SCHEDULED: IntCounterVec = IntCounterVec::new(
        Opts::new("chainaudit_blocks_scheduled_total", "Block checks enqueued by reason"),
        &["reason"]
    ).unwrap();

    /// Block checks completed
    /// Labels: status (gd, bd, fl)
    pub static ref CHECKS_COMPLETED: IntCounterVec = IntCounterVec::new(
        Opts::new("chainaudit_checks_completed_total", "Block checks completed by status"),
        &["status"]
    ).unwrap();

    /// Source fetch transport failures
    /// Labels: service (canonical, blockset, infura)
    pub static ref SOURCE_FETCH_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("chainaudit_source_fetch_failures_total", "Source fetch transport failures by service"),
        &["service"]
    ).unwrap();

    /// Pending block checks observed at the start of each job tick
    /// Labels: job
    pub static ref INFLIGHT_BLOCKS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainaudit_inflight_blocks", "Pending block checks per job"),
        &["job"]
    ).unwrap();

    /// Canonical chain tip height
    /// Labels: blockchain
    pub static ref CHAIN_TIP_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("chainaudit_chain_tip_height", "Canonical chain tip height per blockchain"),
        &["blockchain"]
    ).unwrap();
}

/// Register all metrics with the global registry. Safe to call more
/// than once; duplicate registrations are ignored.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(TICKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TICK_DURATION.clone()));
    let _ = REGISTRY.register(Box::new(BLOCKS_SCHEDULED.clone()));
    let _ = REGISTRY.register(Box::new(CHECKS_COMPLETED.clone()));
    let _ = REGISTRY.register(Box::new(SOURCE_FETCH_FAILURES.clone()));
    let _ = REGISTRY.register(Box::new(INFLIGHT_BLOCKS.clone()));
    let _ = REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()));
}

/// Render all registered metrics in the Prometheus text format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

use std::sync::atomic::{AtomicU64, Ordering};

use salvo::prelude::*;

use crate::web::web_state;

static SYNC_SUCCESS: AtomicU64 = AtomicU64::new(0);
static SYNC_FAILURE: AtomicU64 = AtomicU64::new(0);
static RECONCILE_RUNS: AtomicU64 = AtomicU64::new(0);
static RECONCILE_ITEM_ERRORS: AtomicU64 = AtomicU64::new(0);
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static EVENTS_DROPPED: AtomicU64 = AtomicU64::new(0);
static EVENTS_PROCESSED: AtomicU64 = AtomicU64::new(0);
static EVENTS_FAILED: AtomicU64 = AtomicU64::new(0);

pub struct Metrics;

impl Metrics {
    pub fn sync_success() {
        SYNC_SUCCESS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_failure() {
        SYNC_FAILURE.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_run() {
        RECONCILE_RUNS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_item_error() {
        RECONCILE_ITEM_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit() {
        CACHE_HITS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss() {
        CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_received() {
        EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped() {
        EVENTS_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_processed() {
        EVENTS_PROCESSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_failed() {
        EVENTS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn format_prometheus(uptime_secs: u64) -> String {
    let sync_success = SYNC_SUCCESS.load(Ordering::Relaxed);
    let sync_failure = SYNC_FAILURE.load(Ordering::Relaxed);
    let reconcile_runs = RECONCILE_RUNS.load(Ordering::Relaxed);
    let reconcile_item_errors = RECONCILE_ITEM_ERRORS.load(Ordering::Relaxed);
    let cache_hits = CACHE_HITS.load(Ordering::Relaxed);
    let cache_misses = CACHE_MISSES.load(Ordering::Relaxed);
    let events_received = EVENTS_RECEIVED.load(Ordering::Relaxed);
    let events_dropped = EVENTS_DROPPED.load(Ordering::Relaxed);
    let events_processed = EVENTS_PROCESSED.load(Ordering::Relaxed);
    let events_failed = EVENTS_FAILED.load(Ordering::Relaxed);

    let total_cache = cache_hits + cache_misses;
    let cache_hit_rate = if total_cache > 0 {
        (cache_hits as f64 / total_cache as f64) * 100.0
    } else {
        0.0
    };

    format!(
        r#"# HELP sync_uptime_seconds Number of seconds the service has been running
# TYPE sync_uptime_seconds gauge
sync_uptime_seconds {}

# HELP sync_outbound_success Number of successful outbound mirror operations
# TYPE sync_outbound_success counter
sync_outbound_success {}

# HELP sync_outbound_failed Number of failed outbound mirror operations
# TYPE sync_outbound_failed counter
sync_outbound_failed {}

# HELP reconcile_runs_total Number of reconciliation runs started
# TYPE reconcile_runs_total counter
reconcile_runs_total {}

# HELP reconcile_item_errors_total Number of per-item reconciliation failures
# TYPE reconcile_item_errors_total counter
reconcile_item_errors_total {}

# HELP cache_hits_total Number of cache hits
# TYPE cache_hits_total counter
cache_hits_total {}

# HELP cache_misses_total Number of cache misses
# TYPE cache_misses_total counter
cache_misses_total {}

# HELP cache_hit_rate_percent Cache hit rate as percentage
# TYPE cache_hit_rate_percent gauge
cache_hit_rate_percent {}

# HELP inbound_events_received Total number of provider events received
# TYPE inbound_events_received counter
inbound_events_received {}

# HELP inbound_events_dropped Number of provider events dropped before queueing
# TYPE inbound_events_dropped counter
inbound_events_dropped {}

# HELP inbound_events_processed Number of provider events handled successfully
# TYPE inbound_events_processed counter
inbound_events_processed {}

# HELP inbound_events_failed Number of provider events whose handler failed
# TYPE inbound_events_failed counter
inbound_events_failed {}
"#,
        uptime_secs,
        sync_success,
        sync_failure,
        reconcile_runs,
        reconcile_item_errors,
        cache_hits,
        cache_misses,
        cache_hit_rate,
        events_received,
        events_dropped,
        events_processed,
        events_failed,
    )
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.headers_mut()
        .insert("Content-Type", "text/plain; charset=utf-8".parse().unwrap());
    res.body(format_prometheus(web_state().started_at.elapsed().as_secs()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_ever_increase() {
        let success_before = SYNC_SUCCESS.load(Ordering::Relaxed);
        let hits_before = CACHE_HITS.load(Ordering::Relaxed);
        let dropped_before = EVENTS_DROPPED.load(Ordering::Relaxed);

        Metrics::sync_success();
        Metrics::cache_hit();
        Metrics::event_dropped();

        assert!(SYNC_SUCCESS.load(Ordering::Relaxed) > success_before);
        assert!(CACHE_HITS.load(Ordering::Relaxed) > hits_before);
        assert!(EVENTS_DROPPED.load(Ordering::Relaxed) > dropped_before);
    }

    #[test]
    fn format_prometheus_includes_all_metrics() {
        let output = format_prometheus(42);
        assert!(output.contains("sync_uptime_seconds 42"));
        assert!(output.contains("sync_outbound_success"));
        assert!(output.contains("reconcile_runs_total"));
        assert!(output.contains("cache_hits_total"));
        assert!(output.contains("inbound_events_dropped"));
    }
}

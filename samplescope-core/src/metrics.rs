//! Query counters and bounded histories exposed through the status endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

const DEFAULT_HISTORY_SIZE: usize = 200;
const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 1_000;
const MAX_SQL_LEN: usize = 2048;

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started_at: Instant,
    started_at_ms: u64,
    slow_query_threshold: Duration,
    history_size: usize,
    total_queries: AtomicU64,
    total_rows: AtomicU64,
    total_errors: AtomicU64,
    total_slow_queries: AtomicU64,
    in_flight_queries: AtomicU64,
    latencies: RwLock<VecDeque<u64>>,
    slow_queries: RwLock<VecDeque<SlowQuery>>,
    recent_errors: RwLock<VecDeque<ErrorEvent>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub sql: String,
    pub rows: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp_ms: u64,
    pub message: String,
    pub sql: Option<String>,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at_ms: u64,
    pub uptime_ms: u64,
    pub slow_query_threshold_ms: u64,
    pub history_size: usize,
    pub totals: TotalsSnapshot,
    pub in_flight_queries: u64,
    pub latency: LatencySummarySnapshot,
    pub slow_queries: Vec<SlowQuery>,
    pub recent_errors: Vec<ErrorEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalsSnapshot {
    pub queries: u64,
    pub rows: u64,
    pub errors: u64,
    pub slow_queries: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummarySnapshot {
    pub count: usize,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Counts a query as in flight until dropped.
pub struct InFlightGuard {
    inner: Arc<MetricsInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight_queries.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_QUERY_THRESHOLD_MS, DEFAULT_HISTORY_SIZE)
    }
}

impl Metrics {
    /// Zero values fall back to the defaults.
    pub fn new(slow_query_threshold_ms: u64, history_size: usize) -> Self {
        let history_size = if history_size == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            history_size
        };
        let threshold_ms = if slow_query_threshold_ms == 0 {
            DEFAULT_SLOW_QUERY_THRESHOLD_MS
        } else {
            slow_query_threshold_ms
        };

        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                started_at_ms: now_millis(),
                slow_query_threshold: Duration::from_millis(threshold_ms),
                history_size,
                total_queries: AtomicU64::new(0),
                total_rows: AtomicU64::new(0),
                total_errors: AtomicU64::new(0),
                total_slow_queries: AtomicU64::new(0),
                in_flight_queries: AtomicU64::new(0),
                latencies: RwLock::new(VecDeque::with_capacity(history_size)),
                slow_queries: RwLock::new(VecDeque::with_capacity(history_size)),
                recent_errors: RwLock::new(VecDeque::with_capacity(history_size)),
            }),
        }
    }

    pub fn start_query(&self) -> InFlightGuard {
        self.inner.in_flight_queries.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn record_query_success(&self, sql: &str, duration: Duration, rows: usize) {
        self.inner
            .total_rows
            .fetch_add(rows as u64, Ordering::Relaxed);
        self.record_query(sql, duration, Some(rows as u64));
    }

    pub fn record_query_error(&self, sql: &str, duration: Duration, message: String) {
        self.record_query(sql, duration, None);
        self.record_error("query", Some(&compact_sql(sql)), message);
    }

    /// Record a failure outside of query execution, e.g. during startup.
    pub fn record_error(&self, context: &str, sql: Option<&str>, message: String) {
        self.inner.total_errors.fetch_add(1, Ordering::Relaxed);
        let event = ErrorEvent {
            timestamp_ms: now_millis(),
            message,
            sql: sql.map(str::to_string),
            context: context.to_string(),
        };
        let mut errors = self
            .inner
            .recent_errors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        push_ring(&mut errors, event, self.inner.history_size);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latencies = self
            .inner
            .latencies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect::<Vec<_>>();
        let slow_queries = self
            .inner
            .slow_queries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>();
        let recent_errors = self
            .inner
            .recent_errors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>();

        MetricsSnapshot {
            started_at_ms: self.inner.started_at_ms,
            uptime_ms: self.inner.started_at.elapsed().as_millis() as u64,
            slow_query_threshold_ms: self.inner.slow_query_threshold.as_millis() as u64,
            history_size: self.inner.history_size,
            totals: TotalsSnapshot {
                queries: self.inner.total_queries.load(Ordering::Relaxed),
                rows: self.inner.total_rows.load(Ordering::Relaxed),
                errors: self.inner.total_errors.load(Ordering::Relaxed),
                slow_queries: self.inner.total_slow_queries.load(Ordering::Relaxed),
            },
            in_flight_queries: self.inner.in_flight_queries.load(Ordering::Relaxed),
            latency: summarize_latencies(latencies),
            slow_queries,
            recent_errors,
        }
    }

    fn record_query(&self, sql: &str, duration: Duration, rows: Option<u64>) {
        self.inner.total_queries.fetch_add(1, Ordering::Relaxed);
        let duration_ms = duration.as_millis() as u64;
        {
            let mut latencies = self
                .inner
                .latencies
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            push_ring(&mut latencies, duration_ms, self.inner.history_size);
        }

        if duration < self.inner.slow_query_threshold {
            return;
        }
        self.inner
            .total_slow_queries
            .fetch_add(1, Ordering::Relaxed);
        let sql = compact_sql(sql);
        warn!(
            duration_ms,
            threshold_ms = self.inner.slow_query_threshold.as_millis() as u64,
            rows = ?rows,
            sql = %sql,
            "slow query recorded"
        );
        let mut slow_queries = self
            .inner
            .slow_queries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        push_ring(
            &mut slow_queries,
            SlowQuery {
                timestamp_ms: now_millis(),
                duration_ms,
                sql,
                rows,
            },
            self.inner.history_size,
        );
    }
}

fn push_ring<T>(target: &mut VecDeque<T>, value: T, max: usize) {
    if target.len() >= max {
        target.pop_front();
    }
    target.push_back(value);
}

fn summarize_latencies(mut values: Vec<u64>) -> LatencySummarySnapshot {
    if values.is_empty() {
        return LatencySummarySnapshot::default();
    }
    let count = values.len();
    let avg_ms = values.iter().sum::<u64>() / count as u64;
    values.sort_unstable();

    LatencySummarySnapshot {
        count,
        avg_ms,
        p50_ms: percentile(&values, 0.50),
        p95_ms: percentile(&values, 0.95),
        p99_ms: percentile(&values, 0.99),
        max_ms: values[count - 1],
    }
}

fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn compact_sql(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_SQL_LEN {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(MAX_SQL_LEN).collect();
    out.push_str("...");
    out
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let snapshot = Metrics::new(0, 0).snapshot();
        assert_eq!(
            snapshot.slow_query_threshold_ms,
            DEFAULT_SLOW_QUERY_THRESHOLD_MS
        );
        assert_eq!(snapshot.history_size, DEFAULT_HISTORY_SIZE);
    }

    #[test]
    fn in_flight_guard_tracks_running_queries() {
        let metrics = Metrics::new(100, 8);
        {
            let _guard = metrics.start_query();
            assert_eq!(metrics.snapshot().in_flight_queries, 1);
        }
        assert_eq!(metrics.snapshot().in_flight_queries, 0);
    }

    #[test]
    fn records_totals_and_caps_histories() {
        let metrics = Metrics::new(10, 2);
        metrics.record_query_success("SELECT 1", Duration::from_millis(5), 1);
        metrics.record_query_success("SELECT * FROM samples", Duration::from_millis(30), 250);
        metrics.record_query_error(
            "SELECT * FROM nonexistent_view",
            Duration::from_millis(12),
            "Catalog Error".to_string(),
        );
        metrics.record_error("initialization", None, "fetch failed".to_string());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.totals.queries, 3);
        assert_eq!(snapshot.totals.rows, 251);
        assert_eq!(snapshot.totals.errors, 2);
        assert_eq!(snapshot.totals.slow_queries, 2);
        assert_eq!(snapshot.latency.count, 2);
        assert_eq!(snapshot.recent_errors.len(), 2);
        assert_eq!(snapshot.recent_errors[0].context, "initialization");
        assert_eq!(
            snapshot.recent_errors[1].sql.as_deref(),
            Some("SELECT * FROM nonexistent_view")
        );
        assert_eq!(snapshot.slow_queries[0].sql, "SELECT * FROM nonexistent_view");
    }

    #[test]
    fn latency_summary_handles_empty_and_percentiles() {
        let empty = summarize_latencies(vec![]);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.max_ms, 0);

        let summary = summarize_latencies(vec![100, 10, 30, 20]);
        assert_eq!(summary.count, 4);
        assert_eq!(summary.avg_ms, 40);
        assert_eq!(summary.p50_ms, 30);
        assert_eq!(summary.p99_ms, 100);
        assert_eq!(summary.max_ms, 100);
    }

    #[test]
    fn compact_sql_collapses_whitespace_and_truncates() {
        assert_eq!(
            compact_sql("SELECT   *\nFROM   samples\tWHERE  id = 1"),
            "SELECT * FROM samples WHERE id = 1"
        );
        let long = format!("SELECT {}", "x".repeat(MAX_SQL_LEN + 10));
        let compacted = compact_sql(&long);
        assert!(compacted.ends_with("..."));
        assert_eq!(compacted.chars().count(), MAX_SQL_LEN + 3);
    }
}

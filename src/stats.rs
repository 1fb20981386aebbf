//! Replay Statistics
//!
//! Per-task stats bundles and the merge rules used to aggregate them
//! bottom-up: connection task -> worker -> run total. Scalars sum; the
//! drift metric keeps the value with the largest magnitude; error maps
//! union with later writers winning.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::model::Timestamp;

/// One row of the per-worker query timing CSV.
#[derive(Debug, Clone)]
pub struct QueryTiming {
    pub pid: String,
    pub query_idx: usize,
    pub start: Timestamp,
    pub end: Timestamp,
    pub elapsed_sec: f64,
}

/// Counters and error logs for one scope of the replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayStats {
    /// Observed connection drift (actual - expected offset), seconds.
    pub connection_diff_sec: f64,
    pub transaction_success: u64,
    pub transaction_error: u64,
    pub query_success: u64,
    pub query_error: u64,
    pub multi_statements: u64,
    pub executed_queries: u64,
    /// Connection open failures, keyed `{db}-{user}-{pid}`.
    pub connection_error_log: HashMap<String, String>,
    /// Failed transactions, keyed `{db}-{user}-{pid}-{xid}`, as
    /// (statement, error) pairs.
    pub transaction_error_log: HashMap<String, Vec<(String, String)>>,
    pub query_timings: Vec<QueryTiming>,
}

impl ReplayStats {
    /// Merge another bundle into this one.
    pub fn collect(&mut self, other: &ReplayStats) {
        if other.connection_diff_sec.abs() >= self.connection_diff_sec.abs() {
            self.connection_diff_sec = other.connection_diff_sec;
        }
        self.transaction_success += other.transaction_success;
        self.transaction_error += other.transaction_error;
        self.query_success += other.query_success;
        self.query_error += other.query_error;
        self.multi_statements += other.multi_statements;
        self.executed_queries += other.executed_queries;
        for (key, value) in &other.connection_error_log {
            self.connection_error_log
                .insert(key.clone(), value.clone());
        }
        for (key, value) in &other.transaction_error_log {
            self.transaction_error_log
                .insert(key.clone(), value.clone());
        }
        self.query_timings.extend(other.query_timings.iter().cloned());
    }
}

pub fn percent(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    num as f64 / den as f64 * 100.0
}

/// Log the live progress line shown while the replay runs.
pub fn display_stats(stats: &ReplayStats, total_queries: u64, peak_connections: usize) {
    let attempted = stats.query_success + stats.query_error;
    info!(
        "Queries executed: {} of {} ({:.1}%)  [Success: {} ({:.1}%), Failed: {} ({:.1}%), \
         Peak connections: {}]",
        attempted,
        total_queries,
        percent(attempted, total_queries),
        stats.query_success,
        percent(stats.query_success, attempted),
        stats.query_error,
        percent(stats.query_error, attempted),
        peak_connections,
    );
}

/// Log per-worker drift and the overall maximum.
pub fn print_stats(per_worker: &[ReplayStats]) {
    if per_worker.is_empty() {
        warn!("No stats gathered.");
        return;
    }
    let mut max_diff = 0.0f64;
    for (idx, stats) in per_worker.iter().enumerate() {
        if stats.connection_diff_sec.abs() > max_diff.abs() {
            max_diff = stats.connection_diff_sec;
        }
        debug!(
            "[{idx}] Max connection offset: {:+.3} sec",
            stats.connection_diff_sec
        );
    }
    debug!("Max connection offset: {max_diff:+.3} sec");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(diff: f64, ts: u64, qs: u64) -> ReplayStats {
        ReplayStats {
            connection_diff_sec: diff,
            transaction_success: ts,
            query_success: qs,
            ..ReplayStats::default()
        }
    }

    #[test]
    fn test_collect_sums_scalars() {
        let mut total = ReplayStats::default();
        total.collect(&bundle(0.0, 2, 5));
        total.collect(&bundle(0.0, 3, 7));
        assert_eq!(total.transaction_success, 5);
        assert_eq!(total.query_success, 12);
    }

    #[test]
    fn test_collect_keeps_max_magnitude_drift() {
        let mut total = ReplayStats::default();
        total.collect(&bundle(1.5, 0, 0));
        total.collect(&bundle(-4.0, 0, 0));
        total.collect(&bundle(2.0, 0, 0));
        assert_eq!(total.connection_diff_sec, -4.0);
    }

    #[test]
    fn test_collect_unions_error_maps_later_writer_wins() {
        let mut a = ReplayStats::default();
        a.connection_error_log
            .insert("dev-alice-1".to_string(), "first".to_string());
        let mut b = ReplayStats::default();
        b.connection_error_log
            .insert("dev-alice-1".to_string(), "second".to_string());
        b.connection_error_log
            .insert("dev-bob-2".to_string(), "other".to_string());

        let mut total = ReplayStats::default();
        total.collect(&a);
        total.collect(&b);
        assert_eq!(total.connection_error_log.len(), 2);
        assert_eq!(total.connection_error_log["dev-alice-1"], "second");
    }

    #[test]
    fn test_percent_zero_denominator() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}

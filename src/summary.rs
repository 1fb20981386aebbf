//! Run Summary & Error Export
//!
//! Writes the per-record error files and per-worker query timing CSVs under
//! the error location, and builds the human-readable end-of-run summary.

use anyhow::Result;
use tracing::info;

use crate::correlate::Workload;
use crate::stats::{percent, ReplayStats};
use crate::storage::{join_location, ObjectStore};

/// Write one text file per recorded connection and transaction error under
/// `<error_location>/<replay_id>/{connection_errors,transaction_errors}/`.
pub async fn export_errors(
    stats: &ReplayStats,
    store: &dyn ObjectStore,
    error_location: &str,
    replay_id: &str,
) -> Result<()> {
    let base = join_location(error_location, replay_id);
    info!(
        "Exporting {} connection errors and {} transaction errors to {base}",
        stats.connection_error_log.len(),
        stats.transaction_error_log.len()
    );

    for (key, detail) in &stats.connection_error_log {
        let location = join_location(&join_location(&base, "connection_errors"), &format!("{key}.txt"));
        store.put(&location, detail.as_bytes()).await?;
    }
    for (key, errors) in &stats.transaction_error_log {
        let mut body = String::new();
        for (statement, error) in errors {
            body.push_str(statement);
            body.push('\n');
            body.push_str(error);
            body.push_str("\n\n");
        }
        let location = join_location(&join_location(&base, "transaction_errors"), &format!("{key}.txt"));
        store.put(&location, body.as_bytes()).await?;
    }
    Ok(())
}

/// Write one query-timing CSV per worker.
pub async fn export_query_timings(
    per_worker: &[ReplayStats],
    store: &dyn ObjectStore,
    error_location: &str,
    replay_id: &str,
) -> Result<()> {
    let base = join_location(&join_location(error_location, replay_id), "query_timings");
    for (idx, stats) in per_worker.iter().enumerate() {
        if stats.query_timings.is_empty() {
            continue;
        }
        let mut body = String::from("pid,query_idx,start_time,end_time,elapsed_sec\n");
        for timing in &stats.query_timings {
            body.push_str(&format!(
                "{},{},{},{},{:.3}\n",
                timing.pid,
                timing.query_idx,
                timing.start.to_rfc3339(),
                timing.end.to_rfc3339(),
                timing.elapsed_sec
            ));
        }
        let location = join_location(&base, &format!("worker_{idx}.csv"));
        store.put(&location, body.as_bytes()).await?;
    }
    Ok(())
}

/// Build the human-readable end-of-run summary lines.
pub fn summarize(
    total: &ReplayStats,
    workload: &Workload,
    replayed_connections: usize,
    duration: chrono::Duration,
) -> Vec<String> {
    let query_attempts = total.query_success + total.query_error;
    let transaction_attempts = total.transaction_success + total.transaction_error;
    vec![
        format!(
            "Attempted to replay {} queries, {} transactions, {} connections.",
            workload.query_count,
            workload.transaction_count,
            workload.connections.len()
        ),
        format!(
            "Successfully replayed {} out of {} ({:.1}%) queries.",
            total.query_success,
            query_attempts,
            percent(total.query_success, query_attempts)
        ),
        format!(
            "Successfully replayed {} out of {} ({:.1}%) transactions.",
            total.transaction_success,
            transaction_attempts,
            percent(total.transaction_success, transaction_attempts)
        ),
        format!(
            "Replayed {} out of {} captured connections.",
            replayed_connections, workload.total_connections
        ),
        format!(
            "Encountered {} connection errors and {} transaction errors.",
            total.connection_error_log.len(),
            total.transaction_error_log.len()
        ),
        format!(
            "Replay finished in {}.",
            format_duration(duration)
        ),
    ]
}

fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds().max(0);
    format!(
        "{}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60
    )
}

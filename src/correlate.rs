//! Correlator
//!
//! Rebuilds connections-with-transactions from the raw extract: parses both
//! record streams, filters them, joins transactions to connections by
//! session key plus a temporal rule, and computes inter-query gaps where
//! query pacing is active.

use std::collections::HashMap;

use anyhow::Result;
use chrono::TimeZone;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::ReplayConfig;
use crate::filters::{validate_and_normalize_filters, FilterConfig};
use crate::model::{ConnectionLog, Timestamp, Transaction};
use crate::parse::connections::parse_connections;
use crate::parse::transactions::TransactionsParser;
use crate::storage::ObjectStore;

/// A correlated workload, ready to be scheduled.
#[derive(Debug)]
pub struct Workload {
    /// Filtered connections, sorted by initiation time, each carrying its
    /// attached transactions. Connections that matched no transaction are
    /// kept and replayed as bare sessions.
    pub connections: Vec<ConnectionLog>,
    pub query_count: u64,
    pub transaction_count: u64,
    /// Earliest recorded session initiation among the filtered connections.
    pub first_event_time: Option<Timestamp>,
    /// Latest recorded disconnection among the filtered connections.
    pub last_event_time: Option<Timestamp>,
    /// Connection count before filtering, for the summary.
    pub total_connections: usize,
}

pub async fn correlate(
    store: &dyn ObjectStore,
    config: &ReplayConfig,
    raw_filters: &FilterConfig,
    replay_id: &str,
) -> Result<Workload> {
    let connection_filters = validate_and_normalize_filters::<ConnectionLog>(raw_filters)?;
    let transaction_filters = validate_and_normalize_filters::<Transaction>(raw_filters)?;

    let (mut connections, total_connections) = parse_connections(
        store,
        &config.workload_location,
        config.transaction_pacing(),
        config.query_pacing(),
        &connection_filters,
    )
    .await?;

    let parser = TransactionsParser::new(store, config, &transaction_filters, replay_id);
    let transactions = parser.parse_transactions().await?;

    // Candidate connection indices per session key, preserving sort order.
    let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, connection) in connections.iter().enumerate() {
        groups
            .entry(connection.connection_key.as_str())
            .or_default()
            .push(idx);
    }

    let mut attached: HashMap<usize, Vec<Transaction>> = HashMap::new();
    let mut transaction_count = 0u64;
    let mut query_count = 0u64;
    for transaction in transactions {
        match find_connection(&transaction, &connections, &groups) {
            Some(idx) => {
                transaction_count += 1;
                query_count += transaction.queries.len() as u64;
                attached.entry(idx).or_default().push(transaction);
            }
            None => {
                warn!(
                    "Could not find matching connection for transaction {} (key {}), skipping",
                    transaction.xid, transaction.transaction_key
                );
            }
        }
    }
    for (idx, transactions) in attached {
        connections[idx].transactions = transactions;
    }

    for connection in &mut connections {
        for transaction in &mut connection.transactions {
            if connection.pace_queries || transaction.time_interval {
                compute_query_intervals(transaction);
            }
        }
    }

    let first_event_time = connections
        .iter()
        .filter_map(|c| c.session_initiation_time)
        .min();
    let last_event_time = connections
        .iter()
        .filter_map(|c| c.disconnection_time)
        .max();

    info!(
        "Correlated {} connections ({} before filtering), {} transactions, {} queries",
        connections.len(),
        total_connections,
        transaction_count,
        query_count
    );

    Ok(Workload {
        connections,
        query_count,
        transaction_count,
        first_event_time,
        last_event_time,
        total_connections,
    })
}

/// Among same-key candidates, pick the last one whose initiation time,
/// truncated to whole seconds, does not exceed the transaction's start.
fn find_connection(
    transaction: &Transaction,
    connections: &[ConnectionLog],
    groups: &HashMap<&str, Vec<usize>>,
) -> Option<usize> {
    let candidates = groups.get(transaction.transaction_key.as_str())?;
    let start = transaction.start_time();
    let mut chosen = None;
    for &idx in candidates {
        let initiation = connections[idx].initiation_or_epoch();
        if truncate_to_second(initiation) <= start {
            chosen = Some(idx);
        }
    }
    chosen
}

fn truncate_to_second(ts: Timestamp) -> Timestamp {
    Utc.timestamp_opt(ts.timestamp(), 0).unwrap()
}

/// Gap from each query's recorded end to the next query's start. The last
/// query in a transaction keeps an interval of zero.
fn compute_query_intervals(transaction: &mut Transaction) {
    for idx in 0..transaction.queries.len().saturating_sub(1) {
        let gap = transaction.queries[idx + 1].start_time - transaction.queries[idx].end_time;
        transaction.queries[idx].time_interval =
            gap.num_milliseconds() as f64 / 1000.0;
    }
}

//! Record Model
//!
//! Value types for the captured workload: connections, the transactions that
//! ran on them, and the individual queries. Records are built once when the
//! extract is loaded and mutated only by the correlator (attaching
//! transactions, computing inter-query gaps).

use chrono::{DateTime, TimeZone, Utc};

pub type Timestamp = DateTime<Utc>;

/// Epoch reference used when a connection has no recorded initiation time.
pub fn epoch() -> Timestamp {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// Key identifying the session a record belongs to.
pub fn connection_key(database_name: &str, username: &str, pid: &str) -> String {
    format!("{}_{}_{}", database_name, username, pid)
}

/// Contract for record types the filter engine can evaluate.
pub trait Filterable {
    /// Field names this record type supports filtering on.
    fn supported_filters() -> &'static [&'static str];
    /// The record's value for a supported field.
    fn filter_value(&self, field: &str) -> &str;
}

/// A single captured query.
#[derive(Debug, Clone)]
pub struct Query {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Seconds to wait before the *next* query in the same transaction.
    /// Computed by the correlator when query pacing is active.
    pub time_interval: f64,
    pub text: String,
}

impl Query {
    pub fn new(start_time: Timestamp, end_time: Timestamp, text: String) -> Self {
        Self {
            start_time,
            end_time,
            time_interval: 0.0,
            text,
        }
    }

    /// Offset of this query's recorded start relative to a reference time.
    pub fn offset_ms(&self, ref_time: Timestamp) -> f64 {
        (self.start_time - ref_time).num_milliseconds() as f64
    }
}

/// A captured transaction: an ordered list of queries sharing an xid.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Per-record query pacing flag from the extract.
    pub time_interval: bool,
    pub database_name: String,
    pub username: String,
    pub pid: String,
    pub xid: String,
    pub transaction_key: String,
    /// Sorted ascending by start time.
    pub queries: Vec<Query>,
}

impl Transaction {
    pub fn start_time(&self) -> Timestamp {
        self.queries[0].start_time
    }

    pub fn end_time(&self) -> Timestamp {
        self.queries[self.queries.len() - 1].end_time
    }

    pub fn offset_ms(&self, ref_time: Timestamp) -> f64 {
        self.queries[0].offset_ms(ref_time)
    }

    /// Key for this transaction's error file: `{db}-{user}-{pid}-{xid}`.
    pub fn base_filename(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.database_name, self.username, self.pid, self.xid
        )
    }
}

impl Filterable for Transaction {
    fn supported_filters() -> &'static [&'static str] {
        &["database_name", "username", "pid"]
    }

    fn filter_value(&self, field: &str) -> &str {
        match field {
            "database_name" => &self.database_name,
            "username" => &self.username,
            "pid" => &self.pid,
            _ => "",
        }
    }
}

/// A captured client connection with the transactions that ran on it.
#[derive(Debug, Clone)]
pub struct ConnectionLog {
    pub session_initiation_time: Option<Timestamp>,
    pub disconnection_time: Option<Timestamp>,
    pub application_name: String,
    pub database_name: String,
    pub username: String,
    pub pid: String,
    /// Reproduce the recorded gaps between transactions on this connection.
    pub pace_transactions: bool,
    /// Reproduce the recorded gaps between queries within a transaction.
    pub pace_queries: bool,
    pub connection_key: String,
    /// Sorted ascending by transaction start time. Populated by the correlator.
    pub transactions: Vec<Transaction>,
}

impl ConnectionLog {
    /// Initiation time, treating a missing value as the epoch for sorting.
    pub fn initiation_or_epoch(&self) -> Timestamp {
        self.session_initiation_time.unwrap_or_else(epoch)
    }

    /// Offset of this connection's recorded initiation relative to a reference.
    pub fn offset_ms(&self, ref_time: Timestamp) -> f64 {
        (self.initiation_or_epoch() - ref_time).num_milliseconds() as f64
    }

    /// Key for this connection's error file: `{db}-{user}-{pid}`.
    pub fn error_key(&self) -> String {
        format!("{}-{}-{}", self.database_name, self.username, self.pid)
    }

    /// One-line description used in connection error files.
    pub fn describe(&self) -> String {
        format!(
            "Session initiation time: {:?}, Disconnection time: {:?}, Application name: {}, \
             Database name: {}, Username: {}, PID: {}, Pace transactions: {}, Pace queries: {}, \
             Number of transactions: {}",
            self.session_initiation_time,
            self.disconnection_time,
            self.application_name,
            self.database_name,
            self.username,
            self.pid,
            self.pace_transactions,
            self.pace_queries,
            self.transactions.len()
        )
    }
}

impl Filterable for ConnectionLog {
    fn supported_filters() -> &'static [&'static str] {
        &["database_name", "username", "pid"]
    }

    fn filter_value(&self, field: &str) -> &str {
        match field {
            "database_name" => &self.database_name,
            "username" => &self.username,
            "pid" => &self.pid,
            _ => "",
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Duration;

    pub fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn query(start_secs: i64, end_secs: i64, text: &str) -> Query {
        Query::new(ts(start_secs), ts(end_secs), text.to_string())
    }

    pub fn transaction(db: &str, user: &str, pid: &str, xid: &str, queries: Vec<Query>) -> Transaction {
        Transaction {
            time_interval: false,
            database_name: db.to_string(),
            username: user.to_string(),
            pid: pid.to_string(),
            xid: xid.to_string(),
            transaction_key: connection_key(db, user, pid),
            queries,
        }
    }

    pub fn connection(db: &str, user: &str, pid: &str, start_secs: i64, dur_secs: i64) -> ConnectionLog {
        ConnectionLog {
            session_initiation_time: Some(ts(start_secs)),
            disconnection_time: Some(ts(start_secs) + Duration::seconds(dur_secs)),
            application_name: "psql".to_string(),
            database_name: db.to_string(),
            username: user.to_string(),
            pid: pid.to_string(),
            pace_transactions: false,
            pace_queries: false,
            connection_key: connection_key(db, user, pid),
            transactions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_connection_key_format() {
        assert_eq!(connection_key("dev", "alice", "1234"), "dev_alice_1234");
    }

    #[test]
    fn test_transaction_bounds_and_filename() {
        let t = transaction(
            "dev",
            "alice",
            "7",
            "42",
            vec![query(0, 1, "select 1"), query(2, 3, "select 2")],
        );
        assert_eq!(t.start_time(), ts(0));
        assert_eq!(t.end_time(), ts(3));
        assert_eq!(t.base_filename(), "dev-alice-7-42");
        assert_eq!(t.transaction_key, "dev_alice_7");
    }

    #[test]
    fn test_offsets_relative_to_reference() {
        let c = connection("dev", "alice", "7", 30, 60);
        assert_eq!(c.offset_ms(ts(0)), 30_000.0);
        let q = query(45, 46, "select 1");
        assert_eq!(q.offset_ms(ts(30)), 15_000.0);
    }
}

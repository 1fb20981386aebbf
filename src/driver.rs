//! SQL Driver Capability
//!
//! The client driver is an opaque capability to the replay engine: open a
//! connection, execute text, commit, close. The primary interface is served
//! in-process over the wire protocol; the secondary (ODBC) interface is
//! supplied by the hosting environment through the same traits.
//!
//! Driver failures carry a SQLSTATE code whose two-character class prefix
//! is mapped to a human-readable category for error reporting.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio_postgres::NoTls;
use tracing::debug;

use crate::credentials::Credentials;

/// Which client interface a connection is replayed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Psql,
    Odbc,
}

impl Interface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Psql => "psql",
            Self::Odbc => "odbc",
        }
    }
}

/// Structured execution failure reported by a driver.
#[derive(Debug, Clone)]
pub struct SqlError {
    /// SQLSTATE code, e.g. "42601".
    pub code: String,
    pub message: String,
    pub severity: String,
    pub detail: String,
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)
    }
}

impl std::error::Error for SqlError {}

/// An open connection to the target cluster.
#[async_trait]
pub trait SqlConnection: Send {
    async fn execute(&mut self, sql: &str) -> Result<(), SqlError>;
    async fn commit(&mut self) -> Result<(), SqlError>;
    async fn close(&mut self);
}

/// Opens connections against the target cluster.
#[async_trait]
pub trait SqlDriver: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        interface: Interface,
    ) -> Result<Box<dyn SqlConnection>>;
}

/// Wire-protocol driver for the primary interface.
pub struct PgDriver;

#[async_trait]
impl SqlDriver for PgDriver {
    async fn connect(
        &self,
        credentials: &Credentials,
        interface: Interface,
    ) -> Result<Box<dyn SqlConnection>> {
        match interface {
            Interface::Psql => {
                let mut pg = tokio_postgres::Config::new();
                pg.host(&credentials.host)
                    .port(credentials.port)
                    .user(&credentials.username)
                    .password(&credentials.password)
                    .dbname(&credentials.database)
                    .application_name("workload-replicator")
                    .connect_timeout(Duration::from_secs(30));
                let (client, connection) = pg.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(error = %e, "connection task ended");
                    }
                });
                Ok(Box::new(PgConnection { client }))
            }
            Interface::Odbc => bail!("odbc interface requires an externally supplied driver"),
        }
    }
}

struct PgConnection {
    client: tokio_postgres::Client,
}

#[async_trait]
impl SqlConnection for PgConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), SqlError> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(sql_error_from_pg)
    }

    async fn commit(&mut self) -> Result<(), SqlError> {
        self.client
            .batch_execute("commit")
            .await
            .map_err(sql_error_from_pg)
    }

    async fn close(&mut self) {
        // Dropping the client closes the socket.
    }
}

fn sql_error_from_pg(err: tokio_postgres::Error) -> SqlError {
    if let Some(db) = err.as_db_error() {
        SqlError {
            code: db.code().code().to_string(),
            message: db.message().to_string(),
            severity: db.severity().to_string(),
            detail: db.detail().unwrap_or_default().to_string(),
        }
    } else {
        SqlError {
            code: "08000".to_string(),
            message: err.to_string(),
            severity: "ERROR".to_string(),
            detail: String::new(),
        }
    }
}

/// Map a SQLSTATE code to its class category.
/// See <https://www.postgresql.org/docs/current/errcodes-appendix.html>.
pub fn categorize_error(code: &str) -> &'static str {
    let class = if code.len() >= 2 { &code[0..2] } else { code };
    match class {
        "00" => "Successful Completion",
        "01" => "Warning",
        "02" => "No Data",
        "03" => "SQL Statement Not Yet Complete",
        "08" => "Connection Exception",
        "09" => "Triggered Action Exception",
        "0A" => "Feature Not Supported",
        "0B" => "Invalid Transaction Initiation",
        "0F" => "Locator Exception",
        "0L" => "Invalid Grantor",
        "0P" => "Invalid Role Specification",
        "0Z" => "Diagnostics Exception",
        "20" => "Case Not Found",
        "21" => "Cardinality Violation",
        "22" => "Data Exception",
        "23" => "Integrity Constraint Violation",
        "24" => "Invalid Cursor State",
        "25" => "Invalid Transaction State",
        "26" => "Invalid SQL Statement Name",
        "27" => "Triggered Data Change Violation",
        "28" => "Invalid Authorization Specification",
        "2B" => "Dependent Privilege Descriptors Still Exist",
        "2D" => "Invalid Transaction Termination",
        "2F" => "SQL Routine Exception",
        "34" => "Invalid Cursor Name",
        "38" => "External Routine Exception",
        "39" => "External Routine Invocation Exception",
        "3B" => "Savepoint Exception",
        "3D" => "Invalid Catalog Name",
        "3F" => "Invalid Schema Name",
        "40" => "Transaction Rollback",
        "42" => "Syntax Error or Access Rule Violation",
        "44" => "WITH CHECK OPTION Violation",
        "53" => "Insufficient Resources",
        "54" => "Program Limit Exceeded",
        "55" => "Object Not In Prerequisite State",
        "57" => "Operator Intervention",
        "58" => "System Error",
        "72" => "Snapshot Failure",
        "F0" => "Configuration File Error",
        "HV" => "Foreign Data Wrapper Error (SQL/MED)",
        "P0" => "PL/pgSQL Error",
        "XX" => "Internal Error",
        _ => "Uncategorized Error",
    }
}

/// Strip /* block */ and // line comments, leaving quoted strings intact.
pub fn remove_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                // copy the quoted string wholesale
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&inner) = chars.peek() {
                    if inner == '\n' || inner == '\r' {
                        break;
                    }
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Structured record of one failed statement, appended to the shared error
/// list for offline analysis.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub user: String,
    pub db: String,
    pub query_text: String,
    pub detail: String,
    pub code: String,
    pub message: String,
    pub severity: String,
    pub category: String,
}

/// Build an [`ErrorRecord`] from a driver failure.
pub fn parse_error(err: &SqlError, user: &str, db: &str, query_text: &str) -> ErrorRecord {
    ErrorRecord {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        user: user.to_string(),
        db: db.to_string(),
        query_text: remove_comments(query_text),
        detail: err.detail.clone(),
        code: err.code.clone(),
        message: err.message.clone(),
        severity: err.severity.clone(),
        category: categorize_error(&err.code).to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records executed statements; optionally fails statements containing a
    /// marker fragment, or refuses connections entirely.
    #[derive(Default)]
    pub struct MockDriver {
        pub executed: Arc<Mutex<Vec<String>>>,
        pub fail_statements_containing: Option<String>,
        pub refuse_connections: bool,
    }

    #[async_trait]
    impl SqlDriver for MockDriver {
        async fn connect(
            &self,
            _credentials: &Credentials,
            _interface: Interface,
        ) -> Result<Box<dyn SqlConnection>> {
            if self.refuse_connections {
                bail!("connection refused");
            }
            Ok(Box::new(MockConnection {
                executed: self.executed.clone(),
                fail_statements_containing: self.fail_statements_containing.clone(),
            }))
        }
    }

    struct MockConnection {
        executed: Arc<Mutex<Vec<String>>>,
        fail_statements_containing: Option<String>,
    }

    #[async_trait]
    impl SqlConnection for MockConnection {
        async fn execute(&mut self, sql: &str) -> Result<(), SqlError> {
            if let Some(fragment) = &self.fail_statements_containing {
                if sql.contains(fragment.as_str()) {
                    return Err(SqlError {
                        code: "42601".to_string(),
                        message: format!("syntax error near {fragment:?}"),
                        severity: "ERROR".to_string(),
                        detail: String::new(),
                    });
                }
            }
            self.executed.lock().push(sql.to_string());
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), SqlError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_known_classes() {
        assert_eq!(categorize_error("42601"), "Syntax Error or Access Rule Violation");
        assert_eq!(categorize_error("08006"), "Connection Exception");
        assert_eq!(categorize_error("XX000"), "Internal Error");
    }

    #[test]
    fn test_categorize_unknown_class() {
        assert_eq!(categorize_error("99601"), "Uncategorized Error");
        assert_eq!(categorize_error(""), "Uncategorized Error");
    }

    #[test]
    fn test_remove_comments_strips_real_comments() {
        let sql = "/* {\"xid\": 1} */ select 1 // trailing";
        assert_eq!(remove_comments(sql).trim(), "select 1");
    }

    #[test]
    fn test_remove_comments_preserves_quoted_strings() {
        let sql = "select '/* not a comment */', \"a//b\" from t";
        assert_eq!(remove_comments(sql), sql);
    }

    #[test]
    fn test_remove_comments_preserves_non_ascii_literals() {
        let sql = "select 'héllo wörld' from straße";
        assert_eq!(remove_comments(sql), sql);
        assert_eq!(
            remove_comments("select 'héllo' /* wörld */from t"),
            "select 'héllo' from t"
        );
    }

    #[test]
    fn test_parse_error_classifies() {
        let err = SqlError {
            code: "42601".to_string(),
            message: "syntax error at or near \"selec\"".to_string(),
            severity: "ERROR".to_string(),
            detail: String::new(),
        };
        let record = parse_error(&err, "alice", "dev", "/* tag */ selec 1");
        assert_eq!(record.category, "Syntax Error or Access Rule Violation");
        assert_eq!(record.query_text.trim(), "selec 1");
        assert_eq!(record.user, "alice");
    }
}

//! Connection Executor
//!
//! One task per replayed connection: opens the target connection, paces and
//! executes the connection's transactions and queries, classifies failures,
//! and reports a private stats bundle back to its worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::config::ReplayConfig;
use crate::credentials::CredentialProvider;
use crate::driver::{parse_error, ErrorRecord, Interface, SqlConnection, SqlDriver};
use crate::model::{ConnectionLog, Timestamp, Transaction};
use crate::parse::find_ci;
use crate::stats::{QueryTiming, ReplayStats};

/// Slack below which a pacing sleep is skipped.
const SCHEDULE_SLACK_MS: f64 = 10.0;

/// Shared state for one replay run, handed to every worker and executor.
pub struct RunContext {
    pub config: Arc<ReplayConfig>,
    pub replay_id: String,
    /// Wall-clock instant the replay started; all pacing is relative to it.
    pub replay_start: Timestamp,
    /// Earliest recorded event in the workload.
    pub first_event_time: Timestamp,
    pub driver: Arc<dyn SqlDriver>,
    pub credentials: Arc<CredentialProvider>,
    pub live_connections: Arc<AtomicUsize>,
    pub peak_connections: Arc<AtomicUsize>,
    /// Structured per-statement failures across the whole run.
    pub error_list: Arc<Mutex<Vec<ErrorRecord>>>,
}

impl RunContext {
    /// Milliseconds elapsed since the replay started.
    pub fn elapsed_ms(&self) -> f64 {
        (Utc::now() - self.replay_start).num_milliseconds() as f64
    }
}

/// Holds the live-connection slot for the duration of one executor task.
/// Teardown decrements the counter and releases the admission permit exactly
/// once, on every exit path.
struct LiveGuard {
    live: Arc<AtomicUsize>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl LiveGuard {
    fn new(
        live: Arc<AtomicUsize>,
        peak: &AtomicUsize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let current = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(current, Ordering::SeqCst);
        Self {
            live,
            _permit: permit,
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConnectionExecutor {
    ctx: Arc<RunContext>,
    connection: ConnectionLog,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionExecutor {
    pub fn new(
        ctx: Arc<RunContext>,
        connection: ConnectionLog,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            ctx,
            connection,
            permit,
        }
    }

    /// Replay this connection end to end. Never fails the run: every error
    /// is recorded in the returned stats bundle.
    pub async fn run(mut self) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let _guard = LiveGuard::new(
            self.ctx.live_connections.clone(),
            &self.ctx.peak_connections,
            self.permit.take(),
        );

        let expected_ms = self.connection.offset_ms(self.ctx.first_event_time);
        let drift_sec = (self.ctx.elapsed_ms() - expected_ms) / 1000.0;
        stats.connection_diff_sec = drift_sec;
        if drift_sec.abs() > self.ctx.config.connection_tolerance_sec {
            warn!(
                "Connection {} offset by {drift_sec:+.1} sec versus recorded timing",
                self.connection.connection_key
            );
        }

        let interface = select_interface(
            &self.connection.application_name,
            &self.ctx.config.default_interface,
            self.ctx.config.odbc_driver.is_some(),
        );
        let username = effective_username(
            &self.connection.username,
            &self.ctx.config.master_username,
        );

        let credentials = match self
            .ctx
            .credentials
            .get_credentials(&username, Some(&self.connection.database_name), 10, false)
            .await
        {
            Ok(credentials) => credentials,
            Err(err) => {
                stats
                    .connection_error_log
                    .insert(self.connection.error_key(), err.to_string());
                return stats;
            }
        };

        let mut conn = match self.ctx.driver.connect(&credentials, interface).await {
            Ok(conn) => conn,
            Err(err) => {
                let detail = redact(&err.to_string(), &credentials.password);
                warn!(
                    "Could not open connection {}: {detail}",
                    self.connection.connection_key
                );
                stats.connection_error_log.insert(
                    self.connection.error_key(),
                    format!("{}\n\n{detail}", self.connection.describe()),
                );
                return stats;
            }
        };

        self.run_transactions(conn.as_mut(), &mut stats).await;

        // Hold the session open until its recorded disconnection offset.
        if self.connection.pace_transactions {
            if let Some(disconnect) = self.connection.disconnection_time {
                let target_ms = (disconnect - self.ctx.first_event_time).num_milliseconds() as f64;
                let remaining_ms = target_ms - self.ctx.elapsed_ms();
                if remaining_ms > SCHEDULE_SLACK_MS {
                    tokio::time::sleep(Duration::from_millis(remaining_ms as u64)).await;
                }
            }
        }
        conn.close().await;
        stats
    }

    async fn run_transactions(&self, conn: &mut dyn SqlConnection, stats: &mut ReplayStats) {
        let mut previous_end: Option<Timestamp> = None;
        for transaction in &self.connection.transactions {
            if self.connection.pace_transactions {
                let reference = previous_end
                    .unwrap_or_else(|| self.connection.initiation_or_epoch());
                let wait = (transaction.start_time() - reference).num_milliseconds() as f64;
                if wait > SCHEDULE_SLACK_MS {
                    warn!(
                        "Transaction {} waiting {:.1} sec to hold recorded pacing",
                        transaction.base_filename(),
                        wait / 1000.0
                    );
                    tokio::time::sleep(Duration::from_millis(wait as u64)).await;
                }
            }
            self.run_transaction(conn, transaction, stats).await;
            previous_end = Some(transaction.end_time());
        }
    }

    async fn run_transaction(
        &self,
        conn: &mut dyn SqlConnection,
        transaction: &Transaction,
        stats: &mut ReplayStats,
    ) {
        let mut transaction_errors: Vec<(String, String)> = Vec::new();
        for (query_idx, query) in transaction.queries.iter().enumerate() {
            // Align with the query's recorded offset from the first event.
            let due_in_ms = query.offset_ms(self.ctx.first_event_time) - self.ctx.elapsed_ms();
            if due_in_ms > SCHEDULE_SLACK_MS {
                tokio::time::sleep(Duration::from_millis(due_in_ms as u64)).await;
            }

            let statements = if self.ctx.config.split_multi {
                let split = split_statements(&query.text);
                if split.len() > 1 {
                    stats.multi_statements += 1;
                    let mut wrapped = Vec::with_capacity(split.len() + 2);
                    wrapped.push("begin;".to_string());
                    wrapped.extend(split);
                    wrapped.push("commit;".to_string());
                    wrapped
                } else {
                    split
                }
            } else {
                vec![query.text.clone()]
            };

            let exec_start = Utc::now();
            let mut query_failed = false;
            for statement in &statements {
                if !self.should_execute_sql(statement) {
                    debug!("Not executing statement: {statement}");
                    continue;
                }
                let tagged = tag_statement(
                    statement,
                    &transaction.xid,
                    query_idx,
                    &self.ctx.replay_id,
                );
                stats.executed_queries += 1;
                if let Err(err) = conn.execute(&tagged).await {
                    query_failed = true;
                    debug!(
                        "Failed statement in transaction {}: {err}",
                        transaction.base_filename()
                    );
                    transaction_errors.push((statement.clone(), err.to_string()));
                    self.ctx.error_list.lock().push(parse_error(
                        &err,
                        &transaction.username,
                        &transaction.database_name,
                        statement,
                    ));
                }
            }
            let exec_end = Utc::now();
            stats.query_timings.push(QueryTiming {
                pid: transaction.pid.clone(),
                query_idx,
                start: exec_start,
                end: exec_end,
                elapsed_sec: (exec_end - exec_start).num_milliseconds() as f64 / 1000.0,
            });
            if query_failed {
                stats.query_error += 1;
            } else {
                stats.query_success += 1;
            }

            // Recorded gap to the next query, when query pacing is active.
            let pace_queries = self.connection.pace_queries || transaction.time_interval;
            if pace_queries && query.time_interval > 0.0 {
                tokio::time::sleep(Duration::from_millis(
                    (query.time_interval * 1000.0) as u64,
                ))
                .await;
            }
        }

        if let Err(err) = conn.commit().await {
            debug!(
                "Commit failed for transaction {}: {err}",
                transaction.base_filename()
            );
        }

        if transaction_errors.is_empty() {
            stats.transaction_success += 1;
        } else {
            stats.transaction_error += 1;
            stats
                .transaction_error_log
                .insert(transaction.base_filename(), transaction_errors);
        }
    }

    /// Gate statements that move data through external bulk locations.
    fn should_execute_sql(&self, sql: &str) -> bool {
        if find_ci(sql, "from 's3:").is_some() {
            return self.ctx.config.copy_enabled();
        }
        if find_ci(sql, "to 's3:").is_some() {
            return self.ctx.config.unload_enabled() && self.ctx.config.replay_output.is_some();
        }
        true
    }
}

/// Pick the client interface from the recorded application tag, falling back
/// to the configured default.
pub fn select_interface(
    application_name: &str,
    default_interface: &str,
    odbc_configured: bool,
) -> Interface {
    let app = application_name.to_ascii_lowercase();
    if app.contains("psql") {
        Interface::Psql
    } else if app.contains("odbc") && odbc_configured {
        Interface::Odbc
    } else if default_interface == "odbc" && !odbc_configured {
        warn!("Default interface is odbc but no odbc driver is configured, using psql");
        Interface::Psql
    } else if default_interface == "odbc" {
        Interface::Odbc
    } else {
        Interface::Psql
    }
}

/// Federated identities (`IAM:user`, `IAMR:role`, provider-prefixed) cannot
/// be impersonated; replay them as the administrative user.
pub fn effective_username(recorded: &str, master_username: &str) -> String {
    if recorded.contains(':') {
        master_username.to_string()
    } else {
        recorded.to_string()
    }
}

/// Split SQL text on top-level semicolons, respecting quotes and comments.
/// Empty statements are dropped.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                current.push(c);
                for inner in chars.by_ref() {
                    current.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                current.push('/');
                current.push('*');
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    current.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            ';' => {
                if !current.trim().is_empty() {
                    statements.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

/// Prefix a statement with a machine-readable comment identifying its place
/// in the replay, for matching replayed statements back in the target's logs.
pub fn tag_statement(sql: &str, xid: &str, query_idx: usize, replay_id: &str) -> String {
    format!(
        "/* {{\"xid\": {xid:?}, \"query_idx\": {query_idx}, \"replay\": {replay_id:?}}} */ {sql}"
    )
}

/// Scrub a secret out of free-text error detail before it is recorded.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, "***")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::driver::test_support::MockDriver;
    use crate::model::test_support::ts;

    pub fn run_context() -> (Arc<RunContext>, Arc<Mutex<Vec<String>>>) {
        run_context_with(MockDriver::default(), ReplayConfig::default())
    }

    pub fn run_context_with(
        driver: MockDriver,
        overrides: ReplayConfig,
    ) -> (Arc<RunContext>, Arc<Mutex<Vec<String>>>) {
        use crate::credentials::{CredentialProvider, ProviderSettings, StaticIssuer};

        let executed = driver.executed.clone();
        let config = Arc::new(ReplayConfig {
            workload_location: "wl".to_string(),
            target_cluster_endpoint: "target.abc123.us-east-1.redshift.amazonaws.com:5439/dev"
                .to_string(),
            target_cluster_region: "us-east-1".to_string(),
            master_username: "admin".to_string(),
            ..overrides
        });
        let settings = ProviderSettings {
            target_cluster_endpoint: config.target_cluster_endpoint.clone(),
            target_cluster_region: config.target_cluster_region.clone(),
            odbc_driver: None,
            secret_name: None,
            nlb_nat_dns: None,
        };
        let credentials = Arc::new(CredentialProvider::new(
            settings,
            Arc::new(StaticIssuer {
                username: "admin".to_string(),
                password: "secret".to_string(),
            }),
            None,
        ));
        let ctx = Arc::new(RunContext {
            config,
            replay_id: "replay-test".to_string(),
            replay_start: Utc::now(),
            first_event_time: ts(0),
            driver: Arc::new(driver),
            credentials,
            live_connections: Arc::new(AtomicUsize::new(0)),
            peak_connections: Arc::new(AtomicUsize::new(0)),
            error_list: Arc::new(Mutex::new(Vec::new())),
        });
        (ctx, executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_support::MockDriver;
    use crate::model::test_support::{connection, query, transaction};
    use test_support::{run_context, run_context_with};

    #[tokio::test(start_paused = true)]
    async fn test_executor_replays_transactions_in_order() {
        let (ctx, executed) = run_context();
        let mut c = connection("dev", "alice", "1", 0, 10);
        c.transactions = vec![
            transaction("dev", "alice", "1", "7", vec![query(0, 1, "select 1")]),
            transaction("dev", "alice", "1", "8", vec![query(1, 2, "select 2")]),
        ];
        let live = ctx.live_connections.clone();
        let stats = ConnectionExecutor::new(ctx, c, None).run().await;

        assert_eq!(stats.transaction_success, 2);
        assert_eq!(stats.query_success, 2);
        assert_eq!(stats.executed_queries, 2);
        assert_eq!(stats.query_timings.len(), 2);
        let executed = executed.lock();
        assert!(executed[0].contains("select 1"), "{executed:?}");
        assert!(executed[0].contains("\"xid\": \"7\""), "{executed:?}");
        assert!(executed[1].contains("select 2"), "{executed:?}");
        // live-connection slot released on exit
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_statement_recorded_and_run_continues() {
        let driver = MockDriver {
            fail_statements_containing: Some("boom".to_string()),
            ..MockDriver::default()
        };
        let (ctx, _) = run_context_with(driver, ReplayConfig::default());
        let mut c = connection("dev", "alice", "1", 0, 10);
        c.transactions = vec![transaction(
            "dev",
            "alice",
            "1",
            "7",
            vec![query(0, 1, "select boom"), query(1, 2, "select 2")],
        )];
        let error_list = ctx.error_list.clone();
        let stats = ConnectionExecutor::new(ctx, c, None).run().await;

        assert_eq!(stats.query_error, 1);
        assert_eq!(stats.query_success, 1);
        assert_eq!(stats.transaction_error, 1);
        assert_eq!(stats.transaction_success, 0);
        let errors = stats.transaction_error_log.get("dev-alice-1-7").unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "select boom");
        let recorded = error_list.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].category, "Syntax Error or Access Rule Violation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_records_connection_error() {
        let driver = MockDriver {
            refuse_connections: true,
            ..MockDriver::default()
        };
        let (ctx, _) = run_context_with(driver, ReplayConfig::default());
        let mut c = connection("dev", "alice", "1", 0, 10);
        c.transactions = vec![transaction(
            "dev",
            "alice",
            "1",
            "7",
            vec![query(0, 1, "select 1")],
        )];
        let live = ctx.live_connections.clone();
        let stats = ConnectionExecutor::new(ctx, c, None).run().await;

        assert_eq!(stats.transaction_success + stats.transaction_error, 0);
        assert!(stats.connection_error_log.contains_key("dev-alice-1"));
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_load_statement_gated_by_config() {
        let (ctx, executed) = run_context();
        let mut c = connection("dev", "alice", "1", 0, 10);
        c.transactions = vec![transaction(
            "dev",
            "alice",
            "1",
            "7",
            vec![query(0, 1, "copy t from 's3://bucket/data' csv")],
        )];
        let stats = ConnectionExecutor::new(ctx, c, None).run().await;

        // copy execution disabled: statement skipped, query still succeeds
        assert_eq!(stats.executed_queries, 0);
        assert_eq!(stats.query_success, 1);
        assert!(executed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_statement_split_wraps_in_explicit_block() {
        let (ctx, executed) = run_context();
        let mut c = connection("dev", "alice", "1", 0, 10);
        c.transactions = vec![transaction(
            "dev",
            "alice",
            "1",
            "7",
            vec![query(0, 1, "select 1; select 2")],
        )];
        let stats = ConnectionExecutor::new(ctx, c, None).run().await;

        assert_eq!(stats.multi_statements, 1);
        assert_eq!(stats.executed_queries, 4);
        let executed = executed.lock();
        assert!(executed[0].contains("begin;"), "{executed:?}");
        assert!(executed[3].contains("commit;"), "{executed:?}");
    }

    #[test]
    fn test_select_interface_from_application_tag() {
        assert_eq!(select_interface("psql", "odbc", true), Interface::Psql);
        assert_eq!(select_interface("ODBC app", "psql", true), Interface::Odbc);
        // odbc tag without a configured driver falls through to the default
        assert_eq!(select_interface("odbc app", "psql", false), Interface::Psql);
        // default odbc without a driver falls back with a warning
        assert_eq!(select_interface("other", "odbc", false), Interface::Psql);
        assert_eq!(select_interface("other", "odbc", true), Interface::Odbc);
        assert_eq!(select_interface("other", "psql", true), Interface::Psql);
    }

    #[test]
    fn test_effective_username_rewrites_federated() {
        assert_eq!(effective_username("IAM:alice", "admin"), "admin");
        assert_eq!(effective_username("IAMR:role", "admin"), "admin");
        assert_eq!(effective_username("alice", "admin"), "alice");
    }

    #[test]
    fn test_split_statements_respects_quotes() {
        let parts = split_statements("select 'a;b'; insert into t values (1);;");
        assert_eq!(parts, vec!["select 'a;b'", "insert into t values (1)"]);
    }

    #[test]
    fn test_split_statements_preserves_non_ascii_text() {
        let parts = split_statements("insert into t values ('héllo wörld'); select 'straße'");
        assert_eq!(
            parts,
            vec!["insert into t values ('héllo wörld')", "select 'straße'"]
        );
    }

    #[test]
    fn test_split_statements_respects_block_comments() {
        let parts = split_statements("select 1 /* a;b */; select 2");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], "select 2");
    }

    #[test]
    fn test_tag_statement_embeds_identifiers() {
        let tagged = tag_statement("select 1", "42", 3, "replay-x");
        assert!(tagged.starts_with("/* {\"xid\": \"42\", \"query_idx\": 3"));
        assert!(tagged.ends_with("select 1"));
        assert!(tagged.contains("\"replay\": \"replay-x\""));
    }

    #[test]
    fn test_redact_scrubs_secret() {
        assert_eq!(
            redact("auth failed for password hunter2", "hunter2"),
            "auth failed for password ***"
        );
        assert_eq!(redact("no secret", ""), "no secret");
    }
}

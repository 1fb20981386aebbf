//! Connection record parsing.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::error;

use crate::config::PacingOverride;
use crate::filters::{matches_filters, Filters};
use crate::model::{connection_key, ConnectionLog};
use crate::parse::parse_timestamp;
use crate::storage::{join_location, ObjectStore};

#[derive(Debug, Deserialize)]
struct RawConnection {
    session_initiation_time: Option<String>,
    disconnection_time: Option<String>,
    application_name: String,
    database_name: String,
    username: String,
    pid: serde_json::Value,
    time_interval_between_transactions: bool,
    time_interval_between_queries: bool,
}

/// Parse `connections.json`, apply the filters, and return the surviving
/// connections sorted by initiation time plus the pre-filter total.
pub async fn parse_connections(
    store: &dyn ObjectStore,
    workload_location: &str,
    transaction_pacing: PacingOverride,
    query_pacing: PacingOverride,
    filters: &Filters,
) -> Result<(Vec<ConnectionLog>, usize)> {
    let location = join_location(workload_location, "connections.json");
    let body = store.get(&location).await?;
    let raw: Vec<serde_json::Value> =
        serde_json::from_slice(&body).with_context(|| format!("parsing {location}"))?;

    let mut connections = Vec::new();
    let mut total_connections = 0;
    for entry in raw {
        match build_connection(&entry, transaction_pacing, query_pacing) {
            Ok(connection) => {
                if matches_filters(&connection, filters) {
                    connections.push(connection);
                }
                total_connections += 1;
            }
            Err(err) => {
                error!("Could not parse connection: {entry}\n{err}");
            }
        }
    }

    connections.sort_by_key(|c| c.initiation_or_epoch());
    Ok((connections, total_connections))
}

fn build_connection(
    entry: &serde_json::Value,
    transaction_pacing: PacingOverride,
    query_pacing: PacingOverride,
) -> Result<ConnectionLog> {
    let raw: RawConnection = serde_json::from_value(entry.clone())?;

    let session_initiation_time = match raw.session_initiation_time.as_deref() {
        Some("") | None => None,
        Some(ts) => Some(parse_timestamp(ts)?),
    };
    let disconnection_time = match raw.disconnection_time.as_deref() {
        Some("") | None => None,
        Some(ts) => Some(parse_timestamp(ts)?),
    };

    let pid = scalar_to_string(&raw.pid);
    Ok(ConnectionLog {
        session_initiation_time,
        disconnection_time,
        application_name: raw.application_name,
        connection_key: connection_key(&raw.database_name, &raw.username, &pid),
        database_name: raw.database_name,
        username: raw.username,
        pid,
        pace_transactions: transaction_pacing.resolve(raw.time_interval_between_transactions),
        pace_queries: query_pacing.resolve(raw.time_interval_between_queries),
        transactions: Vec::new(),
    })
}

/// Extract records carry pids and xids as either numbers or strings.
pub(crate) fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{validate_and_normalize_filters, FilterConfig};
    use crate::storage::MemoryStore;

    fn extract_json() -> &'static str {
        r#"[
            {"session_initiation_time": "2023-05-01T12:00:10+00:00",
             "disconnection_time": "2023-05-01T12:05:00+00:00",
             "application_name": "psql", "database_name": "dev",
             "username": "alice", "pid": 101,
             "time_interval_between_transactions": true,
             "time_interval_between_queries": true},
            {"session_initiation_time": "2023-05-01T12:00:00+00:00",
             "disconnection_time": null,
             "application_name": "odbc", "database_name": "dev",
             "username": "bob", "pid": "102",
             "time_interval_between_transactions": false,
             "time_interval_between_queries": false},
            {"broken": true}
        ]"#
    }

    #[tokio::test]
    async fn test_parse_sorts_and_counts() {
        let store = MemoryStore::new();
        store
            .put("wl/connections.json", extract_json().as_bytes())
            .await
            .unwrap();
        let filters =
            validate_and_normalize_filters::<ConnectionLog>(&FilterConfig::default()).unwrap();
        let (connections, total) = parse_connections(
            &store,
            "wl",
            PacingOverride::PerRecord,
            PacingOverride::PerRecord,
            &filters,
        )
        .await
        .unwrap();

        // broken record is skipped, valid ones sorted by initiation time
        assert_eq!(total, 2);
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].username, "bob");
        assert_eq!(connections[1].username, "alice");
        assert_eq!(connections[0].pid, "102");
        assert_eq!(connections[1].connection_key, "dev_alice_101");
        assert!(connections[1].pace_transactions);
        assert!(!connections[0].pace_transactions);
    }

    #[tokio::test]
    async fn test_pacing_override_forces_flags() {
        let store = MemoryStore::new();
        store
            .put("wl/connections.json", extract_json().as_bytes())
            .await
            .unwrap();
        let filters =
            validate_and_normalize_filters::<ConnectionLog>(&FilterConfig::default()).unwrap();
        let (connections, _) = parse_connections(
            &store,
            "wl",
            PacingOverride::AllOff,
            PacingOverride::AllOn,
            &filters,
        )
        .await
        .unwrap();
        assert!(connections.iter().all(|c| !c.pace_transactions));
        assert!(connections.iter().all(|c| c.pace_queries));
    }

    #[tokio::test]
    async fn test_filters_applied_pre_sort() {
        let store = MemoryStore::new();
        store
            .put("wl/connections.json", extract_json().as_bytes())
            .await
            .unwrap();
        let raw = FilterConfig {
            exclude: std::collections::HashMap::from([(
                "username".to_string(),
                vec!["bob".to_string()],
            )]),
            ..FilterConfig::default()
        };
        let filters = validate_and_normalize_filters::<ConnectionLog>(&raw).unwrap();
        let (connections, total) = parse_connections(
            &store,
            "wl",
            PacingOverride::PerRecord,
            PacingOverride::PerRecord,
            &filters,
        )
        .await
        .unwrap();
        assert_eq!(total, 2);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].username, "alice");
    }
}

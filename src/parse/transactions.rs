//! Transaction record parsing.
//!
//! Reads the compressed SQL extract and rebuilds [`Transaction`] values,
//! rewriting bulk-load sources, bulk-export destinations and generated
//! passwords in the query text as a side effect of parsing.

use anyhow::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::info;

use crate::config::ReplayConfig;
use crate::filters::{matches_filters, Filters};
use crate::model::{connection_key, Query, Transaction};
use crate::parse::connections::scalar_to_string;
use crate::parse::replacements::{parse_copy_replacements, CopyReplacements};
use crate::parse::{find_ci, parse_timestamp, replace_ci};
use crate::storage::{gunzip, join_location, ObjectStore};

#[derive(Debug, Deserialize)]
struct SqlExtract {
    transactions: std::collections::HashMap<String, RawTransaction>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    xid: serde_json::Value,
    pid: serde_json::Value,
    db: String,
    user: String,
    #[serde(default)]
    time_interval: serde_json::Value,
    queries: Vec<RawQuery>,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    record_time: String,
    start_time: Option<String>,
    end_time: Option<String>,
    text: String,
}

pub struct TransactionsParser<'a> {
    store: &'a dyn ObjectStore,
    filters: &'a Filters,
    workload_location: String,
    copy_enabled: bool,
    unload_enabled: bool,
    replay_output: Option<String>,
    unload_iam_role: Option<String>,
    replay_id: String,
}

impl<'a> TransactionsParser<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        config: &ReplayConfig,
        filters: &'a Filters,
        replay_id: &str,
    ) -> Self {
        Self {
            store,
            filters,
            workload_location: config.workload_location.clone(),
            copy_enabled: config.copy_enabled(),
            unload_enabled: config.unload_enabled(),
            replay_output: config.replay_output.clone(),
            unload_iam_role: config.unload_iam_role.clone(),
            replay_id: replay_id.to_string(),
        }
    }

    /// Parse `SQLs.json.gz`, returning filtered transactions sorted by
    /// (start time, xid).
    pub async fn parse_transactions(&self) -> Result<Vec<Transaction>> {
        let replacements = if self.copy_enabled {
            parse_copy_replacements(self.store, &self.workload_location).await?
        } else {
            CopyReplacements::new()
        };

        let location = join_location(&self.workload_location, "SQLs.json.gz");
        let compressed = self.store.get(&location).await?;
        let body = gunzip(&compressed)?;
        let extract: SqlExtract =
            serde_json::from_slice(&body).with_context(|| format!("parsing {location}"))?;

        let mut transactions = Vec::new();
        for raw in extract.transactions.into_values() {
            let transaction = self.build_transaction(raw, &replacements)?;
            if !transaction.queries.is_empty() && matches_filters(&transaction, self.filters) {
                transactions.push(transaction);
            }
        }

        transactions.sort_by(|a, b| {
            (a.start_time(), &a.xid).cmp(&(b.start_time(), &b.xid))
        });
        Ok(transactions)
    }

    fn build_transaction(
        &self,
        raw: RawTransaction,
        replacements: &CopyReplacements,
    ) -> Result<Transaction> {
        let mut queries = Vec::with_capacity(raw.queries.len());
        for q in raw.queries {
            let record_time = parse_timestamp(&q.record_time)?;
            let start_time = match q.start_time.as_deref() {
                Some(ts) if !ts.is_empty() => parse_timestamp(ts)?,
                _ => record_time,
            };
            let end_time = match q.end_time.as_deref() {
                Some(ts) if !ts.is_empty() => parse_timestamp(ts)?,
                _ => record_time,
            };

            let mut text = q.text;
            if self.copy_enabled
                && find_ci(&text, "copy ").is_some()
                && find_ci(&text, "from 's3:").is_some()
            {
                text = self.apply_copy_replacement(text, replacements)?;
            }
            if self.unload_enabled
                && find_ci(&text, "unload").is_some()
                && find_ci(&text, "to 's3:").is_some()
                && self.unload_iam_role.is_some()
                && self
                    .replay_output
                    .as_deref()
                    .is_some_and(|out| out.starts_with("s3://"))
            {
                text = self.apply_unload_replacement(text);
            }
            if find_ci(&text, "create user").is_some() {
                text = randomize_generated_password(&text);
            }

            queries.push(Query::new(start_time, end_time, text));
        }
        queries.sort_by_key(|q| q.start_time);

        let pid = scalar_to_string(&raw.pid);
        Ok(Transaction {
            time_interval: pacing_flag(&raw.time_interval),
            transaction_key: connection_key(&raw.db, &raw.user, &pid),
            database_name: raw.db,
            username: raw.user,
            pid,
            xid: scalar_to_string(&raw.xid),
            queries,
        })
    }

    fn apply_copy_replacement(
        &self,
        text: String,
        replacements: &CopyReplacements,
    ) -> Result<String> {
        let Some(existing) = quoted_location_after(&text, "from '") else {
            return Ok(text);
        };
        let Some((replacement, role)) = replacements.get(&existing) else {
            info!("No COPY replacement found for {existing}");
            return Ok(text);
        };
        if role.is_empty() {
            bail!(
                "COPY replacement {existing} is missing a credential role in \
                 copy_replacements.csv; add credentials or remove the replacement"
            );
        }
        let replacement = if replacement.is_empty() {
            existing.as_str()
        } else {
            replacement.as_str()
        };
        Ok(apply_credential_role(
            &text.replace(&existing, replacement),
            role,
        ))
    }

    fn apply_unload_replacement(&self, text: String) -> String {
        let Some(existing) = quoted_location_after(&text, "to '") else {
            return text;
        };
        let Some(path) = existing.strip_prefix("s3://") else {
            return text;
        };
        let output = self.replay_output.as_deref().unwrap_or_default();
        let role = self.unload_iam_role.as_deref().unwrap_or_default();
        let replacement = format!("{}/{}/UNLOADs/{}", output, self.replay_id, path);
        if replacement == existing {
            return text;
        }
        apply_credential_role(&text.replace(&existing, &replacement), role)
    }
}

fn pacing_flag(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Extract the quoted `s3://...` location following a case-insensitive
/// marker like `from '` or `to '`.
fn quoted_location_after(text: &str, marker: &str) -> Option<String> {
    let start = find_ci(text, &format!("{marker}s3:"))? + marker.len();
    let end = text[start..].find('\'')? + start;
    Some(text[start..end].to_string())
}

/// Patch the credential clause variants to carry the replacement role.
fn apply_credential_role(text: &str, role: &str) -> String {
    let mut out = replace_arn_role(text, role);
    let replacement = format!(" IAM_ROLE '{role}'");
    for pattern in [
        "credentials ''",
        "with credentials as ''",
        "IAM_ROLE ''",
        "ACCESS_KEY_ID '' SECRET_ACCESS_KEY '' SESSION_TOKEN ''",
        "ACCESS_KEY_ID '' SECRET_ACCESS_KEY ''",
    ] {
        out = replace_ci(&out, pattern, &replacement);
    }
    out
}

/// Replace `IAM_ROLE 'arn:aws:iam::...'` clauses with the given role.
fn replace_arn_role(text: &str, role: &str) -> String {
    let marker = "iam_role 'arn:aws:iam::";
    let mut out = String::with_capacity(text.len());
    let mut remaining = text;
    while let Some(pos) = find_ci(remaining, marker) {
        let value_start = pos + "iam_role '".len();
        let Some(quote) = remaining[value_start..].find('\'') else {
            break;
        };
        out.push_str(&remaining[..pos]);
        out.push_str(&format!("IAM_ROLE '{role}'"));
        remaining = &remaining[value_start + quote + 1..];
    }
    out.push_str(remaining);
    out
}

/// `CREATE USER` statements are captured with a redacted password; replay
/// with a generated one that satisfies complexity rules.
fn randomize_generated_password(text: &str) -> String {
    let generated: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(61)
        .map(char::from)
        .collect();
    replace_ci(text, "password '***'", &format!("PASSWORD '{generated}aA0'"))
}

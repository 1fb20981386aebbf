//! Extract Parsing
//!
//! Readers for the captured workload layout: `connections.json`,
//! `SQLs.json.gz` and the optional `copy_replacements.csv`, all accessed
//! through the uniform storage capability.

pub mod connections;
pub mod replacements;
pub mod transactions;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::model::Timestamp;

/// Parse an extract timestamp: RFC 3339, or a naive ISO timestamp taken as
/// UTC (audit logs omit the offset).
pub fn parse_timestamp(raw: &str) -> Result<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(anyhow::anyhow!("unparseable timestamp {raw:?}"))
        .context("extract timestamp")
}

/// Case-insensitive substring search.
pub(crate) fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .to_ascii_lowercase()
        .find(&needle.to_ascii_lowercase())
}

/// Replace every case-insensitive occurrence of `pattern` with `replacement`.
pub(crate) fn replace_ci(text: &str, pattern: &str, replacement: &str) -> String {
    let lower_text = text.to_ascii_lowercase();
    let lower_pattern = pattern.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(pos) = lower_text[cursor..].find(&lower_pattern) {
        let start = cursor + pos;
        out.push_str(&text[cursor..start]);
        out.push_str(replacement);
        cursor = start + pattern.len();
    }
    out.push_str(&text[cursor..]);
    out
}

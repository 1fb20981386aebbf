//! COPY replacement map parsing.
//!
//! `copy_replacements.csv` maps original bulk-load source locations to the
//! locations (and credential role) to use during replay. Three columns,
//! header row skipped. A malformed file is fatal: silently replaying with
//! wrong sources would invalidate the run.

use std::collections::HashMap;

use anyhow::{bail, Result};
use tracing::info;

use crate::storage::{join_location, ObjectStore};

/// (replacement location, credential role) keyed by original location.
pub type CopyReplacements = HashMap<String, (String, String)>;

pub async fn parse_copy_replacements(
    store: &dyn ObjectStore,
    workload_location: &str,
) -> Result<CopyReplacements> {
    let location = join_location(workload_location, "copy_replacements.csv");
    let body = store.get(&location).await?;
    let text = String::from_utf8_lossy(&body);

    let mut replacements = CopyReplacements::new();
    for (idx, line) in text.lines().enumerate() {
        if idx == 0 || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            bail!("replacements file {location} is malformed (row {idx}, line: {line:?})");
        }
        replacements.insert(
            fields[0].to_string(),
            (fields[1].to_string(), fields[2].to_string()),
        );
    }

    info!(
        "Loaded {} COPY replacements from {location}",
        replacements.len()
    );
    Ok(replacements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_parse_skips_header() {
        let store = MemoryStore::new();
        store
            .put(
                "wl/copy_replacements.csv",
                b"original,replacement,role\n\
                  s3://old/data,s3://new/data,arn:aws:iam::1:role/replay\n",
            )
            .await
            .unwrap();
        let replacements = parse_copy_replacements(&store, "wl").await.unwrap();
        assert_eq!(replacements.len(), 1);
        assert_eq!(
            replacements["s3://old/data"],
            (
                "s3://new/data".to_string(),
                "arn:aws:iam::1:role/replay".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_malformed_row_is_fatal() {
        let store = MemoryStore::new();
        store
            .put(
                "wl/copy_replacements.csv",
                b"original,replacement,role\nonly-two,fields\n",
            )
            .await
            .unwrap();
        assert!(parse_copy_replacements(&store, "wl").await.is_err());
    }
}

//! Replay Configuration
//!
//! YAML-backed configuration for a replay run. Loading fills defaults;
//! `validate` checks the fields the replay engine consumes.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::filters::FilterConfig;

/// Pacing override for recorded time intervals: honor each record's own
/// flag, or force pacing on/off for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingOverride {
    #[default]
    PerRecord,
    AllOn,
    AllOff,
}

impl PacingOverride {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "" => Ok(Self::PerRecord),
            "all on" => Ok(Self::AllOn),
            "all off" => Ok(Self::AllOff),
            other => bail!("invalid pacing override {other:?} (expected \"\", \"all on\" or \"all off\")"),
        }
    }

    /// Resolve against the flag recorded on an individual record.
    pub fn resolve(self, record_flag: bool) -> bool {
        match self {
            Self::PerRecord => record_flag,
            Self::AllOn => true,
            Self::AllOff => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Directory or object-storage prefix holding the extracted workload.
    pub workload_location: String,
    /// `<name>.<id>.<region>.<service>(-serverless)?.<domain>:<port>/<database>`
    pub target_cluster_endpoint: String,
    pub target_cluster_region: String,
    /// Administrative username; federated users are rewritten to this.
    pub master_username: String,
    /// Password for the in-tree static credential source, if used.
    pub master_password: Option<String>,
    /// ODBC DSN for the secondary interface. None disables it.
    pub odbc_driver: Option<String>,
    /// "psql" or "odbc".
    pub default_interface: String,
    /// "", "all on" or "all off".
    pub time_interval_between_transactions: String,
    /// "", "all on" or "all off".
    pub time_interval_between_queries: String,
    /// "true" to execute statements loading from external bulk sources.
    pub execute_copy_statements: String,
    /// "true" to execute statements exporting to external bulk destinations.
    pub execute_unload_statements: String,
    /// Object-storage URL for replay output; required for unload execution.
    pub replay_output: Option<String>,
    /// Credential role patched into rewritten UNLOAD statements.
    pub unload_iam_role: Option<String>,
    /// Where error files are written; defaults to workload_location.
    pub error_location: Option<String>,
    pub limit_concurrent_connections: Option<usize>,
    pub connection_tolerance_sec: f64,
    pub empty_queue_timeout_sec: f64,
    pub num_workers: Option<usize>,
    pub split_multi: bool,
    /// Secret-store entry holding admin credentials for serverless targets.
    pub secret_name: Option<String>,
    /// NAT/load-balancer host override for serverless targets.
    pub nlb_nat_dns: Option<String>,
    pub tag: String,
    pub log_level: String,
    pub filters: FilterConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            workload_location: String::new(),
            target_cluster_endpoint: String::new(),
            target_cluster_region: String::new(),
            master_username: String::new(),
            master_password: None,
            odbc_driver: None,
            default_interface: "psql".to_string(),
            time_interval_between_transactions: String::new(),
            time_interval_between_queries: String::new(),
            execute_copy_statements: "false".to_string(),
            execute_unload_statements: "false".to_string(),
            replay_output: None,
            unload_iam_role: None,
            error_location: None,
            limit_concurrent_connections: None,
            connection_tolerance_sec: 300.0,
            empty_queue_timeout_sec: 120.0,
            num_workers: None,
            split_multi: true,
            secret_name: None,
            nlb_nat_dns: None,
            tag: String::new(),
            log_level: "info".to_string(),
            filters: FilterConfig::default(),
        }
    }
}

impl ReplayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workload_location.is_empty() {
            bail!("workload_location is required");
        }
        if self.target_cluster_endpoint.is_empty() {
            bail!("target_cluster_endpoint is required");
        }
        if !self.target_cluster_endpoint.contains(':')
            || !self.target_cluster_endpoint.contains('/')
        {
            bail!(
                "target_cluster_endpoint must look like <host>:<port>/<database>, got {:?}",
                self.target_cluster_endpoint
            );
        }
        if !matches!(self.default_interface.as_str(), "psql" | "odbc") {
            bail!(
                "default_interface must be psql or odbc, got {:?}",
                self.default_interface
            );
        }
        PacingOverride::parse(&self.time_interval_between_transactions)
            .context("time_interval_between_transactions")?;
        PacingOverride::parse(&self.time_interval_between_queries)
            .context("time_interval_between_queries")?;
        for (name, value) in [
            ("execute_copy_statements", &self.execute_copy_statements),
            ("execute_unload_statements", &self.execute_unload_statements),
        ] {
            if !matches!(value.as_str(), "true" | "false") {
                bail!("{name} must be \"true\" or \"false\", got {value:?}");
            }
        }
        if self.unload_enabled() && self.replay_output.is_none() {
            bail!("replay_output is required when execute_unload_statements is enabled");
        }
        Ok(())
    }

    pub fn copy_enabled(&self) -> bool {
        self.execute_copy_statements.eq_ignore_ascii_case("true")
    }

    pub fn unload_enabled(&self) -> bool {
        self.execute_unload_statements.eq_ignore_ascii_case("true")
    }

    pub fn transaction_pacing(&self) -> PacingOverride {
        PacingOverride::parse(&self.time_interval_between_transactions)
            .unwrap_or(PacingOverride::PerRecord)
    }

    pub fn query_pacing(&self) -> PacingOverride {
        PacingOverride::parse(&self.time_interval_between_queries).unwrap_or(PacingOverride::PerRecord)
    }

    pub fn error_location(&self) -> &str {
        self.error_location
            .as_deref()
            .unwrap_or(&self.workload_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ReplayConfig {
        ReplayConfig {
            workload_location: "/tmp/extract".to_string(),
            target_cluster_endpoint:
                "target.abc123.us-east-1.redshift.amazonaws.com:5439/dev".to_string(),
            target_cluster_region: "us-east-1".to_string(),
            master_username: "admin".to_string(),
            ..ReplayConfig::default()
        }
    }

    #[test]
    fn test_pacing_override_parse_and_resolve() {
        assert_eq!(PacingOverride::parse("").unwrap(), PacingOverride::PerRecord);
        assert_eq!(PacingOverride::parse("all on").unwrap(), PacingOverride::AllOn);
        assert_eq!(PacingOverride::parse("all off").unwrap(), PacingOverride::AllOff);
        assert!(PacingOverride::parse("sometimes").is_err());

        assert!(PacingOverride::PerRecord.resolve(true));
        assert!(!PacingOverride::PerRecord.resolve(false));
        assert!(PacingOverride::AllOn.resolve(false));
        assert!(!PacingOverride::AllOff.resolve(true));
    }

    #[test]
    fn test_validate_accepts_baseline() {
        base_config().validate().unwrap();
    }

    #[test]
    fn test_unload_requires_replay_output() {
        let mut config = base_config();
        config.execute_unload_statements = "true".to_string();
        assert!(config.validate().is_err());
        config.replay_output = Some("s3://bucket/replays".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_interface_rejected() {
        let mut config = base_config();
        config.default_interface = "jdbc".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_error_location_defaults_to_workload() {
        let mut config = base_config();
        assert_eq!(config.error_location(), "/tmp/extract");
        config.error_location = Some("/tmp/errors".to_string());
        assert_eq!(config.error_location(), "/tmp/errors");
    }
}

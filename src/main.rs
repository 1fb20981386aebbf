//! Workload Replicator
//!
//! Replays a captured database client workload against a target cluster,
//! reproducing original relative timing and ordering.
//!
//! Usage:
//!   replicator --config replay.yaml

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use workload_replicator::config::ReplayConfig;
use workload_replicator::coordinator::Replayer;
use workload_replicator::correlate::correlate;
use workload_replicator::credentials::{
    ClusterTarget, CredentialProvider, ProviderSettings, StaticIssuer,
};
use workload_replicator::driver::PgDriver;
use workload_replicator::executor::{effective_username, RunContext};
use workload_replicator::model::Timestamp;
use workload_replicator::stats::ReplayStats;
use workload_replicator::storage::open_store;
use workload_replicator::summary::{export_errors, export_query_timings, summarize};

#[derive(Parser, Debug)]
#[command(name = "replicator")]
#[command(about = "Replay a captured database workload against a target cluster")]
struct Args {
    /// Path to the replay configuration file
    #[arg(long, env = "REPLAY_CONFIG", default_value = "replay.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ReplayConfig::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let replay_start = Utc::now();
    let target = ClusterTarget::parse(&config.target_cluster_endpoint)?;
    let replay_id = make_replay_id(replay_start, &target.cluster_id, &config.tag);
    info!("Replay id: {replay_id}");

    let config = Arc::new(config);
    let settings = ProviderSettings {
        target_cluster_endpoint: config.target_cluster_endpoint.clone(),
        target_cluster_region: config.target_cluster_region.clone(),
        odbc_driver: config.odbc_driver.clone(),
        secret_name: config.secret_name.clone(),
        nlb_nat_dns: config.nlb_nat_dns.clone(),
    };
    let issuer = Arc::new(StaticIssuer {
        username: config.master_username.clone(),
        password: config.master_password.clone().unwrap_or_default(),
    });
    let credentials = Arc::new(CredentialProvider::new(settings, issuer, None));

    let workload_store = open_store(&config.workload_location)?;
    let workload = correlate(workload_store.as_ref(), &config, &config.filters, &replay_id).await?;
    if workload.connections.is_empty() {
        warn!("Nothing to replay: no connections survived parsing and filtering");
        return Ok(());
    }

    // Pre-flight: one credential attempt for the first connection's user;
    // failure here aborts the run before any work is enqueued.
    let preflight_user = effective_username(
        &workload.connections[0].username,
        &config.master_username,
    );
    credentials
        .get_credentials(&preflight_user, None, 1, true)
        .await
        .with_context(|| format!("pre-flight credential check failed for {preflight_user}"))?;

    let first_event_time = workload.first_event_time.unwrap_or(replay_start);
    let ctx = Arc::new(RunContext {
        config: config.clone(),
        replay_id: replay_id.clone(),
        replay_start,
        first_event_time,
        driver: Arc::new(PgDriver),
        credentials,
        live_connections: Arc::new(AtomicUsize::new(0)),
        peak_connections: Arc::new(AtomicUsize::new(0)),
        error_list: Arc::new(parking_lot::Mutex::new(Vec::new())),
    });

    let connections = workload.connections.clone();
    let replayed_connections = connections.len();
    let total_queries = workload.query_count;
    let per_worker = Replayer::new(ctx.clone())
        .start_replay(connections, total_queries)
        .await?;

    let mut total = ReplayStats::default();
    for stats in &per_worker {
        total.collect(stats);
    }

    let error_store = open_store(config.error_location())?;
    export_errors(&total, error_store.as_ref(), config.error_location(), &replay_id).await?;
    export_query_timings(
        &per_worker,
        error_store.as_ref(),
        config.error_location(),
        &replay_id,
    )
    .await?;
    let sql_errors = ctx.error_list.lock().clone();
    if !sql_errors.is_empty() {
        let body = serde_json::to_vec_pretty(&sql_errors)?;
        let location = format!("{}/{replay_id}/sql_errors.json", config.error_location());
        error_store.put(&location, &body).await?;
        error!("{} statements failed; details in {location}", sql_errors.len());
    }

    for line in summarize(
        &total,
        &workload,
        replayed_connections,
        Utc::now() - replay_start,
    ) {
        info!("{line}");
    }
    Ok(())
}

/// `<start>_<cluster-id>[_<tag>]_<hash>`: sortable, names the target, and
/// unique even for runs started in the same second.
fn make_replay_id(start: Timestamp, cluster_id: &str, tag: &str) -> String {
    let base = if tag.is_empty() {
        format!("{}_{}", start.format("%Y-%m-%dT%H-%M-%S"), cluster_id)
    } else {
        format!("{}_{}_{}", start.format("%Y-%m-%dT%H-%M-%S"), cluster_id, tag)
    };
    let digest = Sha256::digest(format!("{base}_{}", start.timestamp_micros()).as_bytes());
    format!("{base}_{}", &hex::encode(digest)[..5])
}

//! Workload Replicator Library
//!
//! Replays a captured database client workload (connections, transactions,
//! queries) against a target cluster, reproducing original relative timing
//! and per-connection/per-transaction/per-query ordering.

pub mod config;
pub mod coordinator;
pub mod correlate;
pub mod credentials;
pub mod driver;
pub mod executor;
pub mod filters;
pub mod model;
pub mod parse;
pub mod stats;
pub mod storage;
pub mod summary;
pub mod worker;

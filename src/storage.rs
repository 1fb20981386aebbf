//! Workload Storage
//!
//! Uniform read/write capability over the locations the replay touches:
//! local filesystem paths or object-storage URLs (`s3://bucket/prefix`).
//! The local backend lives here; an object-storage backend is supplied by
//! the hosting environment through the same trait.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use parking_lot::Mutex;

/// Read/write access to workload and output locations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, location: &str) -> Result<Vec<u8>>;
    async fn put(&self, location: &str, body: &[u8]) -> Result<()>;
}

/// Local filesystem backend.
pub struct LocalStore;

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        tokio::fs::read(location)
            .await
            .with_context(|| format!("reading {location}"))
    }

    async fn put(&self, location: &str, body: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(location).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(location, body)
            .await
            .with_context(|| format!("writing {location}"))
    }
}

/// In-memory backend, standing in for object storage in tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, location: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(location)
            .cloned()
            .with_context(|| format!("no object at {location}"))
    }

    async fn put(&self, location: &str, body: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .insert(location.to_string(), body.to_vec());
        Ok(())
    }
}

/// True when a location refers to object storage rather than the local
/// filesystem.
pub fn is_object_url(location: &str) -> bool {
    location.starts_with("s3://")
}

/// Split an object-storage URL into (bucket, prefix). The prefix has no
/// leading slash and may be empty.
pub fn bucket_parts(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .with_context(|| format!("not an object-storage url: {url}"))?;
    match rest.split_once('/') {
        Some((bucket, prefix)) => Ok((bucket.to_string(), prefix.to_string())),
        None => Ok((rest.to_string(), String::new())),
    }
}

/// Open the backend appropriate for a location. Object-storage locations
/// require a store injected by the hosting environment.
pub fn open_store(location: &str) -> Result<Box<dyn ObjectStore>> {
    if is_object_url(location) {
        bail!(
            "object-storage location {location} requires an external store; \
             only local paths are served in-process"
        );
    }
    Ok(Box::new(LocalStore))
}

/// Decode a gzip-compressed byte buffer.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("decoding gzip stream")?;
    Ok(out)
}

/// Join a location and a relative key with exactly one separator.
pub fn join_location(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

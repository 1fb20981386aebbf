//! Credential Provider
//!
//! Fetches, caches and retries target-cluster credentials. Two sources are
//! supported: a secret store holding admin credentials (serverless targets)
//! and a managed per-user credential-issuance capability. Both are traits;
//! the hosting environment supplies the cloud-backed implementations, and a
//! static source is available for fixed-password targets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// How long issued credentials are valid for.
const CREDENTIALS_DURATION_SECS: u64 = 3600;
/// Delay between issuance attempts.
const RETRY_DELAY: Duration = Duration::from_secs(10);
/// How long cached credentials are reused per user.
const CACHE_TTL: Duration = Duration::from_secs(1800);

const SERVERLESS_ID_PREFIX: &str = "redshift-serverless-";

/// Resolved credentials bundle for opening a target connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Connection-string variant for the secondary (ODBC) interface.
    pub odbc_url: String,
}

/// Failure to resolve credentials.
#[derive(Debug, Clone)]
pub enum CredentialsError {
    /// Unrecoverable: the run must abort (cluster not found, expired token,
    /// malformed secret).
    Fatal(String),
    /// All issuance attempts were exhausted.
    Exhausted { username: String, attempts: u32 },
    /// The issuance API failed in a way worth propagating.
    Api(String),
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal(msg) => write!(f, "fatal credential failure: {msg}"),
            Self::Exhausted { username, attempts } => write!(
                f,
                "failed to retrieve credentials for {username} after {attempts} attempts"
            ),
            Self::Api(msg) => write!(f, "credential api error: {msg}"),
        }
    }
}

impl std::error::Error for CredentialsError {}

impl CredentialsError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Response from the issuance capability. A missing password is treated as
/// transient and retried.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub db_user: String,
    pub db_password: Option<String>,
}

/// Errors the issuance capability can report.
#[derive(Debug, Clone)]
pub enum IssueError {
    ClusterNotFound(String),
    ExpiredToken,
    NoCredentials,
    Api(String),
}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClusterNotFound(id) => write!(f, "cluster {id} not found"),
            Self::ExpiredToken => write!(f, "credentials token has expired"),
            Self::NoCredentials => write!(f, "no credentials found"),
            Self::Api(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for IssueError {}

/// Managed per-user credential issuance (cloud capability).
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn get_cluster_credentials(
        &self,
        username: &str,
        cluster_id: &str,
        duration_secs: u64,
        auto_create: bool,
    ) -> Result<IssuedCredentials, IssueError>;
}

/// Named-secret lookup (cloud capability).
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str, region: &str) -> Result<HashMap<String, String>>;
}

/// Issues the configured administrative credentials for every user. Useful
/// against targets with a fixed password and in tests.
pub struct StaticIssuer {
    pub username: String,
    pub password: String,
}

#[async_trait]
impl CredentialIssuer for StaticIssuer {
    async fn get_cluster_credentials(
        &self,
        _username: &str,
        _cluster_id: &str,
        _duration_secs: u64,
        _auto_create: bool,
    ) -> Result<IssuedCredentials, IssueError> {
        Ok(IssuedCredentials {
            db_user: self.username.clone(),
            db_password: Some(self.password.clone()),
        })
    }
}

/// Parsed pieces of the target cluster endpoint:
/// `<name>.<id>.<region>.<service>(-serverless)?.<domain>:<port>/<database>`.
#[derive(Debug, Clone)]
pub struct ClusterTarget {
    pub cluster_id: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub serverless: bool,
}

impl ClusterTarget {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let (host, rest) = endpoint
            .split_once(':')
            .with_context(|| format!("endpoint {endpoint:?} is missing a port"))?;
        let (port, database) = rest
            .split_once('/')
            .with_context(|| format!("endpoint {endpoint:?} is missing a database"))?;
        let cluster_id = host
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            cluster_id,
            host: host.to_string(),
            port: port
                .parse()
                .with_context(|| format!("invalid port in endpoint {endpoint:?}"))?,
            database: database.to_string(),
            serverless: host.contains(".redshift-serverless"),
        })
    }
}

struct CacheEntry {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Settings the provider needs from the run configuration.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub target_cluster_endpoint: String,
    pub target_cluster_region: String,
    pub odbc_driver: Option<String>,
    pub secret_name: Option<String>,
    pub nlb_nat_dns: Option<String>,
}

/// Fetches and caches per-user credentials for the target cluster.
pub struct CredentialProvider {
    settings: ProviderSettings,
    issuer: Arc<dyn CredentialIssuer>,
    secrets: Option<Arc<dyn SecretStore>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    retry_delay: Duration,
}

impl CredentialProvider {
    pub fn new(
        settings: ProviderSettings,
        issuer: Arc<dyn CredentialIssuer>,
        secrets: Option<Arc<dyn SecretStore>>,
    ) -> Self {
        Self {
            settings,
            issuer,
            secrets,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: CACHE_TTL,
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_timing(mut self, cache_ttl: Duration, retry_delay: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self.retry_delay = retry_delay;
        self
    }

    /// Resolve credentials for a user, consulting the cache first.
    pub async fn get_credentials(
        &self,
        username: &str,
        database: Option<&str>,
        max_attempts: u32,
        skip_cache: bool,
    ) -> Result<Credentials, CredentialsError> {
        if !skip_cache {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(username) {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    debug!(username, "using credentials from cache");
                    return Ok(entry.credentials.clone());
                }
                cache.remove(username);
            }
        }

        let target = ClusterTarget::parse(&self.settings.target_cluster_endpoint)
            .map_err(|e| CredentialsError::Fatal(e.to_string()))?;

        // NAT/load-balancer override applies to serverless targets only.
        let host = match (&self.settings.nlb_nat_dns, target.serverless) {
            (Some(nlb), true) => nlb.clone(),
            _ => target.host.clone(),
        };
        let database = database.unwrap_or(&target.database);

        let issued = if target.serverless && self.settings.secret_name.is_some() {
            self.fetch_from_secret().await?
        } else {
            let cluster_id = if target.serverless {
                format!("{SERVERLESS_ID_PREFIX}{}", target.cluster_id)
            } else {
                target.cluster_id.clone()
            };
            self.fetch_with_retry(username, &cluster_id, max_attempts)
                .await?
        };

        let password = issued.db_password.ok_or_else(|| CredentialsError::Exhausted {
            username: username.to_string(),
            attempts: max_attempts,
        })?;

        // The ODBC variant wants the bare user without any provider prefix.
        let odbc_user = issued
            .db_user
            .split_once(':')
            .map(|(_, user)| user)
            .unwrap_or(&issued.db_user);
        let odbc_url = format!(
            "Driver={}; Server={}; Database={}; IAM=1; DbUser={}; DbPassword={}; Port={}",
            self.settings.odbc_driver.as_deref().unwrap_or_default(),
            host,
            database,
            odbc_user,
            password,
            target.port,
        );

        let credentials = Credentials {
            username: issued.db_user,
            password,
            host,
            port: target.port,
            database: database.to_string(),
            odbc_url,
        };
        debug!(username, "retrieved database credentials");
        self.cache.lock().insert(
            username.to_string(),
            CacheEntry {
                credentials: credentials.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(credentials)
    }

    async fn fetch_from_secret(&self) -> Result<IssuedCredentials, CredentialsError> {
        let name = self.settings.secret_name.as_deref().unwrap_or_default();
        let store = self
            .secrets
            .as_ref()
            .ok_or_else(|| CredentialsError::Fatal("no secret store configured".to_string()))?;
        info!(secret = name, "fetching admin credentials from secret store");
        let secret = store
            .get_secret(name, &self.settings.target_cluster_region)
            .await
            .map_err(|e| CredentialsError::Api(e.to_string()))?;
        match (secret.get("admin_username"), secret.get("admin_password")) {
            (Some(user), Some(password)) => Ok(IssuedCredentials {
                db_user: user.clone(),
                db_password: Some(password.clone()),
            }),
            _ => Err(CredentialsError::Fatal(format!(
                "secret {name} is missing required keys admin_username/admin_password"
            ))),
        }
    }

    async fn fetch_with_retry(
        &self,
        username: &str,
        cluster_id: &str,
        max_attempts: u32,
    ) -> Result<IssuedCredentials, CredentialsError> {
        for attempt in 1..=max_attempts {
            let response = self
                .issuer
                .get_cluster_credentials(username, cluster_id, CREDENTIALS_DURATION_SECS, false)
                .await;
            match response {
                Ok(issued) if issued.db_password.is_some() => return Ok(issued),
                Ok(_) => {
                    warn!(
                        username,
                        attempt, max_attempts, "credential response had no password"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(IssueError::ExpiredToken) => {
                    return Err(CredentialsError::Fatal(format!(
                        "error retrieving credentials for {cluster_id}: token has expired"
                    )));
                }
                Err(IssueError::ClusterNotFound(id)) => {
                    return Err(CredentialsError::Fatal(format!(
                        "cluster {id} not found; confirm cluster endpoint, account and region"
                    )));
                }
                Err(IssueError::NoCredentials) => {
                    return Err(CredentialsError::Api("no credentials found".to_string()));
                }
                Err(IssueError::Api(msg)) => {
                    return Err(CredentialsError::Api(msg));
                }
            }
        }
        Err(CredentialsError::Exhausted {
            username: username.to_string(),
            attempts: max_attempts,
        })
    }
}

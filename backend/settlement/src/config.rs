//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{Result, SettlementError};

/// How verification status is resolved for a set of contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverStrategy {
    /// One status query per contribution.
    PerContribution,
    /// Bulk status queries, falling back to per-id checks on failure.
    Batched,
}

/// Which contribution listing feeds a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileScope {
    /// One contribution fetch per fundraiser.
    PerFundraiser,
    /// One owner-wide contribution fetch, grouped locally.
    Owner,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// REST backend base URL (e.g. http://localhost:8080)
    pub backend_url: String,
    /// Path to the local SQLite database file
    pub database_url: String,
    /// Port for the local REST API
    pub api_port: u16,
    /// Token to seed the session with on startup
    pub session_token: Option<String>,
    pub request_timeout: Duration,
    /// Retry budget for idempotent reads
    pub max_retries: u32,
    /// Initial retry back-off; doubled on each attempt
    pub retry_backoff: Duration,
    pub resolver_strategy: ResolverStrategy,
    /// Maximum in-flight status checks per pass
    pub resolver_concurrency: usize,
    /// Contribution ids per bulk status request
    pub resolver_batch_size: usize,
    pub reconcile_scope: ReconcileScope,
    /// Periodic background refresh; `None` when disabled
    pub refresh_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: "http://localhost:8080".to_string(),
            database_url: "sqlite:./settlement.db".to_string(),
            api_port: 3002,
            session_token: None,
            request_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            resolver_strategy: ResolverStrategy::PerContribution,
            resolver_concurrency: 8,
            resolver_batch_size: 100,
            reconcile_scope: ReconcileScope::PerFundraiser,
            refresh_interval: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let resolver_concurrency: usize = parse_or(&get, "RESOLVER_CONCURRENCY", defaults.resolver_concurrency)?;
        if resolver_concurrency == 0 {
            return Err(SettlementError::Config("RESOLVER_CONCURRENCY must be at least 1".to_string()));
        }
        let resolver_batch_size: usize = parse_or(&get, "RESOLVER_BATCH_SIZE", defaults.resolver_batch_size)?;
        if resolver_batch_size == 0 {
            return Err(SettlementError::Config("RESOLVER_BATCH_SIZE must be at least 1".to_string()));
        }

        let refresh_secs: u64 = parse_or(&get, "REFRESH_INTERVAL_SECS", 0)?;

        Ok(Config {
            backend_url: get("BACKEND_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.backend_url),
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            api_port: parse_or(&get, "API_PORT", defaults.api_port)?,
            session_token: get("SESSION_TOKEN"),
            request_timeout: Duration::from_secs(parse_or(&get, "REQUEST_TIMEOUT_SECS", 15)?),
            max_retries: parse_or(&get, "MAX_RETRIES", defaults.max_retries)?,
            retry_backoff: Duration::from_millis(parse_or(&get, "RETRY_BACKOFF_MS", 500)?),
            resolver_strategy: match get("RESOLVER_STRATEGY").as_deref() {
                None | Some("per_contribution") => ResolverStrategy::PerContribution,
                Some("batched") => ResolverStrategy::Batched,
                Some(other) => {
                    return Err(SettlementError::Config(format!("Invalid RESOLVER_STRATEGY: {other}")))
                }
            },
            resolver_concurrency,
            resolver_batch_size,
            reconcile_scope: match get("RECONCILE_SCOPE").as_deref() {
                None | Some("per_fundraiser") => ReconcileScope::PerFundraiser,
                Some("owner") => ReconcileScope::Owner,
                Some(other) => {
                    return Err(SettlementError::Config(format!("Invalid RECONCILE_SCOPE: {other}")))
                }
            },
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SettlementError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}

//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};

/// Top-level catalog configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Database connection settings.
    pub database: DatabaseConfig,
    /// Operational limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Result cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Database connection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over individual parameters.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Prefer env vars over storing the password in config files.
    pub password: Option<String>,
    pub database: Option<String>,
    pub ssl_mode: Option<PgSslMode>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Statement timeout; long-running statements are cancelled server-side.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
            ssl_mode: None,
            max_connections: default_max_connections(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

/// Operational limits for queries and bulk mutations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Bound on transparent retries of transient transaction conflicts.
    #[serde(default = "default_max_txn_retries")]
    pub max_txn_retries: u32,
    /// Rows per staging batch during bulk mutation. Each batch is one
    /// transaction; this is the effective atomicity granularity for inputs
    /// larger than one batch.
    #[serde(default = "default_bulk_batch_rows")]
    pub bulk_batch_rows: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_txn_retries: default_max_txn_retries(),
            bulk_batch_rows: default_bulk_batch_rows(),
        }
    }
}

/// Result cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries untouched for longer than this are evicted on access. Purely
    /// a memory bound; staleness is always rechecked against txids anyway.
    #[serde(default = "default_cache_staleness_secs")]
    pub staleness_secs: u64,
    /// Upper bound on entries per cache.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_cache_staleness_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_max_txn_retries() -> u32 {
    4
}

fn default_bulk_batch_rows() -> usize {
    5000
}

fn default_cache_staleness_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1024
}

impl DatabaseConfig {
    /// Validate connection configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_none() && (self.host.is_none() || self.database.is_none()) {
            return Err("database config requires either 'url' or 'host' + 'database'".to_string());
        }
        Ok(())
    }
}

//! ClickHouse client configuration and pooling
//!
//! Provides a unified way to configure ClickHouse clients from the environment
//! and share a fixed number of them across concurrent writers.
//!
//! # Example
//! ```ignore
//! use ch_pool::{ChConfig, create_pool};
//!
//! let config = ChConfig::from_env("CLICKHOUSE_EDW")?;
//! config.log_config();
//! let pool = create_pool(&config, |client| client)?;
//! let client = pool.acquire().await?;
//! ```

mod env_utils;
mod metrics;
mod pool;

pub use env_utils::{env_string_or, parse_env_with_default, prefixed_key};
pub use pool::{ClientPool, PooledClient};

use clickhouse::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out after {waited:?} waiting for a client from pool '{pool}'")]
    Timeout { pool: String, waited: Duration },

    #[error("pool '{pool}' is closed")]
    Closed { pool: String },

    #[error("pool '{pool}' has no clients")]
    Empty { pool: String },

    #[error("invalid ClickHouse configuration: {0}")]
    Config(String),
}

/// ClickHouse connection settings for one cluster
#[derive(Clone)]
pub struct ChConfig {
    /// Name used for metrics labels and logs
    pub name: String,
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Server-side `max_execution_time`, 0 disables the limit
    pub query_timeout_ms: u64,
    /// How long a writer waits for a free client
    pub acquire_timeout_secs: u64,
    pub pool_size: usize,
}

impl std::fmt::Debug for ChConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl Default for ChConfig {
    fn default() -> Self {
        Self {
            name: "clickhouse".to_string(),
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            query_timeout_ms: 30_000,
            acquire_timeout_secs: 10,
            pool_size: 4,
        }
    }
}

impl ChConfig {
    /// Read `<PREFIX>_URL`, `<PREFIX>_DATABASE`, `<PREFIX>_USER`,
    /// `<PREFIX>_PASSWORD`, `<PREFIX>_QUERY_TIMEOUT_MS`,
    /// `<PREFIX>_ACQUIRE_TIMEOUT_SECS` and `<PREFIX>_POOL_SIZE`.
    ///
    /// `<PREFIX>_URL` is required.
    pub fn from_env(prefix: &str) -> Result<Self, PoolError> {
        let defaults = Self::default();
        let key = |suffix: &str| prefixed_key(prefix, suffix);

        let url = std::env::var(key("URL"))
            .map_err(|_| PoolError::Config(format!("{} must be set", key("URL"))))?;

        let config = Self {
            name: prefix.trim_end_matches('_').to_lowercase(),
            url,
            database: env_string_or(&key("DATABASE"), &defaults.database),
            user: env_string_or(&key("USER"), &defaults.user),
            password: env_string_or(&key("PASSWORD"), &defaults.password),
            query_timeout_ms: parse_env_with_default(
                &key("QUERY_TIMEOUT_MS"),
                defaults.query_timeout_ms,
            ),
            acquire_timeout_secs: parse_env_with_default(
                &key("ACQUIRE_TIMEOUT_SECS"),
                defaults.acquire_timeout_secs,
            ),
            pool_size: parse_env_with_default(&key("POOL_SIZE"), defaults.pool_size),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.url.trim().is_empty() {
            return Err(PoolError::Config(format!("{}: url is empty", self.name)));
        }
        if self.pool_size == 0 {
            return Err(PoolError::Config(format!(
                "{}: pool_size must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    pub fn log_config(&self) {
        info!(
            pool = %self.name,
            url = %self.url,
            database = %self.database,
            user = %self.user,
            pool_size = self.pool_size,
            query_timeout_ms = self.query_timeout_ms,
            acquire_timeout_secs = self.acquire_timeout_secs,
            "ClickHouse configuration"
        );
    }

    /// Build a single client from these settings
    pub fn build_client(&self) -> Client {
        let mut client = Client::default()
            .with_url(&self.url)
            .with_user(&self.user)
            .with_password(&self.password)
            .with_database(&self.database);

        if self.query_timeout_ms > 0 {
            // max_execution_time is in seconds, round up
            let secs = self.query_timeout_ms.div_ceil(1000);
            client = client.with_option("max_execution_time", secs.to_string());
        }
        client
    }
}

/// Build `config.pool_size` clients and wrap each with `wrap`.
///
/// Connectivity is not verified here; callers ping through a lease.
pub fn create_pool<C, F>(config: &ChConfig, wrap: F) -> Result<ClientPool<C>, PoolError>
where
    F: Fn(Client) -> C,
{
    config.validate()?;
    let clients = (0..config.pool_size)
        .map(|_| wrap(config.build_client()))
        .collect();
    ClientPool::new(
        config.name.clone(),
        clients,
        Duration::from_secs(config.acquire_timeout_secs),
    )
}

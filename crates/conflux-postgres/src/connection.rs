//! Connection pool setup.
//!
//! The pool is opened once per process and shared by every upsert. Opening
//! retries with exponential backoff; both config types deserialize from the
//! `[database.pool]` table of `conflux.toml`.

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::{ConfluxError, Result};

/// Backoff used while the first connection is being opened.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first one; 0 fails immediately.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-indexed), capped at `max_delay_ms`.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis((delay_ms as u64).min(self.max_delay_ms))
    }
}

/// Pool limits and timeouts. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: u32,
    /// Upper bound on concurrent upserts through this pool: each one holds a
    /// connection for its whole run.
    pub max_connections: u32,
    pub connect_timeout: u64,
    pub max_lifetime: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub retry: RetryConfig,
    /// Prepared statements cached per connection; 0 disables the cache.
    pub statement_cache_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connect_timeout: 30,
            max_lifetime: Some(1800),
            idle_timeout: Some(600),
            retry: RetryConfig::default(),
            statement_cache_capacity: 100,
        }
    }
}

impl PoolConfig {
    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(self.min_connections)
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout))
            .max_lifetime(self.max_lifetime.map(Duration::from_secs))
            .idle_timeout(self.idle_timeout.map(Duration::from_secs))
    }
}

/// A shared PostgreSQL pool.
#[derive(Clone)]
pub struct Connection {
    pool: PgPool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}

impl Connection {
    /// Opens a pool on `uri` and checks it with `SELECT 1`.
    ///
    /// # Errors
    ///
    /// [`ConfluxError::Connection`] for an empty or malformed URI or a failed
    /// check; the classified driver error when every attempt failed.
    #[instrument(skip(uri, config), fields(
        max_connections = config.max_connections,
        max_retries = config.retry.max_retries
    ))]
    pub async fn new(uri: &str, config: PoolConfig) -> Result<Self> {
        let connect_options = parse_uri(uri)?.statement_cache_capacity(config.statement_cache_capacity);
        let pool = connect_with_retry(config.pool_options(), connect_options, &config.retry).await?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ConfluxError::Connection(format!("Failed to verify connection: {}", e)))?;

        info!("Connection pool ready");
        Ok(Self { pool })
    }

    /// Wraps an already configured pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Waits for checked-out connections to return, then closes the pool.
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn parse_uri(uri: &str) -> Result<PgConnectOptions> {
    if uri.trim().is_empty() {
        return Err(ConfluxError::Connection("Connection URI cannot be empty".to_string()));
    }
    PgConnectOptions::from_str(uri)
        .map_err(|e| ConfluxError::Connection(format!("Invalid connection URI: {}", e)))
}

async fn connect_with_retry(
    pool_options: PgPoolOptions,
    connect_options: PgConnectOptions,
    retry: &RetryConfig,
) -> Result<PgPool> {
    let mut attempt = 0;
    loop {
        match pool_options.clone().connect_with(connect_options.clone()).await {
            Ok(pool) => {
                if attempt > 0 {
                    info!(attempt, "Connected after retry");
                }
                return Ok(pool);
            }
            Err(e) if attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(ConfluxError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_deserialize_partial() {
        let config: PoolConfig = toml::from_str(
            r#"
max_connections = 4
idle_timeout = 30

[retry]
max_retries = 0
"#,
        )
        .unwrap();

        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.idle_timeout, Some(30));
        assert_eq!(config.max_lifetime, Some(1800));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_delay_ms, 100);
    }

    #[test]
    fn test_parse_uri() {
        assert!(parse_uri("postgresql://localhost/test_db").is_ok());

        match parse_uri("  ") {
            Err(ConfluxError::Connection(msg)) => assert_eq!(msg, "Connection URI cannot be empty"),
            other => panic!("Expected Connection error, got {:?}", other),
        }
        assert!(matches!(parse_uri("not a uri"), Err(ConfluxError::Connection(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_empty_uri() {
        let result = Connection::new("", PoolConfig::default()).await;
        assert!(matches!(result, Err(ConfluxError::Connection(_))));
    }

    #[tokio::test]
    async fn test_new_gives_up_after_retries() {
        let config = PoolConfig {
            connect_timeout: 1,
            retry: RetryConfig {
                max_retries: 1,
                initial_delay_ms: 1,
                ..RetryConfig::default()
            },
            ..PoolConfig::default()
        };
        let result = Connection::new("postgresql://nobody@127.0.0.1:1/none", config).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_delay_calculation() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(3200));
        // 6400ms, capped
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(5000));
    }
}

//! Database layer for Greenlight.
//!
//! Uses PostgreSQL with sqlx. [`Database`] implements the credential and user
//! stores consumed by the identity resolver.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::gauge;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::middleware::auth::{CredentialRecord, CredentialStore, StoreError, UserRecord, UserStore};

/// Bound for acquiring a pooled connection and for the startup ping.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often pool gauges are refreshed.
pub const POOL_METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Pool options for `config`.
///
/// sqlx has no cap on idle connections; `min_conns` is a floor the idle
/// reaper never goes below, so it defaults to zero and `max_idle_time`
/// closes everything else.
fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_open_conns)
        .min_connections(config.min_conns)
        .idle_timeout(config.max_idle_time)
        .acquire_timeout(CONNECT_TIMEOUT)
}

/// Point-in-time connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or in use
    pub connections: u32,
    /// Open connections not checked out
    pub idle: usize,
}

/// Database connection and operations.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the connection pool and verify the database is reachable.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config).connect(&config.url).await?;

        let db = Self { pool };
        db.ping().await?;

        info!(
            max_connections = config.max_open_conns,
            min_connections = config.min_conns,
            max_idle_time = ?config.max_idle_time,
            "Database connection pool established"
        );
        Ok(db)
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        tokio::time::timeout(CONNECT_TIMEOUT, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout(CONNECT_TIMEOUT))??;
        Ok(())
    }

    /// Current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            connections: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }

    /// Publish pool statistics as gauges.
    pub fn record_pool_metrics(&self) -> PoolStats {
        let stats = self.pool_stats();
        gauge!("db_pool_connections").set(stats.connections as f64);
        gauge!("db_pool_idle").set(stats.idle as f64);
        stats
    }

    /// Refresh pool gauges every `interval` until `shutdown` is cancelled.
    pub fn spawn_pool_monitor(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        db.record_pool_metrics();
                    }
                }
            }
            debug!("Pool monitor stopped");
        })
    }

    /// Close every pooled connection. Waits for checked-out connections to
    /// be returned.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl CredentialStore for Database {
    async fn lookup(&self, token_hash: &[u8], scope: &str) -> std::result::Result<Option<CredentialRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, expiry
            FROM tokens
            WHERE hash = $1 AND scope = $2 AND expiry > $3
            "#,
        )
        .bind(token_hash)
        .bind(scope)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| {
            Ok(CredentialRecord {
                user_id: row.try_get::<i64, _>("user_id").map_err(backend)?,
                expiry: row.try_get::<DateTime<Utc>, _>("expiry").map_err(backend)?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl UserStore for Database {
    async fn get_by_id(&self, user_id: i64) -> std::result::Result<Option<UserRecord>, StoreError> {
        let Some(row) = sqlx::query("SELECT activated FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
        else {
            return Ok(None);
        };
        let activated: bool = row.try_get("activated").map_err(backend)?;

        let permissions = sqlx::query(
            r#"
            SELECT permissions.code
            FROM permissions
            INNER JOIN users_permissions ON users_permissions.permission_id = permissions.id
            WHERE users_permissions.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .iter()
        .map(|row| row.try_get::<String, _>("code"))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(backend)?;

        debug!(user_id, permissions = permissions.len(), "Loaded user record");

        Ok(Some(UserRecord {
            id: user_id,
            activated,
            permissions,
        }))
    }
}

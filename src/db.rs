//! Database connection and pool management.

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("Database connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Initializes a connection pool with retry and exponential backoff for
/// transient connection errors.
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        }
        .into());
    }

    let mut opt = ConnectOptions::new(&cfg.database_url);
    opt.max_connections(cfg.db_max_connections)
        .acquire_timeout(Duration::from_millis(cfg.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let max_retries = 5;
    let mut retry_delay = Duration::from_millis(100);

    for attempt in 1..=max_retries {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("Successfully connected to database (attempt {})", attempt);
                return Ok(conn);
            }
            Err(e) => {
                if attempt == max_retries {
                    log::error!(
                        "Failed to connect to database after {} attempts: {}",
                        max_retries,
                        e
                    );
                    return Err(DatabaseError::ConnectionFailed { source: e }.into());
                }

                log::warn!(
                    "Database connection attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    retry_delay
                );

                sleep(retry_delay).await;
                retry_delay *= 2;
            }
        }
    }

    Err(DatabaseError::ConnectionTimeout {
        timeout_ms: cfg.db_acquire_timeout_ms,
    }
    .into())
}

/// Verifies the connection is still usable by executing a trivial query.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    use sea_orm::Statement;

    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());

    db.query_one(stmt)
        .await
        .context("Database health check failed")?;

    Ok(())
}

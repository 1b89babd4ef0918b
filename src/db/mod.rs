/// Database layer for the relay
///
/// Manages the metadata connection pool and embedded migrations for the
/// source registry, repository heads, and the table-backed event log.

use crate::error::{RelayError, RelayResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub enable_wal: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 40,
            enable_wal: true,
        }
    }
}

/// Create a SQLite connection pool from a `sqlite://` URL
pub async fn create_pool(url: &str, options: DatabaseOptions) -> RelayResult<SqlitePool> {
    let connect = SqliteConnectOptions::from_str(url)
        .map_err(|e| RelayError::Validation(format!("Invalid database URL {}: {}", url, e)))?
        .create_if_missing(true)
        .journal_mode(if options.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        })
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // Ensure parent directory exists
    if let Some(parent) = connect.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections.max(1))
        .connect_with(connect)
        .await
        .map_err(RelayError::Database)?;

    Ok(pool)
}

/// Open a private in-memory database
///
/// A single connection keeps every query on the same memory database.
pub async fn open_in_memory() -> RelayResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run migrations embedded at compile time from ./migrations
pub async fn run_migrations(pool: &SqlitePool) -> RelayResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Test database connection
pub async fn test_connection(pool: &SqlitePool) -> RelayResult<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(RelayError::Database)?;

    Ok(())
}

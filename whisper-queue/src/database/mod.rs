//! Database module for whisper-queue.
//!
//! Persistence layer for job records using SQLite with sqlx. The job
//! "collection" is a single table whose name comes from configuration; the
//! store adapter creates it on startup.

pub mod models;
pub mod repositories;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize the database connection pool with WAL mode.
///
/// WAL keeps reads concurrent with the claim transaction's writes; the busy
/// timeout bounds how long a writer waits for the write lock before the
/// adapter-level retry takes over.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .connect_with(connect_options)
        .await?;

    tracing::debug!("Database pool initialized (max_connections={})", DEFAULT_POOL_SIZE);

    Ok(pool)
}

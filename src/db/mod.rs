/// Database layer for FillTheHole
///
/// Manages the SQLite connection pool, embedded migrations and the
/// timestamp encoding shared by every table.

use crate::error::{HoleError, HoleResult};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Sqlite,
};
use std::path::Path;
use std::str::FromStr;

/// Database connection options
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub enable_wal: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            enable_wal: true,
        }
    }
}

/// Create a SQLite connection pool
pub async fn create_pool(path: &Path, options: DatabaseOptions) -> HoleResult<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(if options.enable_wal {
                    SqliteJournalMode::Wal
                } else {
                    SqliteJournalMode::Delete
                })
                .foreign_keys(true)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await?;

    Ok(pool)
}

/// Single-connection in-memory database with migrations applied
///
/// The connection is never recycled, since dropping it discards the data.
pub async fn connect_in_memory() -> HoleResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run migrations for a database
/// Migrations are embedded at compile time from ./migrations directory
pub async fn run_migrations(pool: &SqlitePool) -> HoleResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| HoleError::Internal(format!("Migration failed: {}", e)))?;

    Ok(())
}

/// Test database connection
pub async fn test_connection(pool: &SqlitePool) -> HoleResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Open a write-locked transaction on a pooled connection
///
/// SQLite refuses to upgrade a deferred transaction from read to write while
/// another writer is active, so anything that reads before it writes takes
/// the lock first. Close with [`finish_transaction`].
pub async fn begin_immediate(pool: &SqlitePool) -> HoleResult<PoolConnection<Sqlite>> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

/// Commit on success, roll back on error
pub async fn finish_transaction<T>(
    conn: &mut PoolConnection<Sqlite>,
    result: HoleResult<T>,
) -> HoleResult<T> {
    let end = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };

    if let Err(e) = sqlx::query(end).execute(&mut **conn).await {
        tracing::error!("{} failed: {}", end, e);
        if sqlx::query("ROLLBACK").execute(&mut **conn).await.is_err() {
            conn.close_on_drop();
        }
        return Err(result.err().unwrap_or(HoleError::Database(e)));
    }

    result
}

/// Encode a timestamp for storage
///
/// Fixed-width UTC with millisecond precision, so string comparison in SQL
/// orders the same as time.
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time, encoded for storage
pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Decode a stored timestamp
pub fn parse_timestamp(raw: &str) -> HoleResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HoleError::Internal(format!("Invalid timestamp {}: {}", raw, e)))
}

/// Decode an optional stored timestamp
pub fn parse_optional_timestamp(raw: Option<String>) -> HoleResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

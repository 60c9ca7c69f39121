//! SQLite connection pool shared by the KV, set and proto-session stores
//!
//! - WAL mode for concurrent readers alongside the single writer
//! - Embedded migrations from `./migrations`
//! - `sqlite::memory:` pins the pool to one connection, since every
//!   in-memory connection is a separate database

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Open the database and run migrations
///
/// # Arguments
///
/// * `database_url` - SQLite URL (e.g., "sqlite:./data/sessions.db" or "sqlite::memory:")
/// * `max_connections` - Pool size for file databases
///
/// # Example
///
/// ```ignore
/// let pool = database::connect("sqlite:./data/sessions.db", 5).await?;
/// ```
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:");

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database url: {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .pragma("synchronous", "NORMAL");

    let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
    pool_options = if in_memory {
        pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(max_connections.max(1))
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .context("Failed to connect to session database")?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run session database migrations")?;

    tracing::info!("Session database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory_creates_tables() {
        let pool = connect("sqlite::memory:", 5).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for table in ["kv", "set_members", "ps_identifiers", "ps_hits", "ps_buckets", "ps_session_to_bucket"] {
            assert!(names.contains(&table), "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_connect_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("sessions.db").display());

        let pool = connect(&url, 2).await.unwrap();
        // Running migrations twice is harmless
        run_migrations(&pool).await.unwrap();
    }
}

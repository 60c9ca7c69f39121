use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::{Kv, Set, SetOptions, EMPTY_VALUE_MARKER};
use crate::error::StorageError;

/// KV over the `kv` table
#[derive(Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Kv for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: SetOptions,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<Vec<u8>> = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get("value"));

        if previous.is_none() || !options.skip_if_exists {
            sqlx::query(
                "INSERT INTO kv (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(if options.return_previous { previous } else { None })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str, max: usize) -> Result<Vec<String>, StorageError> {
        let limit = i64::try_from(max).unwrap_or(i64::MAX);
        // substr keeps the match literal and case-sensitive, unlike LIKE
        let rows = sqlx::query("SELECT key FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key LIMIT ?")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }
}

/// Sets over the `set_members` table
#[derive(Clone)]
pub struct SqliteSet {
    pool: SqlitePool,
}

impl SqliteSet {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_member(value: &[u8]) -> &[u8] {
    if value.is_empty() {
        EMPTY_VALUE_MARKER
    } else {
        value
    }
}

fn decode_member(value: Vec<u8>) -> Vec<u8> {
    if value == EMPTY_VALUE_MARKER {
        Vec::new()
    } else {
        value
    }
}

#[async_trait]
impl Set for SqliteSet {
    async fn add(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO set_members (set_key, member) VALUES (?, ?)")
            .bind(key)
            .bind(encode_member(value))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all(&self, key: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        let rows = sqlx::query("SELECT member FROM set_members WHERE set_key = ? ORDER BY member")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| decode_member(r.get::<Vec<u8>, _>("member")))
            .collect())
    }

    async fn delete(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM set_members WHERE set_key = ? AND member = ?")
            .bind(key)
            .bind(encode_member(value))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_key(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM set_members WHERE set_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! Persistent key-value and set abstractions
//!
//! The timing wheel keeps its state in a [`Kv`]; the generic proto-session
//! backend builds on both [`Kv`] and [`Set`].

pub mod database;
pub mod inmem;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageError;

pub use inmem::{InMemoryKv, InMemorySet};
pub use sqlite::{SqliteKv, SqliteSet};

/// Stands in for an empty byte string inside set backends that cannot
/// store one
pub const EMPTY_VALUE_MARKER: &[u8] = b"__EMPTY_VALUE__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Keep the existing value when the key is present
    pub skip_if_exists: bool,
    /// Return the value stored before the call
    pub return_previous: bool,
}

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: SetOptions,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Keys starting with `prefix` in ascending order, at most `max`
    async fn keys(&self, prefix: &str, max: usize) -> Result<Vec<String>, StorageError>;
}

/// Map of key to a set of distinct byte strings
#[async_trait]
pub trait Set: Send + Sync {
    async fn add(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn all(&self, key: &str) -> Result<Vec<Vec<u8>>, StorageError>;

    async fn delete(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove the whole set
    async fn drop_key(&self, key: &str) -> Result<(), StorageError>;
}

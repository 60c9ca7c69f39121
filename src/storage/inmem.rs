use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;

use super::{Kv, Set, SetOptions};
use crate::error::StorageError;

/// Process-local KV for tests and single-node development
#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: SetOptions,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        // The entry guard makes check-and-set atomic per key
        let previous = match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let previous = occupied.get().clone();
                if !options.skip_if_exists {
                    occupied.insert(value.to_vec());
                }
                Some(previous)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(value.to_vec());
                None
            }
        };

        Ok(if options.return_previous { previous } else { None })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str, max: usize) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys.truncate(max);
        Ok(keys)
    }
}

#[derive(Default)]
pub struct InMemorySet {
    sets: DashMap<String, BTreeSet<Vec<u8>>>,
}

impl InMemorySet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Set for InMemorySet {
    async fn add(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.sets.entry(key.to_string()).or_default().insert(value.to_vec());
        Ok(())
    }

    async fn all(&self, key: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        Ok(self
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let now_empty = match self.sets.get_mut(key) {
            Some(mut members) => {
                members.remove(value);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.sets.remove_if(key, |_, members| members.is_empty());
        }
        Ok(())
    }

    async fn drop_key(&self, key: &str) -> Result<(), StorageError> {
        self.sets.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract::{kv_contract, set_contract};

    #[tokio::test]
    async fn test_in_memory_kv_contract() {
        kv_contract(&InMemoryKv::new()).await;
    }

    #[tokio::test]
    async fn test_in_memory_set_contract() {
        set_contract(&InMemorySet::new()).await;
    }
}

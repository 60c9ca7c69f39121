use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::BucketError;

/// Minimal blob bucket the object-store queue needs
#[async_trait]
pub trait Bucket: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>, BucketError>;
    async fn write(&self, key: &str, data: Vec<u8>) -> Result<(), BucketError>;
    async fn delete(&self, key: &str) -> Result<(), BucketError>;
    /// Keys starting with `prefix`, in lexicographic order, at most `limit`
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, BucketError>;
}

#[derive(Default)]
pub struct InMemoryBucket {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl Bucket for InMemoryBucket {
    async fn read(&self, key: &str) -> Result<Vec<u8>, BucketError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<(), BucketError> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, BucketError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Bucket stored as a directory tree; object keys are relative paths
pub struct LocalDirBucket {
    root: PathBuf,
}

impl LocalDirBucket {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, BucketError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BucketError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(BucketError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn walk(&self) -> Result<Vec<String>, BucketError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                // Skip in-flight temporary writes
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl Bucket for LocalDirBucket {
    async fn read(&self, key: &str) -> Result<Vec<u8>, BucketError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BucketError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<(), BucketError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, BucketError> {
        let mut keys: Vec<String> = self
            .walk()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}

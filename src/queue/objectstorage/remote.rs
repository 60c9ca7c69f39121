//! [`Bucket`] over any `object_store` backend: S3-compatible services,
//! Google Cloud Storage, or the in-memory store in tests

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

use super::Bucket;
use crate::error::BucketError;

/// Connection settings of a remote bucket. Empty strings fall back to the
/// builder's environment defaults.
#[derive(Debug, Clone, Default)]
pub struct RemoteBucketOptions {
    pub bucket: String,
    /// Custom endpoint of an S3-compatible service
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub allow_http: bool,
    /// GCS service account key file
    pub service_account_path: String,
}

pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// S3 or any service speaking its API (MinIO, R2, ...)
    pub fn s3(options: &RemoteBucketOptions) -> Result<Self, BucketError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&options.bucket)
            .with_allow_http(options.allow_http);
        if !options.region.is_empty() {
            builder = builder.with_region(&options.region);
        }
        if !options.endpoint.is_empty() {
            builder = builder.with_endpoint(&options.endpoint);
        }
        if !options.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&options.access_key_id)
                .with_secret_access_key(&options.secret_access_key);
        }
        Ok(Self::new(Arc::new(builder.build()?)))
    }

    pub fn gcs(options: &RemoteBucketOptions) -> Result<Self, BucketError> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&options.bucket);
        if !options.service_account_path.is_empty() {
            builder = builder.with_service_account_path(&options.service_account_path);
        }
        Ok(Self::new(Arc::new(builder.build()?)))
    }
}

/// Object path of `key`; keys must already be in canonical form
fn location(key: &str) -> Result<Path, BucketError> {
    match Path::parse(key) {
        Ok(path) if !key.is_empty() && path.as_ref() == key => Ok(path),
        _ => Err(BucketError::InvalidKey(key.to_string())),
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn read(&self, key: &str) -> Result<Vec<u8>, BucketError> {
        let object = self.store.get(&location(key)?).await?;
        Ok(object.bytes().await?.to_vec())
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<(), BucketError> {
        self.store.put(&location(key)?, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        match self.store.delete(&location(key)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, BucketError> {
        // Listing is per path segment, so list the enclosing directory and
        // filter on the raw prefix
        let directory = match prefix.rfind('/') {
            Some(end) if end > 0 => Some(location(&prefix[..end])?),
            _ => None,
        };

        let mut keys: Vec<String> = self
            .store
            .list(directory.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_filter(|key| futures::future::ready(key.starts_with(prefix)))
            .try_collect()
            .await?;
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn bucket() -> ObjectStoreBucket {
        ObjectStoreBucket::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_list_filters_on_raw_prefix() {
        let bucket = bucket();
        bucket.write("envA/q/2_b", b"two".to_vec()).await.unwrap();
        bucket.write("envA/q/1_a", b"one".to_vec()).await.unwrap();
        bucket.write("envA/q2/1_c", b"other".to_vec()).await.unwrap();

        assert_eq!(
            bucket.list("envA/q/", 10).await.unwrap(),
            vec!["envA/q/1_a".to_string(), "envA/q/2_b".to_string()]
        );
        assert_eq!(bucket.list("envA/q/", 1).await.unwrap(), vec!["envA/q/1_a".to_string()]);
        assert_eq!(bucket.list("", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_read_delete_and_missing_objects() {
        let bucket = bucket();
        bucket.write("q/1_a", b"one".to_vec()).await.unwrap();
        assert_eq!(bucket.read("q/1_a").await.unwrap(), b"one");

        bucket.delete("q/1_a").await.unwrap();
        bucket.delete("q/1_a").await.unwrap();
        assert!(matches!(bucket.read("q/1_a").await, Err(BucketError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rejects_non_canonical_keys() {
        let bucket = bucket();
        for key in ["", "a//b", "/a", "a/"] {
            assert!(
                matches!(bucket.write(key, Vec::new()).await, Err(BucketError::InvalidKey(_))),
                "{key:?} accepted"
            );
        }
    }

    #[test]
    fn test_s3_builder_accepts_compatible_endpoint() {
        let options = RemoteBucketOptions {
            bucket: "sessions".to_string(),
            endpoint: "http://localhost:9000".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "minio".to_string(),
            secret_access_key: "minio123".to_string(),
            allow_http: true,
            ..Default::default()
        };
        assert!(ObjectStoreBucket::s3(&options).is_ok());
    }
}

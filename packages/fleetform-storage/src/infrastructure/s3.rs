//! S3 backend for the persistent fleet state.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::debug;

use crate::domain::ObjectStore;
use crate::error::StorageError;
use crate::Result;

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    /// Create a store using the ambient AWS configuration.
    pub async fn connect(region: &str, bucket: &str, prefix: &str) -> Self {
        let config = aws_config::from_env()
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .load()
            .await;
        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Create a store with a custom client, e.g. pointing at LocalStack.
    pub fn with_client(client: Client, bucket: &str, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let key = self.key(path);
        debug!("Reading the object at s3://{}/{}", self.bucket, key);
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(StorageError::object_store)?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    Ok(None)
                } else {
                    Err(StorageError::object_store(err))
                }
            }
        }
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let key = self.key(path);
        debug!("Writing the object at s3://{}/{}", self.bucket, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type("application/json")
            .send()
            .await
            .map_err(StorageError::object_store)?;
        Ok(())
    }
}

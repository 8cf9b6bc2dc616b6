//! Local filesystem backend, used by tests and offline runs.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::ObjectStore;
use crate::Result;

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.root.join(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await?;
        Ok(())
    }
}

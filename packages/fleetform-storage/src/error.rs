use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),
}

impl StorageError {
    pub fn object_store<E: std::fmt::Display>(e: E) -> Self {
        Self::ObjectStore(e.to_string())
    }
}

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Content-addressable storage backend
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store a blob and return its content identifier
    async fn upload(&self, data: Bytes, file_name: &str) -> StorageResult<String>;

    /// Fetch a blob by content identifier
    async fn retrieve(&self, cid: &str) -> StorageResult<Bytes>;

    /// Name the provider is registered under
    fn storage_type(&self) -> &'static str;
}

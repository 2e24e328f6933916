use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;
use crate::storage::{StorageProvider, StorageResult};

/// Content-addressed store on the local file system.
///
/// The CID is the hex SHA-256 of the blob; files are sharded by the first
/// two hex characters.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn get_full_path(&self, cid: &str) -> PathBuf {
        self.base_path.join(&cid[..2]).join(cid)
    }

    fn is_valid_cid(cid: &str) -> bool {
        cid.len() == 64 && cid.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn upload(&self, data: Bytes, file_name: &str) -> StorageResult<String> {
        let cid = hex::encode(Sha256::digest(&data));
        let full_path = self.get_full_path(&cid);

        // Same content, same CID: nothing to write
        if fs::try_exists(&full_path).await.unwrap_or(false) {
            tracing::debug!("Blob {} already stored", cid);
            return Ok(cid);
        }

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::UploadFailed(format!("create dir: {}", e)))?;
        }

        // Write to a temp name first so readers never see a partial blob
        let tmp_path = full_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let write = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            fs::rename(&tmp_path, &full_path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::UploadFailed(format!("write {}: {}", file_name, e)));
        }

        tracing::debug!("Stored {} ({} bytes) as {}", file_name, data.len(), cid);
        Ok(cid)
    }

    async fn retrieve(&self, cid: &str) -> StorageResult<Bytes> {
        if !Self::is_valid_cid(cid) {
            return Err(StorageError::RetrieveFailed(format!("not a local CID: {}", cid)));
        }

        let data = fs::read(self.get_full_path(cid)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::RetrieveFailed(format!("blob not found: {}", cid))
            } else {
                StorageError::RetrieveFailed(format!("read {}: {}", cid, e))
            }
        })?;

        Ok(Bytes::from(data))
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}

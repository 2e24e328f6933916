use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;

use crate::error::StorageError;
use crate::storage::{StorageProvider, StorageResult};

/// IPFS node reached through its HTTP API (`/api/v0`)
pub struct IpfsStorage {
    client: Client,
    api_url: String,
}

impl IpfsStorage {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StorageProvider for IpfsStorage {
    async fn upload(&self, data: Bytes, file_name: &str) -> StorageResult<String> {
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::stream(data).file_name(file_name.to_string()),
        );

        let response = self
            .client
            .post(format!("{}/api/v0/add?pin=true", self.api_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("IPFS add: {}", e)))?;

        if !response.status().is_success() {
            return Err(StorageError::UploadFailed(format!(
                "IPFS add returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("IPFS add response: {}", e)))?;

        body["Hash"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| StorageError::UploadFailed("Missing CID in IPFS response".to_string()))
    }

    async fn retrieve(&self, cid: &str) -> StorageResult<Bytes> {
        let response = self
            .client
            .post(format!("{}/api/v0/cat", self.api_url))
            .query(&[("arg", cid)])
            .send()
            .await
            .map_err(|e| StorageError::RetrieveFailed(format!("IPFS cat: {}", e)))?;

        if !response.status().is_success() {
            return Err(StorageError::RetrieveFailed(format!(
                "IPFS cat {} returned {}",
                cid,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| StorageError::RetrieveFailed(format!("IPFS cat body: {}", e)))
    }

    fn storage_type(&self) -> &'static str {
        "ipfs"
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;

use crate::error::StorageError;
use crate::storage::{StorageProvider, StorageResult};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    cid: String,
}

/// web3.storage pinning service: token-authenticated upload, public
/// gateway retrieval
pub struct Web3Storage {
    client: Client,
    api_url: String,
    gateway_url: String,
    token: String,
}

impl Web3Storage {
    pub fn new(api_url: &str, gateway_url: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

/// Header values must be visible ASCII, file names need not be
fn name_header(file_name: &str) -> String {
    urlencoding::encode(file_name).into_owned()
}

#[async_trait]
impl StorageProvider for Web3Storage {
    async fn upload(&self, data: Bytes, file_name: &str) -> StorageResult<String> {
        let response = self
            .client
            .post(format!("{}/upload", self.api_url))
            .bearer_auth(&self.token)
            .header("X-Name", name_header(file_name))
            .body(data)
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("web3.storage: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::UploadFailed(format!(
                "web3.storage returned {}: {}",
                status, body
            )));
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError::UploadFailed(format!("web3.storage response: {}", e)))?;
        Ok(parsed.cid)
    }

    async fn retrieve(&self, cid: &str) -> StorageResult<Bytes> {
        let response = self
            .client
            .get(format!("{}/ipfs/{}", self.gateway_url, cid))
            .send()
            .await
            .map_err(|e| StorageError::RetrieveFailed(format!("gateway: {}", e)))?;

        if !response.status().is_success() {
            return Err(StorageError::RetrieveFailed(format!(
                "gateway returned {} for {}",
                response.status(),
                cid
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| StorageError::RetrieveFailed(format!("gateway body: {}", e)))
    }

    fn storage_type(&self) -> &'static str {
        "web3storage"
    }
}

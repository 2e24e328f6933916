use serde::Serialize;
use sqlx::FromRow;

use crate::error::{AppError, Result};

pub const KEY_LEN: usize = 32;

/// Per-user symmetric key. One per address, created on first use and
/// never rotated.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EncryptionKey {
    pub user_address: String,
    #[serde(skip_serializing)]
    pub key_material: String, // hex
    pub key_id: String,
    pub created_at: String,
}

impl EncryptionKey {
    pub fn key_bytes(&self) -> Result<[u8; KEY_LEN]> {
        let raw = hex::decode(&self.key_material)
            .map_err(|e| AppError::Internal(format!("Corrupt key material: {}", e)))?;
        raw.try_into()
            .map_err(|_| AppError::Internal("Key material has wrong length".to_string()))
    }
}

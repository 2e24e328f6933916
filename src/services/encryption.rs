//! Per-user AES-256-GCM keys and the content blob format.
//!
//! Blob layout: nonce (12 bytes) || tag (16 bytes) || ciphertext

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use chrono::Utc;
use rand::{Rng, RngCore};

use crate::db::Database;
use crate::error::{AppError, PersistenceError, Result};
use crate::models::{EncryptionKey, KEY_LEN};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Associated data bound into every tag
const CONTENT_AAD: &[u8] = b"vaultchain:content:v1";

pub struct EncryptionService;

impl EncryptionService {
    /// Get the user's key, creating it on first use.
    ///
    /// Concurrent first calls race on the primary key; the loser re-reads
    /// the winner's key, so every caller sees the same key.
    pub async fn get_or_create_key(db: &Database, user_address: &str) -> Result<EncryptionKey> {
        let address = user_address.to_lowercase();
        if let Some(key) = Self::find_key(db, &address).await? {
            return Ok(key);
        }

        let mut material = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut material);

        let result = sqlx::query(
            r#"
            INSERT INTO encryption_keys (user_address, key_material, key_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&address)
        .bind(hex::encode(material))
        .bind(format!("auto_{}", address))
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await;

        match result.map_err(PersistenceError::from) {
            Ok(_) => tracing::info!("Created encryption key for {}", address),
            Err(PersistenceError::ConstraintViolation(_)) => {
                tracing::debug!("Encryption key for {} created concurrently", address);
            }
            Err(e) => return Err(e.into()),
        }

        Self::find_key(db, &address)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Encryption key for {} vanished", address)))
    }

    pub async fn find_key(db: &Database, user_address: &str) -> Result<Option<EncryptionKey>> {
        let key = sqlx::query_as("SELECT * FROM encryption_keys WHERE user_address = ?")
            .bind(user_address.to_lowercase())
            .fetch_optional(db.pool())
            .await?;
        Ok(key)
    }

    pub fn encrypt(data: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::thread_rng().gen();

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: data,
                    aad: CONTENT_AAD,
                },
            )
            .map_err(|_| AppError::Internal("Encryption failed".to_string()))?;

        // aes-gcm appends the tag; move it in front of the ciphertext
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);
        Ok(blob)
    }

    /// Fails with `Decryption` on truncated input, tag mismatch or wrong key.
    pub fn decrypt(blob: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::Decryption);
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: &sealed,
                    aad: CONTENT_AAD,
                },
            )
            .map_err(|_| AppError::Decryption)
    }
}

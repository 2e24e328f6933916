//! Ledger client: the call contract of the on-chain registry that holds
//! authoritative upload, access and reward-claim state.

pub mod abi;
pub mod evm;
pub mod memory;
pub mod rlp;

pub use evm::EvmLedgerClient;
pub use memory::InMemoryLedger;

use async_trait::async_trait;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::Serialize;
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::future::Future;
use std::time::Duration;

use crate::error::LedgerError;
use crate::models::Amount;

pub type TxHash = String;

/// Receipt state of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Per-CID reward entry as the ledger sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRewardEntry {
    pub uploader: String,
    pub file_size: u64,
    pub is_encrypted: bool,
    pub reward_claimed: bool,
}

/// Call contract of the ledger program.
///
/// Mutating calls return once the transaction has been accepted by the
/// network; they do not wait for inclusion.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn record_upload(
        &self,
        cid: &str,
        uploader: &str,
        size: u64,
        encrypted: bool,
        metadata: &str,
    ) -> Result<TxHash, LedgerError>;

    async fn claim_reward(&self, cid: &str) -> Result<TxHash, LedgerError>;

    /// Settle several rewards in one transaction
    async fn claim_rewards(&self, cids: &[String]) -> Result<TxHash, LedgerError>;

    /// `duration_secs == 0` grants permanent access
    async fn grant_access(
        &self,
        cid: &str,
        grantee: &str,
        duration_secs: u64,
    ) -> Result<TxHash, LedgerError>;

    async fn revoke_access(&self, cid: &str, grantee: &str) -> Result<TxHash, LedgerError>;

    async fn has_access(&self, cid: &str, address: &str) -> Result<bool, LedgerError>;

    async fn reward_balance(&self, address: &str) -> Result<Amount, LedgerError>;

    async fn calculate_reward(&self, size: u64, encrypted: bool) -> Result<Amount, LedgerError>;

    async fn reward_entry(&self, cid: &str) -> Result<Option<LedgerRewardEntry>, LedgerError>;

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus, LedgerError>;

    async fn block_number(&self) -> Result<u64, LedgerError>;

    fn backend(&self) -> &'static str;
}

/// Run a ledger call under a caller-supplied deadline.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(deadline)),
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Contract key for a CID: SHA-256 of the CID string
pub fn cid_to_bytes32(cid: &str) -> [u8; 32] {
    Sha256::digest(cid.as_bytes()).into()
}

/// Parse a `0x`-prefixed (or bare) 20-byte hex address
pub fn parse_address(address: &str) -> Option<[u8; 20]> {
    let hex_part = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    if hex_part.len() != 40 {
        return None;
    }
    hex::decode(hex_part).ok()?.try_into().ok()
}

pub fn format_address(address: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(address))
}

/// Account address of a secp256k1 public key: the last 20 bytes of the
/// Keccak-256 of the uncompressed point without its tag byte.
pub fn public_key_address(key: &VerifyingKey) -> [u8; 20] {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::abi::{self, Token};
use super::{
    cid_to_bytes32, format_address, keccak256, parse_address, public_key_address, rlp,
    LedgerClient, LedgerRewardEntry, TxHash, TxStatus,
};
use crate::config::LedgerConfig;
use crate::error::{AppError, LedgerError, Result};
use crate::models::Amount;

const RECORD_UPLOAD: &str = "recordUpload(bytes32,address,uint256,bool,string)";
const CLAIM_REWARD: &str = "claimUploadReward(bytes32)";
const CLAIM_REWARDS: &str = "claimUploadRewards(bytes32[])";
const GRANT_ACCESS: &str = "grantAccess(bytes32,address,uint256)";
const REVOKE_ACCESS: &str = "revokeAccess(bytes32,address)";
const HAS_ACCESS: &str = "hasAccess(bytes32,address)";
const REWARD_BALANCE: &str = "rewardBalance(address)";
const CALCULATE_REWARD: &str = "calculateReward(uint256,bool)";
const GET_FILE_RECORD: &str = "getFileRecord(bytes32)";

#[derive(Debug, Clone, Copy)]
struct GasLimits {
    record: u64,
    claim: u64,
    grant: u64,
}

/// JSON-RPC client for the registry contract on an EVM-compatible chain.
///
/// Transactions are legacy EIP-155, signed locally with the service key.
pub struct EvmLedgerClient {
    http: reqwest::Client,
    rpc_url: String,
    contract: [u8; 20],
    signer: SigningKey,
    sender: [u8; 20],
    chain_id: u64,
    gas_price: Option<u128>,
    gas: GasLimits,
    // Serializes nonce lookup and submission for the service account
    send_lock: Mutex<()>,
    request_id: AtomicU64,
}

impl EvmLedgerClient {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let contract = parse_address(&config.contract_address).ok_or_else(|| {
            AppError::Validation(format!("Invalid contract address: {}", config.contract_address))
        })?;

        let key_bytes = hex::decode(config.private_key.trim().trim_start_matches("0x"))
            .map_err(|_| AppError::Validation("Ledger private key is not valid hex".to_string()))?;
        let signer = SigningKey::from_slice(&key_bytes)
            .map_err(|_| AppError::Validation("Ledger private key is not a valid secp256k1 scalar".to_string()))?;
        let sender = public_key_address(signer.verifying_key());

        let http = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(
            "Ledger client for contract {} on chain {} as {}",
            format_address(&contract),
            config.chain_id,
            format_address(&sender)
        );

        Ok(Self {
            http,
            rpc_url: config.rpc_url.clone(),
            contract,
            signer,
            sender,
            chain_id: config.chain_id,
            gas_price: config.gas_price_wei.map(u128::from),
            gas: GasLimits {
                record: config.record_gas_limit,
                claim: config.claim_gas_limit,
                grant: config.grant_gas_limit,
            },
            send_lock: Mutex::new(()),
            request_id: AtomicU64::new(1),
        })
    }

    pub fn sender_address(&self) -> String {
        format_address(&self.sender)
    }

    async fn rpc(&self, method: &str, params: Value) -> std::result::Result<Value, LedgerError> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::ContractCallFailed(format!("{}: {}", method, e)))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LedgerError::ContractCallFailed(format!("{}: invalid response: {}", method, e)))?;

        if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown RPC error");
            tracing::debug!("RPC {} returned error: {}", method, message);
            return Err(classify_rpc_error(method, message));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::ContractCallFailed(format!("{}: missing result", method)))
    }

    async fn call(&self, data: Vec<u8>) -> std::result::Result<Vec<u8>, LedgerError> {
        let result = self
            .rpc(
                "eth_call",
                json!([{
                    "from": format_address(&self.sender),
                    "to": format_address(&self.contract),
                    "data": format!("0x{}", hex::encode(&data)),
                }, "latest"]),
            )
            .await?;
        let encoded = result
            .as_str()
            .ok_or_else(|| LedgerError::ContractCallFailed("eth_call: non-string result".to_string()))?;
        hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| LedgerError::ContractCallFailed(format!("eth_call: bad hex: {}", e)))
    }

    async fn quantity(&self, method: &str, params: Value) -> std::result::Result<u128, LedgerError> {
        let result = self.rpc(method, params).await?;
        parse_quantity(&result)
            .ok_or_else(|| LedgerError::ContractCallFailed(format!("{}: bad quantity {}", method, result)))
    }

    /// Simulate, then sign and submit. The simulation surfaces contract
    /// rejections (already claimed, not authorized) before gas is spent.
    async fn send_transaction(
        &self,
        data: Vec<u8>,
        gas_limit: u64,
    ) -> std::result::Result<TxHash, LedgerError> {
        self.call(data.clone()).await?;

        let _guard = self.send_lock.lock().await;

        let nonce = self
            .quantity(
                "eth_getTransactionCount",
                json!([format_address(&self.sender), "pending"]),
            )
            .await?;
        let gas_price = match self.gas_price {
            Some(price) => price,
            None => self.quantity("eth_gasPrice", json!([])).await?,
        };

        let raw = self.sign_legacy(nonce, gas_price, gas_limit, &data)?;
        let result = self
            .rpc(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&raw))]),
            )
            .await?;

        let tx_hash = match result.as_str() {
            Some(hash) => hash.to_string(),
            None => format!("0x{}", hex::encode(keccak256(&raw))),
        };
        tracing::debug!("Submitted transaction {} (nonce {})", tx_hash, nonce);
        Ok(tx_hash)
    }

    fn sign_legacy(
        &self,
        nonce: u128,
        gas_price: u128,
        gas_limit: u64,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, LedgerError> {
        let chain_id = self.chain_id as u128;
        let mut fields = vec![
            rlp::encode_uint(nonce),
            rlp::encode_uint(gas_price),
            rlp::encode_uint(gas_limit as u128),
            rlp::encode_bytes(&self.contract),
            rlp::encode_uint(0),
            rlp::encode_bytes(data),
        ];

        let mut unsigned = fields.clone();
        unsigned.push(rlp::encode_uint(chain_id));
        unsigned.push(rlp::encode_uint(0));
        unsigned.push(rlp::encode_uint(0));
        let sighash = keccak256(&rlp::encode_list(&unsigned));

        let (signature, recovery_id) = self
            .signer
            .sign_prehash_recoverable(&sighash)
            .map_err(|e| LedgerError::TransactionFailed(format!("signing failed: {}", e)))?;

        let v = recovery_id.to_byte() as u128 + chain_id * 2 + 35;
        let sig_bytes = signature.to_bytes();
        fields.push(rlp::encode_uint(v));
        fields.push(rlp::encode_bytes(rlp::trim_leading_zeros(&sig_bytes[..32])));
        fields.push(rlp::encode_bytes(rlp::trim_leading_zeros(&sig_bytes[32..])));

        Ok(rlp::encode_list(&fields))
    }
}

fn address_arg(address: &str) -> std::result::Result<[u8; 20], LedgerError> {
    parse_address(address)
        .ok_or_else(|| LedgerError::ContractCallFailed(format!("invalid address {}", address)))
}

fn parse_quantity(value: &Value) -> Option<u128> {
    let s = value.as_str()?;
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Some(0);
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Map node and revert messages onto the ledger error taxonomy
pub fn classify_rpc_error(method: &str, message: &str) -> LedgerError {
    let lower = message.to_lowercase();
    if lower.contains("already claimed") {
        LedgerError::AlreadyClaimed
    } else if lower.contains("already recorded")
        || lower.contains("already uploaded")
        || lower.contains("file exists")
    {
        LedgerError::AlreadyRecorded
    } else if lower.contains("not authorized")
        || lower.contains("unauthorized")
        || lower.contains("only uploader")
        || lower.contains("not the uploader")
    {
        LedgerError::NotAuthorized
    } else if lower.contains("nothing to claim")
        || lower.contains("no reward")
        || lower.contains("not recorded")
    {
        LedgerError::NothingToClaim
    } else if lower.contains("insufficient funds") {
        LedgerError::InsufficientFunds
    } else if method == "eth_sendRawTransaction" {
        LedgerError::TransactionFailed(message.to_string())
    } else {
        LedgerError::ContractCallFailed(format!("{}: {}", method, message))
    }
}

#[async_trait]
impl LedgerClient for EvmLedgerClient {
    async fn record_upload(
        &self,
        cid: &str,
        uploader: &str,
        size: u64,
        encrypted: bool,
        metadata: &str,
    ) -> std::result::Result<TxHash, LedgerError> {
        let data = abi::encode_call(
            RECORD_UPLOAD,
            &[
                Token::FixedBytes32(cid_to_bytes32(cid)),
                Token::Address(address_arg(uploader)?),
                Token::Uint(size as u128),
                Token::Bool(encrypted),
                Token::String(metadata.to_string()),
            ],
        );
        self.send_transaction(data, self.gas.record).await
    }

    async fn claim_reward(&self, cid: &str) -> std::result::Result<TxHash, LedgerError> {
        let data = abi::encode_call(CLAIM_REWARD, &[Token::FixedBytes32(cid_to_bytes32(cid))]);
        self.send_transaction(data, self.gas.claim).await
    }

    async fn claim_rewards(&self, cids: &[String]) -> std::result::Result<TxHash, LedgerError> {
        let keys = cids.iter().map(|c| cid_to_bytes32(c)).collect();
        let data = abi::encode_call(CLAIM_REWARDS, &[Token::Bytes32Array(keys)]);
        // Scale gas with batch size
        let gas = self.gas.claim.saturating_mul(cids.len().max(1) as u64);
        self.send_transaction(data, gas).await
    }

    async fn grant_access(
        &self,
        cid: &str,
        grantee: &str,
        duration_secs: u64,
    ) -> std::result::Result<TxHash, LedgerError> {
        let data = abi::encode_call(
            GRANT_ACCESS,
            &[
                Token::FixedBytes32(cid_to_bytes32(cid)),
                Token::Address(address_arg(grantee)?),
                Token::Uint(duration_secs as u128),
            ],
        );
        self.send_transaction(data, self.gas.grant).await
    }

    async fn revoke_access(&self, cid: &str, grantee: &str) -> std::result::Result<TxHash, LedgerError> {
        let data = abi::encode_call(
            REVOKE_ACCESS,
            &[
                Token::FixedBytes32(cid_to_bytes32(cid)),
                Token::Address(address_arg(grantee)?),
            ],
        );
        self.send_transaction(data, self.gas.grant).await
    }

    async fn has_access(&self, cid: &str, address: &str) -> std::result::Result<bool, LedgerError> {
        let data = abi::encode_call(
            HAS_ACCESS,
            &[
                Token::FixedBytes32(cid_to_bytes32(cid)),
                Token::Address(address_arg(address)?),
            ],
        );
        let output = self.call(data).await?;
        abi::decode_bool(&output, 0)
            .ok_or_else(|| LedgerError::ContractCallFailed("hasAccess: short output".to_string()))
    }

    async fn reward_balance(&self, address: &str) -> std::result::Result<Amount, LedgerError> {
        let data = abi::encode_call(REWARD_BALANCE, &[Token::Address(address_arg(address)?)]);
        let output = self.call(data).await?;
        abi::decode_uint(&output, 0)
            .ok_or_else(|| LedgerError::ContractCallFailed("rewardBalance: bad output".to_string()))
    }

    async fn calculate_reward(&self, size: u64, encrypted: bool) -> std::result::Result<Amount, LedgerError> {
        let data = abi::encode_call(
            CALCULATE_REWARD,
            &[Token::Uint(size as u128), Token::Bool(encrypted)],
        );
        let output = self.call(data).await?;
        abi::decode_uint(&output, 0)
            .ok_or_else(|| LedgerError::ContractCallFailed("calculateReward: bad output".to_string()))
    }

    async fn reward_entry(&self, cid: &str) -> std::result::Result<Option<LedgerRewardEntry>, LedgerError> {
        let data = abi::encode_call(GET_FILE_RECORD, &[Token::FixedBytes32(cid_to_bytes32(cid))]);
        let output = self.call(data).await?;
        let bad = || LedgerError::ContractCallFailed("getFileRecord: bad output".to_string());

        let uploader = abi::decode_address(&output, 0).ok_or_else(bad)?;
        if uploader == [0u8; 20] {
            return Ok(None);
        }
        let file_size = abi::decode_uint(&output, 1).ok_or_else(bad)?;
        Ok(Some(LedgerRewardEntry {
            uploader: format_address(&uploader),
            file_size: u64::try_from(file_size).map_err(|_| bad())?,
            is_encrypted: abi::decode_bool(&output, 2).ok_or_else(bad)?,
            reward_claimed: abi::decode_bool(&output, 3).ok_or_else(bad)?,
        }))
    }

    async fn transaction_status(&self, tx_hash: &str) -> std::result::Result<TxStatus, LedgerError> {
        let receipt = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if receipt.is_null() {
            return Ok(TxStatus::Pending);
        }
        match receipt.get("status").and_then(parse_quantity) {
            Some(1) => Ok(TxStatus::Confirmed),
            Some(_) => Ok(TxStatus::Failed),
            None => Ok(TxStatus::Pending),
        }
    }

    async fn block_number(&self) -> std::result::Result<u64, LedgerError> {
        let number = self.quantity("eth_blockNumber", json!([])).await?;
        u64::try_from(number)
            .map_err(|_| LedgerError::ContractCallFailed("eth_blockNumber out of range".to_string()))
    }

    fn backend(&self) -> &'static str {
        "rpc"
    }
}

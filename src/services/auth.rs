use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

use crate::config::AuthConfig;
use crate::error::{AppError, Result};
use crate::ledger::{keccak256, parse_address, public_key_address};

const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";
const SIGNATURE_LEN: usize = 65;

/// Message a wallet signs to authorize one action. Each action has its own
/// prefix, so a signature for one cannot be replayed as another.
#[derive(Debug, Clone)]
pub enum ActionMessage<'a> {
    Upload { file_name: &'a str, payload: &'a [u8] },
    Retrieve { cid: &'a str },
    Claim { cid: &'a str },
    BatchClaim { cids: &'a [String] },
    Grant { cid: &'a str, grantee: &'a str, duration: u64 },
    Revoke { cid: &'a str, grantee: &'a str },
    Retire { cid: &'a str },
}

impl ActionMessage<'_> {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ActionMessage::Upload { file_name, payload } => {
                let mut out = format!("upload:{}:", file_name).into_bytes();
                out.extend_from_slice(payload);
                out
            }
            ActionMessage::Retrieve { cid } => format!("retrieve:{}", cid).into_bytes(),
            ActionMessage::Claim { cid } => format!("claim:{}", cid).into_bytes(),
            ActionMessage::BatchClaim { cids } => {
                format!("batch-claim:{}", cids.join(",")).into_bytes()
            }
            ActionMessage::Grant { cid, grantee, duration } => {
                format!("grant:{}:{}:{}", cid, grantee.to_lowercase(), duration).into_bytes()
            }
            ActionMessage::Revoke { cid, grantee } => {
                format!("revoke:{}:{}", cid, grantee.to_lowercase()).into_bytes()
            }
            ActionMessage::Retire { cid } => format!("retire:{}", cid).into_bytes(),
        }
    }
}

/// Wallet signature gate
pub struct AuthService;

impl AuthService {
    /// Verify that `signature` over `message` was produced by the key
    /// behind `claimed_address`. Every failure is the same opaque error.
    pub fn authenticate(
        config: &AuthConfig,
        claimed_address: &str,
        signature: &str,
        message: &[u8],
    ) -> Result<()> {
        let claimed = parse_address(claimed_address).ok_or(AppError::Authentication)?;
        let sig = decode_signature(signature).ok_or(AppError::Authentication)?;

        if config.allow_unverified_signatures {
            tracing::warn!(
                "Signature verification bypassed for {}",
                claimed_address.to_lowercase()
            );
            return Ok(());
        }

        match recover_signer(message, &sig) {
            Some(signer) if signer == claimed => Ok(()),
            _ => {
                tracing::debug!("Signature rejected for {}", claimed_address);
                Err(AppError::Authentication)
            }
        }
    }

    pub fn authenticate_action(
        config: &AuthConfig,
        claimed_address: &str,
        signature: &str,
        action: &ActionMessage<'_>,
    ) -> Result<()> {
        Self::authenticate(config, claimed_address, signature, &action.to_bytes())
    }
}

/// Keccak-256 of the personal-message envelope:
/// `"\x19Ethereum Signed Message:\n" + len(message) + message`
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut data = format!("{}{}", PERSONAL_MESSAGE_PREFIX, message.len()).into_bytes();
    data.extend_from_slice(message);
    keccak256(&data)
}

fn decode_signature(signature: &str) -> Option<[u8; SIGNATURE_LEN]> {
    let hex_part = signature.strip_prefix("0x").unwrap_or(signature);
    if hex_part.len() != SIGNATURE_LEN * 2 {
        return None;
    }
    hex::decode(hex_part).ok()?.try_into().ok()
}

/// Recover the signing address from `r ‖ s ‖ v`, with v in {0, 1, 27, 28}
pub fn recover_signer(message: &[u8], sig: &[u8; SIGNATURE_LEN]) -> Option<[u8; 20]> {
    let v = match sig[64] {
        0 | 1 => sig[64],
        27 | 28 => sig[64] - 27,
        _ => return None,
    };

    let mut signature = Signature::from_slice(&sig[..64]).ok()?;
    let mut recovery_id = RecoveryId::from_byte(v)?;

    // High-s signatures recover the same key once s and the parity flip
    if let Some(normalized) = signature.normalize_s() {
        signature = normalized;
        recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
    }

    let hash = personal_message_hash(message);
    let key = VerifyingKey::recover_from_prehash(&hash, &signature, recovery_id).ok()?;
    Some(public_key_address(&key))
}

/// Produce a wallet-style personal signature (`0x` + r ‖ s ‖ v, v in {27, 28}).
/// Used by client tooling and tests.
pub fn sign_message(key: &SigningKey, message: &[u8]) -> Result<String> {
    let hash = personal_message_hash(message);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&hash)
        .map_err(|e| AppError::Internal(format!("Signing failed: {}", e)))?;

    let mut out = signature.to_bytes().to_vec();
    out.push(recovery_id.to_byte() + 27);
    Ok(format!("0x{}", hex::encode(out)))
}

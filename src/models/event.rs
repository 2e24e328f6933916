use serde::{Deserialize, Serialize};

use super::GrantExpiry;
use crate::error::{AppError, Result};

/// Event pushed by the ledger indexer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Typed reconciliation event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    UploadConfirmed {
        cid: String,
        tx_hash: Option<String>,
    },
    UploadFailed {
        cid: String,
    },
    RewardClaimed {
        cid: String,
        tx_hash: Option<String>,
    },
    AccessGranted {
        cid: String,
        granter: String,
        grantee: String,
        expiry: GrantExpiry,
        block: u64,
    },
    AccessRevoked {
        cid: String,
        grantee: String,
        block: u64,
    },
    TransactionConfirmed {
        tx_hash: String,
    },
    TransactionFailed {
        tx_hash: String,
    },
}

impl EventEnvelope {
    fn field(&self, name: &str) -> Option<String> {
        self.data
            .get(name)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    fn cid(&self) -> Result<String> {
        self.cid
            .clone()
            .or_else(|| self.field("cid"))
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Validation(format!("{} event requires a cid", self.event_type)))
    }

    fn tx_hash(&self) -> Option<String> {
        self.tx_hash.clone().or_else(|| self.field("tx_hash"))
    }

    fn required(&self, name: &str) -> Result<String> {
        self.field(name).ok_or_else(|| {
            AppError::Validation(format!("{} event requires data.{}", self.event_type, name))
        })
    }

    /// Absent or null `expires_at` means permanent
    fn expiry(&self) -> Result<GrantExpiry> {
        let secs = match self.data.get("expires_at") {
            None | Some(serde_json::Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                AppError::Validation(format!("Invalid expires_at: {}", value))
            })?,
        };
        GrantExpiry::from_unix(secs)
            .ok_or_else(|| AppError::Validation(format!("expires_at out of range: {}", secs)))
    }

    pub fn parse(&self) -> Result<LedgerEvent> {
        let block = self.block_number.unwrap_or(0);
        let event = match self.event_type.as_str() {
            "upload_confirmed" | "FileUploaded" => LedgerEvent::UploadConfirmed {
                cid: self.cid()?,
                tx_hash: self.tx_hash(),
            },
            "upload_failed" | "UploadFailed" => LedgerEvent::UploadFailed { cid: self.cid()? },
            "reward_claimed" | "RewardClaimed" => LedgerEvent::RewardClaimed {
                cid: self.cid()?,
                tx_hash: self.tx_hash(),
            },
            "access_granted" | "AccessGranted" => LedgerEvent::AccessGranted {
                cid: self.cid()?,
                granter: self.required("granter")?.to_lowercase(),
                grantee: self.required("grantee")?.to_lowercase(),
                expiry: self.expiry()?,
                block,
            },
            "access_revoked" | "AccessRevoked" => LedgerEvent::AccessRevoked {
                cid: self.cid()?,
                grantee: self.required("grantee")?.to_lowercase(),
                block,
            },
            "transaction_confirmed" | "TransactionConfirmed" => LedgerEvent::TransactionConfirmed {
                tx_hash: self
                    .tx_hash()
                    .ok_or_else(|| AppError::Validation("tx_hash is required".to_string()))?,
            },
            "transaction_failed" | "TransactionFailed" => LedgerEvent::TransactionFailed {
                tx_hash: self
                    .tx_hash()
                    .ok_or_else(|| AppError::Validation("tx_hash is required".to_string()))?,
            },
            other => {
                return Err(AppError::Validation(format!("Unknown event type: {}", other)));
            }
        };
        Ok(event)
    }
}

/// What reconciliation did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// Already in the target state
    NoOp,
    /// Stale or backward event
    Ignored,
    UnknownTarget,
}

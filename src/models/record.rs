use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::base64_bytes;

/// Lifecycle of a content record.
///
/// `Pending -> Confirmed -> Rewarded` and `Pending -> Failed`. `Failed` and
/// `Rewarded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Confirmed,
    Failed,
    Rewarded,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Confirmed => "confirmed",
            FileStatus::Failed => "failed",
            FileStatus::Rewarded => "rewarded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(FileStatus::Pending),
            "confirmed" => Some(FileStatus::Confirmed),
            "failed" => Some(FileStatus::Failed),
            "rewarded" => Some(FileStatus::Rewarded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Failed | FileStatus::Rewarded)
    }

    /// The only forward moves a record can make.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Confirmed)
                | (FileStatus::Pending, FileStatus::Failed)
                | (FileStatus::Confirmed, FileStatus::Rewarded)
        )
    }

    /// The single state a record must be in to move to `self`.
    pub fn predecessor(&self) -> Option<FileStatus> {
        match self {
            FileStatus::Pending => None,
            FileStatus::Confirmed | FileStatus::Failed => Some(FileStatus::Pending),
            FileStatus::Rewarded => Some(FileStatus::Confirmed),
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted content record, one per CID
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub cid: String,
    pub uploader_address: String,
    pub file_size: i64,
    pub is_encrypted: bool,
    pub file_name: String,
    pub content_type: String,
    pub metadata: String,
    pub storage_provider: String,
    pub tx_hash: Option<String>,
    pub reward_tx_hash: Option<String>,
    pub status: FileStatus,
    pub created_at: String,
    pub updated_at: String,
    pub retired_at: Option<String>,
}

impl FileRecord {
    pub fn is_uploader(&self, address: &str) -> bool {
        self.uploader_address.eq_ignore_ascii_case(address)
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    pub fn size_bytes(&self) -> u64 {
        self.file_size.max(0) as u64
    }
}

/// Fields needed to insert a new `Pending` record
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub cid: String,
    pub uploader_address: String,
    pub file_size: u64,
    pub is_encrypted: bool,
    pub file_name: String,
    pub content_type: String,
    pub metadata: String,
    pub storage_provider: String,
}

/// Result of asking the state machine to move a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: FileStatus, to: FileStatus },
    /// Record already sits in the requested state
    Unchanged,
    /// The move would go backwards or sideways; nothing was written
    Rejected { current: FileStatus },
    UnknownRecord,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Upload request
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    #[serde(with = "base64_bytes")]
    pub file: Vec<u8>,
    pub file_name: String,
    pub content_type: Option<String>,
    #[serde(default)]
    pub should_encrypt: bool,
    pub metadata: Option<serde_json::Value>,
    pub storage_provider: Option<String>,
    pub user_address: String,
    pub signature: String,
}

/// Upload response; the record is still pending ledger confirmation
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub cid: String,
    pub status: FileStatus,
    pub file_size: u64,
    pub is_encrypted: bool,
    pub storage_provider: String,
    pub estimated_reward_wei: String,
}

/// Retrieve request
#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub cid: String,
    pub user_address: String,
    pub signature: String,
}

/// Retrieve response
#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub cid: String,
    #[serde(with = "base64_bytes")]
    pub file: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub is_encrypted: bool,
}

/// Soft-retire request
#[derive(Debug, Deserialize)]
pub struct RetireRequest {
    pub user_address: String,
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use FileStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Confirmed.can_transition_to(Rewarded));

        assert!(!Pending.can_transition_to(Rewarded));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Confirmed.can_transition_to(Pending));
        for next in [Pending, Confirmed, Failed, Rewarded] {
            assert!(!Failed.can_transition_to(next));
            assert!(!Rewarded.can_transition_to(next));
        }
    }

    #[test]
    fn test_predecessor_matches_transitions() {
        use FileStatus::*;
        for target in [Pending, Confirmed, Failed, Rewarded] {
            match target.predecessor() {
                Some(from) => assert!(from.can_transition_to(target)),
                None => assert_eq!(target, Pending),
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Confirmed,
            FileStatus::Failed,
            FileStatus::Rewarded,
        ] {
            assert_eq!(FileStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(FileStatus::from_str("CONFIRMED"), Some(FileStatus::Confirmed));
        assert_eq!(FileStatus::from_str("unknown"), None);
    }
}

use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{FileRecord, FileStatus, NewFileRecord, TransitionOutcome};

/// Owns the lifecycle of content records.
///
/// Every status write is a compare-and-set against the single legal
/// predecessor, so late or duplicated events can never move a record
/// backwards, and terminal states stay terminal.
pub struct RecordService;

impl RecordService {
    /// Insert a `Pending` record. A second insert of the same CID fails with
    /// a constraint violation.
    pub async fn create_pending(db: &Database, new: NewFileRecord) -> Result<FileRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO file_records (
                id, cid, uploader_address, file_size, is_encrypted, file_name,
                content_type, metadata, storage_provider, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.cid)
        .bind(new.uploader_address.to_lowercase())
        .bind(new.file_size as i64)
        .bind(new.is_encrypted)
        .bind(&new.file_name)
        .bind(&new.content_type)
        .bind(&new.metadata)
        .bind(&new.storage_provider)
        .bind(FileStatus::Pending)
        .bind(&now)
        .bind(&now)
        .execute(db.pool())
        .await?;

        tracing::debug!("Created pending record for {}", new.cid);
        Self::get_required(db, &new.cid).await
    }

    pub async fn get(db: &Database, cid: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as("SELECT * FROM file_records WHERE cid = ?")
            .bind(cid)
            .fetch_optional(db.pool())
            .await?;
        Ok(record)
    }

    pub async fn get_required(db: &Database, cid: &str) -> Result<FileRecord> {
        Self::get(db, cid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("File not found: {}", cid)))
    }

    pub async fn find_by_tx_hash(db: &Database, tx_hash: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as("SELECT * FROM file_records WHERE tx_hash = ? OR reward_tx_hash = ?")
            .bind(tx_hash)
            .bind(tx_hash)
            .fetch_optional(db.pool())
            .await?;
        Ok(record)
    }

    /// Move `cid` to `target` if, and only if, it currently sits in the
    /// target's predecessor state.
    pub async fn transition(
        db: &Database,
        cid: &str,
        target: FileStatus,
        tx_hash: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let Some(from) = target.predecessor() else {
            return Err(AppError::Validation("Records cannot return to pending".to_string()));
        };

        let sql = if target == FileStatus::Rewarded {
            "UPDATE file_records SET status = ?, reward_tx_hash = COALESCE(?, reward_tx_hash), updated_at = ? \
             WHERE cid = ? AND status = ?"
        } else {
            "UPDATE file_records SET status = ?, tx_hash = COALESCE(?, tx_hash), updated_at = ? \
             WHERE cid = ? AND status = ?"
        };

        let result = sqlx::query(sql)
            .bind(target)
            .bind(tx_hash)
            .bind(Utc::now().to_rfc3339())
            .bind(cid)
            .bind(from)
            .execute(db.pool())
            .await?;

        if result.rows_affected() == 1 {
            tracing::info!("Record {} moved {} -> {}", cid, from, target);
            return Ok(TransitionOutcome::Applied { from, to: target });
        }

        match Self::get(db, cid).await? {
            None => {
                tracing::warn!("Dropping {} transition for unknown record {}", target, cid);
                Ok(TransitionOutcome::UnknownRecord)
            }
            Some(record) if record.status == target => Ok(TransitionOutcome::Unchanged),
            Some(record) => {
                tracing::debug!(
                    "Ignoring {} transition for {} in state {}",
                    target,
                    cid,
                    record.status
                );
                Ok(TransitionOutcome::Rejected {
                    current: record.status,
                })
            }
        }
    }

    pub async fn confirm(db: &Database, cid: &str, tx_hash: &str) -> Result<TransitionOutcome> {
        Self::transition(db, cid, FileStatus::Confirmed, Some(tx_hash)).await
    }

    pub async fn fail(db: &Database, cid: &str) -> Result<TransitionOutcome> {
        Self::transition(db, cid, FileStatus::Failed, None).await
    }

    pub async fn mark_rewarded(
        db: &Database,
        cid: &str,
        tx_hash: Option<&str>,
    ) -> Result<TransitionOutcome> {
        Self::transition(db, cid, FileStatus::Rewarded, tx_hash).await
    }

    /// Hide a record from listings. Idempotent for the uploader.
    pub async fn retire(db: &Database, cid: &str, uploader: &str) -> Result<FileRecord> {
        let record = Self::get_required(db, cid).await?;
        if !record.is_uploader(uploader) {
            return Err(AppError::AccessDenied("Only the uploader can retire content".to_string()));
        }
        if record.is_retired() {
            return Ok(record);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE file_records SET retired_at = ?, updated_at = ? WHERE cid = ? AND retired_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(cid)
        .execute(db.pool())
        .await?;

        tracing::info!("Record {} retired by {}", cid, uploader);
        Self::get_required(db, cid).await
    }
}

use bytes::Bytes;
use serde_json::Value;

use super::access::AccessService;
use super::encryption::EncryptionService;
use super::record::RecordService;
use super::reward::RewardService;
use super::settlement::LedgerHandle;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    FileRecord, FileStatus, NewFileRecord, RetrieveResponse, RewardSchedule, UploadRequest,
    UploadResponse,
};
use crate::storage::StorageManager;

/// Upload and retrieval pipeline
pub struct FileService;

impl FileService {
    /// Store the payload, write a `Pending` record and hand the ledger
    /// write to the settlement queue. Returns before the ledger confirms.
    ///
    /// `file_name` must already be sanitized and `uploader` authenticated.
    pub async fn upload(
        db: &Database,
        storage: &StorageManager,
        ledger: &LedgerHandle,
        schedule: &RewardSchedule,
        auto_claim: bool,
        uploader: &str,
        file_name: String,
        req: UploadRequest,
    ) -> Result<UploadResponse> {
        let uploader = uploader.to_lowercase();
        let provider = storage.get_provider(req.storage_provider.as_deref())?;
        let file_size = req.file.len() as u64;
        let is_encrypted = req.should_encrypt;

        let payload = if is_encrypted {
            let key = EncryptionService::get_or_create_key(db, &uploader).await?;
            EncryptionService::encrypt(&req.file, &key.key_bytes()?)?
        } else {
            req.file
        };

        let cid = provider.upload(Bytes::from(payload), &file_name).await?;
        tracing::info!(
            "Stored {} ({} bytes, encrypted: {}) as {} on {}",
            file_name,
            file_size,
            is_encrypted,
            cid,
            provider.storage_type()
        );

        let metadata = req.metadata.unwrap_or_else(|| Value::Object(Default::default()));
        let metadata = serde_json::to_string(&metadata)
            .map_err(|e| AppError::Validation(format!("Invalid metadata: {}", e)))?;

        let record = RecordService::create_pending(
            db,
            NewFileRecord {
                cid: cid.clone(),
                uploader_address: uploader.clone(),
                file_size,
                is_encrypted,
                file_name,
                content_type: req
                    .content_type
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                metadata: metadata.clone(),
                storage_provider: provider.storage_type().to_string(),
            },
        )
        .await?;

        Self::schedule_record(db, ledger, &record, metadata, auto_claim);

        Ok(UploadResponse {
            cid,
            status: record.status,
            file_size,
            is_encrypted,
            storage_provider: record.storage_provider,
            estimated_reward_wei: schedule.calculate(file_size, is_encrypted).to_string(),
        })
    }

    fn schedule_record(
        db: &Database,
        ledger: &LedgerHandle,
        record: &FileRecord,
        metadata: String,
        auto_claim: bool,
    ) {
        let job = RecordJob {
            db: db.clone(),
            ledger: ledger.clone(),
            cid: record.cid.clone(),
            uploader: record.uploader_address.clone(),
            size: record.size_bytes(),
            encrypted: record.is_encrypted,
            metadata,
            auto_claim,
        };
        let fallback_db = db.clone();
        let fallback_cid = record.cid.clone();

        ledger.queue.submit_with_fallback(
            "record_upload",
            record.cid.clone(),
            move || job.clone().run(),
            move || async move {
                match RecordService::fail(&fallback_db, &fallback_cid).await {
                    Ok(outcome) => tracing::warn!("Record {} marked failed: {:?}", fallback_cid, outcome),
                    Err(e) => tracing::error!("Could not mark {} failed: {}", fallback_cid, e),
                }
            },
        );
    }

    /// Return the content if `requester` may read it. Encrypted content is
    /// decrypted with the uploader's key.
    pub async fn retrieve(
        db: &Database,
        storage: &StorageManager,
        ledger: &LedgerHandle,
        cid: &str,
        requester: &str,
    ) -> Result<RetrieveResponse> {
        let record = RecordService::get_required(db, cid).await?;

        let source = AccessService::check_access_at(db, ledger, cid, requester, chrono::Utc::now())
            .await?
            .ok_or_else(|| AppError::AccessDenied(format!("No access to {}", cid)))?;
        tracing::debug!("{} reads {} via {:?}", requester, cid, source);

        let provider = storage.get_provider(Some(&record.storage_provider))?;
        let blob = provider.retrieve(cid).await?;

        let file = if record.is_encrypted {
            let key = EncryptionService::find_key(db, &record.uploader_address)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(format!("Missing encryption key for {}", record.uploader_address))
                })?;
            EncryptionService::decrypt(&blob, &key.key_bytes()?)?
        } else {
            blob.to_vec()
        };

        let metadata = serde_json::from_str(&record.metadata)
            .unwrap_or_else(|_| Value::Object(Default::default()));

        Ok(RetrieveResponse {
            cid: record.cid,
            file,
            file_name: record.file_name,
            content_type: record.content_type,
            metadata,
            is_encrypted: record.is_encrypted,
        })
    }

    pub async fn get_record(db: &Database, cid: &str) -> Result<FileRecord> {
        RecordService::get_required(db, cid).await
    }

    pub async fn retire(db: &Database, cid: &str, uploader: &str) -> Result<FileRecord> {
        RecordService::retire(db, cid, uploader).await
    }
}

/// Background ledger write for one upload
#[derive(Clone)]
struct RecordJob {
    db: Database,
    ledger: LedgerHandle,
    cid: String,
    uploader: String,
    size: u64,
    encrypted: bool,
    metadata: String,
    auto_claim: bool,
}

impl RecordJob {
    async fn run(self) -> Result<()> {
        let result = self
            .ledger
            .call(self.ledger.client.record_upload(
                &self.cid,
                &self.uploader,
                self.size,
                self.encrypted,
                &self.metadata,
            ))
            .await;

        let tx_hash = match result {
            Ok(tx_hash) => Some(tx_hash),
            // A lost reply or an earlier attempt may already have landed
            Err(e) => match self.recorded_on_ledger().await {
                Some(true) => {
                    tracing::info!("Upload {} already on the ledger after: {}", self.cid, e);
                    None
                }
                Some(false) => {
                    tracing::error!("Upload {} is recorded for another uploader", self.cid);
                    RecordService::fail(&self.db, &self.cid).await?;
                    return Err(e.into());
                }
                None if e.is_retryable() => return Err(e.into()),
                None => {
                    // Rejected outright; no retry will change the answer
                    RecordService::fail(&self.db, &self.cid).await?;
                    return Err(e.into());
                }
            },
        };

        let outcome =
            RecordService::transition(&self.db, &self.cid, FileStatus::Confirmed, tx_hash.as_deref())
                .await?;
        tracing::info!("Upload {} recorded in {:?}: {:?}", self.cid, tx_hash, outcome);

        if self.auto_claim && outcome.is_applied() {
            let db = self.db.clone();
            let ledger = self.ledger.clone();
            let cid = self.cid.clone();
            self.ledger.queue.submit("auto_claim", self.cid.clone(), move || {
                let db = db.clone();
                let ledger = ledger.clone();
                let cid = cid.clone();
                async move { RewardService::auto_claim(&db, &ledger, &cid).await }
            });
        }
        Ok(())
    }

    /// Whether the ledger holds this CID, and for this uploader. None when
    /// it has no entry or cannot be asked.
    async fn recorded_on_ledger(&self) -> Option<bool> {
        match self.ledger.call(self.ledger.client.reward_entry(&self.cid)).await {
            Ok(Some(entry)) => Some(entry.uploader.eq_ignore_ascii_case(&self.uploader)),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("Reward entry lookup for {} failed: {}", self.cid, e);
                None
            }
        }
    }
}

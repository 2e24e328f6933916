use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::access::AccessService;
use super::record::RecordService;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{EventEnvelope, FileStatus, LedgerEvent, ReconcileOutcome, TransitionOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook MAC, `sha256=<hex>`
pub const SIGNATURE_HEADER: &str = "x-signature-256";

/// Applies externally delivered ledger events to local state.
///
/// Every handler is an idempotent forward-only transition, so duplicate,
/// delayed and reordered deliveries converge on the same state.
pub struct ReconciliationService;

impl ReconciliationService {
    /// Check the HMAC-SHA256 tag over the raw body. The comparison is
    /// constant time. An empty secret rejects everything.
    pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
        if secret.is_empty() {
            tracing::warn!("Webhook rejected: no secret configured");
            return Err(AppError::Authentication);
        }
        let header = header.ok_or(AppError::Authentication)?;
        let hex_tag = header.trim();
        let hex_tag = hex_tag.strip_prefix("sha256=").unwrap_or(hex_tag);
        let tag = hex::decode(hex_tag).map_err(|_| AppError::Authentication)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Authentication)?;
        mac.update(body);
        mac.verify_slice(&tag).map_err(|_| {
            tracing::warn!("Webhook rejected: signature mismatch");
            AppError::Authentication
        })
    }

    /// Authenticate, decode and apply one delivery.
    pub async fn handle(
        db: &Database,
        secret: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<ReconcileOutcome> {
        Self::verify_signature(secret, body, signature)?;

        let envelope: EventEnvelope = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid event payload: {}", e)))?;
        let event = envelope.parse()?;

        let outcome = Self::apply(db, event).await?;
        tracing::info!("Reconciled {} event: {:?}", envelope.event_type, outcome);
        Ok(outcome)
    }

    pub async fn apply(db: &Database, event: LedgerEvent) -> Result<ReconcileOutcome> {
        match event {
            LedgerEvent::UploadConfirmed { cid, tx_hash } => {
                let outcome =
                    RecordService::transition(db, &cid, FileStatus::Confirmed, tx_hash.as_deref())
                        .await?;
                Ok(outcome_of(outcome))
            }
            LedgerEvent::UploadFailed { cid } => {
                let outcome = RecordService::fail(db, &cid).await?;
                Ok(outcome_of(outcome))
            }
            LedgerEvent::RewardClaimed { cid, tx_hash } => {
                // A claim implies the record transaction landed; catch up
                // through Confirmed if that event never arrived
                let first = RecordService::mark_rewarded(db, &cid, tx_hash.as_deref()).await?;
                if first
                    == (TransitionOutcome::Rejected {
                        current: FileStatus::Pending,
                    })
                {
                    RecordService::transition(db, &cid, FileStatus::Confirmed, None).await?;
                    let second =
                        RecordService::mark_rewarded(db, &cid, tx_hash.as_deref()).await?;
                    return Ok(outcome_of(second));
                }
                Ok(outcome_of(first))
            }
            LedgerEvent::AccessGranted {
                cid,
                granter,
                grantee,
                expiry,
                block,
            } => AccessService::apply_granted_event(db, &cid, &granter, &grantee, expiry, block).await,
            LedgerEvent::AccessRevoked {
                cid,
                grantee,
                block,
            } => AccessService::apply_revoked_event(db, &cid, &grantee, block).await,
            LedgerEvent::TransactionConfirmed { tx_hash } => {
                let Some(record) = RecordService::find_by_tx_hash(db, &tx_hash).await? else {
                    tracing::warn!("Dropping confirmation for unknown transaction {}", tx_hash);
                    return Ok(ReconcileOutcome::UnknownTarget);
                };
                if record.status == FileStatus::Pending {
                    let outcome = RecordService::confirm(db, &record.cid, &tx_hash).await?;
                    return Ok(outcome_of(outcome));
                }
                Ok(ReconcileOutcome::NoOp)
            }
            LedgerEvent::TransactionFailed { tx_hash } => {
                let Some(record) = RecordService::find_by_tx_hash(db, &tx_hash).await? else {
                    tracing::warn!("Dropping failure for unknown transaction {}", tx_hash);
                    return Ok(ReconcileOutcome::UnknownTarget);
                };
                match record.status {
                    FileStatus::Pending => {
                        let outcome = RecordService::fail(db, &record.cid).await?;
                        Ok(outcome_of(outcome))
                    }
                    FileStatus::Failed => Ok(ReconcileOutcome::NoOp),
                    status => {
                        tracing::warn!(
                            "Ledger reports {} failed but record {} is {}; ignoring",
                            tx_hash,
                            record.cid,
                            status
                        );
                        Ok(ReconcileOutcome::Ignored)
                    }
                }
            }
        }
    }
}

fn outcome_of(outcome: TransitionOutcome) -> ReconcileOutcome {
    match outcome {
        TransitionOutcome::Applied { .. } => ReconcileOutcome::Applied,
        TransitionOutcome::Unchanged => ReconcileOutcome::NoOp,
        TransitionOutcome::Rejected { .. } => ReconcileOutcome::Ignored,
        TransitionOutcome::UnknownRecord => ReconcileOutcome::UnknownTarget,
    }
}

/// `sha256=<hex>` tag for `body`, as senders compute it
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid HMAC key: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewFileRecord;

    const SECRET: &str = "whsec_test";

    async fn db_with_record(cid: &str) -> Database {
        let db = Database::in_memory().await.unwrap();
        RecordService::create_pending(
            &db,
            NewFileRecord {
                cid: cid.into(),
                uploader_address: "0x00000000000000000000000000000000000000a1".into(),
                file_size: 1,
                is_encrypted: false,
                file_name: "x".into(),
                content_type: "text/plain".into(),
                metadata: "{}".into(),
                storage_provider: "local".into(),
            },
        )
        .await
        .unwrap();
        db
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"type":"upload_failed","cid":"a"}"#;
        let tag = sign_payload(SECRET, body).unwrap();

        assert!(ReconciliationService::verify_signature(SECRET, body, Some(&tag)).is_ok());
        // bare hex is accepted too
        let bare = tag.trim_start_matches("sha256=");
        assert!(ReconciliationService::verify_signature(SECRET, body, Some(bare)).is_ok());

        for header in [None, Some("sha256=zz"), Some("sha256=00")] {
            assert!(ReconciliationService::verify_signature(SECRET, body, header).is_err());
        }
        assert!(ReconciliationService::verify_signature("other", body, Some(&tag)).is_err());
        assert!(ReconciliationService::verify_signature("", body, Some(&tag)).is_err());
        assert!(ReconciliationService::verify_signature(SECRET, b"tampered", Some(&tag)).is_err());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let db = db_with_record("cid").await;
        let event = LedgerEvent::UploadConfirmed {
            cid: "cid".into(),
            tx_hash: Some("0x1".into()),
        };

        assert_eq!(
            ReconciliationService::apply(&db, event.clone()).await.unwrap(),
            ReconcileOutcome::Applied
        );
        let after_first = RecordService::get_required(&db, "cid").await.unwrap();

        assert_eq!(
            ReconciliationService::apply(&db, event).await.unwrap(),
            ReconcileOutcome::NoOp
        );
        let after_second = RecordService::get_required(&db, "cid").await.unwrap();
        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.tx_hash, after_second.tx_hash);
    }

    #[tokio::test]
    async fn test_rewarded_never_regresses() {
        let db = db_with_record("cid").await;
        ReconciliationService::apply(
            &db,
            LedgerEvent::RewardClaimed {
                cid: "cid".into(),
                tx_hash: Some("0xclaim".into()),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            RecordService::get_required(&db, "cid").await.unwrap().status,
            FileStatus::Rewarded
        );

        let late = [
            LedgerEvent::UploadConfirmed {
                cid: "cid".into(),
                tx_hash: Some("0xlate".into()),
            },
            LedgerEvent::UploadFailed { cid: "cid".into() },
            LedgerEvent::TransactionFailed {
                tx_hash: "0xclaim".into(),
            },
            LedgerEvent::TransactionConfirmed {
                tx_hash: "0xclaim".into(),
            },
        ];
        for event in late {
            let outcome = ReconciliationService::apply(&db, event).await.unwrap();
            assert_ne!(outcome, ReconcileOutcome::Applied);
            assert_eq!(
                RecordService::get_required(&db, "cid").await.unwrap().status,
                FileStatus::Rewarded
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_cid_is_dropped() {
        let db = Database::in_memory().await.unwrap();
        let outcome = ReconciliationService::apply(&db, LedgerEvent::UploadFailed { cid: "ghost".into() })
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::UnknownTarget);
    }

    #[tokio::test]
    async fn test_handle_end_to_end() {
        let db = db_with_record("cid").await;
        let body = br#"{"type":"FileUploaded","tx_hash":"0xabc","data":{"cid":"cid"}}"#;
        let tag = sign_payload(SECRET, body).unwrap();

        let outcome = ReconciliationService::handle(&db, SECRET, body, Some(&tag))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let err = ReconciliationService::handle(&db, SECRET, b"not json", Some(&sign_payload(SECRET, b"not json").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}

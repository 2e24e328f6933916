use std::collections::HashSet;

use super::record::RecordService;
use super::settlement::LedgerHandle;
use crate::db::Database;
use crate::error::{AppError, LedgerError, Result};
use crate::models::{
    format_amount, Amount, BatchClaimReceipt, ClaimReceipt, FileStatus, RewardBalance,
    RewardPreview, RewardSchedule, SkipReason, SkippedClaim,
};

/// Reward settlement. The ledger's claimed flag is authoritative; the
/// local status check only avoids submitting transactions that are bound
/// to revert.
pub struct RewardService;

impl RewardService {
    pub fn preview(schedule: &RewardSchedule, size: u64, encrypted: bool) -> RewardPreview {
        let amount = schedule.calculate(size, encrypted);
        RewardPreview {
            size,
            encrypted,
            amount_wei: amount.to_string(),
            amount: format_amount(amount),
        }
    }

    /// Claim the reward for one confirmed record owned by `claimant`.
    pub async fn claim(
        db: &Database,
        ledger: &LedgerHandle,
        schedule: &RewardSchedule,
        cid: &str,
        claimant: &str,
    ) -> Result<ClaimReceipt> {
        let record = RecordService::get_required(db, cid).await?;
        if !record.is_uploader(claimant) {
            return Err(AppError::AccessDenied(
                "Only the uploader can claim this reward".to_string(),
            ));
        }
        match record.status {
            FileStatus::Confirmed => {}
            FileStatus::Rewarded => return Err(LedgerError::AlreadyClaimed.into()),
            other => {
                return Err(AppError::Validation(format!(
                    "File is {}; only confirmed uploads can be claimed",
                    other
                )))
            }
        }

        let tx_hash = ledger.call(ledger.client.claim_reward(cid)).await?;

        let outcome = RecordService::mark_rewarded(db, cid, Some(&tx_hash)).await?;
        if !outcome.is_applied() {
            tracing::warn!("Claim {} settled but local record moved on: {:?}", cid, outcome);
        }

        let amount = schedule.calculate(record.size_bytes(), record.is_encrypted);
        tracing::info!("Reward for {} claimed in {} ({} wei)", cid, tx_hash, amount);

        Ok(ClaimReceipt {
            cid: cid.to_string(),
            tx_hash,
            amount_wei: amount.to_string(),
        })
    }

    /// Claim right after the record transaction confirms.
    ///
    /// A claim that already landed elsewhere is the expected outcome of a
    /// race, not a failure. Any other error leaves the record `Confirmed`
    /// for a manual claim.
    pub async fn auto_claim(db: &Database, ledger: &LedgerHandle, cid: &str) -> Result<()> {
        let Some(record) = RecordService::get(db, cid).await? else {
            tracing::warn!("Auto-claim skipped, record {} not found", cid);
            return Ok(());
        };
        if record.status != FileStatus::Confirmed {
            tracing::debug!("Auto-claim skipped for {} in state {}", cid, record.status);
            return Ok(());
        }

        match ledger.call(ledger.client.claim_reward(cid)).await {
            Ok(tx_hash) => {
                RecordService::mark_rewarded(db, cid, Some(&tx_hash)).await?;
                tracing::info!("Auto-claimed reward for {} in {}", cid, tx_hash);
                Ok(())
            }
            Err(LedgerError::AlreadyClaimed) => {
                tracing::info!("Reward for {} was already claimed", cid);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Settle every eligible record in one transaction. Ineligible entries
    /// are reported as skipped and never abort the batch.
    pub async fn batch_claim(
        db: &Database,
        ledger: &LedgerHandle,
        schedule: &RewardSchedule,
        cids: &[String],
        claimant: &str,
    ) -> Result<BatchClaimReceipt> {
        let mut seen = HashSet::new();
        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        let mut total: Amount = 0;

        for cid in cids {
            if !seen.insert(cid.as_str()) {
                skipped.push(SkippedClaim {
                    cid: cid.clone(),
                    reason: SkipReason::Duplicate,
                });
                continue;
            }

            let reason = match RecordService::get(db, cid).await? {
                None => Some(SkipReason::NotFound),
                Some(record) if !record.is_uploader(claimant) => Some(SkipReason::NotOwner),
                Some(record) if record.status == FileStatus::Rewarded => {
                    Some(SkipReason::AlreadyRewarded)
                }
                Some(record) if record.status != FileStatus::Confirmed => {
                    Some(SkipReason::NotConfirmed)
                }
                Some(record) => {
                    if Self::claimed_on_ledger(ledger, cid).await {
                        // Bring the local copy in line with the ledger
                        RecordService::mark_rewarded(db, cid, None).await?;
                        Some(SkipReason::AlreadyRewarded)
                    } else {
                        total = total
                            .saturating_add(schedule.calculate(record.size_bytes(), record.is_encrypted));
                        None
                    }
                }
            };

            match reason {
                Some(reason) => skipped.push(SkippedClaim {
                    cid: cid.clone(),
                    reason,
                }),
                None => eligible.push(cid.clone()),
            }
        }

        if eligible.is_empty() {
            return Ok(BatchClaimReceipt {
                tx_hash: None,
                claimed: Vec::new(),
                skipped,
                total_wei: "0".to_string(),
            });
        }

        let tx_hash = ledger.call(ledger.client.claim_rewards(&eligible)).await?;
        for cid in &eligible {
            RecordService::mark_rewarded(db, cid, Some(&tx_hash)).await?;
        }

        tracing::info!(
            "Batch claim of {} reward(s) for {} in {}",
            eligible.len(),
            claimant,
            tx_hash
        );

        Ok(BatchClaimReceipt {
            tx_hash: Some(tx_hash),
            claimed: eligible,
            skipped,
            total_wei: total.to_string(),
        })
    }

    /// Ledger read failures are treated as "not claimed"; the batch
    /// transaction is still the final arbiter.
    async fn claimed_on_ledger(ledger: &LedgerHandle, cid: &str) -> bool {
        match ledger.call(ledger.client.reward_entry(cid)).await {
            Ok(entry) => entry.map(|e| e.reward_claimed).unwrap_or(false),
            Err(e) => {
                tracing::warn!("Could not read ledger entry for {}: {}", cid, e);
                false
            }
        }
    }

    pub async fn balance(ledger: &LedgerHandle, address: &str) -> Result<RewardBalance> {
        let balance = ledger.call(ledger.client.reward_balance(address)).await?;
        Ok(RewardBalance {
            address: address.to_lowercase(),
            balance_wei: balance.to_string(),
            balance: format_amount(balance),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerClient};
    use crate::models::NewFileRecord;
    use crate::services::settlement::{RetryPolicy, SettlementQueue};
    use std::sync::Arc;
    use std::time::Duration;

    const UPLOADER: &str = "0x00000000000000000000000000000000000000a1";
    const OTHER: &str = "0x00000000000000000000000000000000000000b2";

    fn schedule() -> RewardSchedule {
        RewardSchedule {
            base: 100,
            size_multiplier: 10,
            encryption_bonus: 5,
        }
    }

    async fn setup() -> (Database, Arc<InMemoryLedger>, LedgerHandle) {
        let db = Database::in_memory().await.unwrap();
        let ledger = Arc::new(InMemoryLedger::new(schedule()));
        let handle = LedgerHandle::new(
            ledger.clone(),
            SettlementQueue::new(RetryPolicy::default()),
            Duration::from_secs(5),
        );
        (db, ledger, handle)
    }

    async fn confirmed(db: &Database, ledger: &InMemoryLedger, cid: &str, size: u64) {
        RecordService::create_pending(
            db,
            NewFileRecord {
                cid: cid.into(),
                uploader_address: UPLOADER.into(),
                file_size: size,
                is_encrypted: false,
                file_name: "f.bin".into(),
                content_type: "application/octet-stream".into(),
                metadata: "{}".into(),
                storage_provider: "local".into(),
            },
        )
        .await
        .unwrap();
        let tx = ledger.record_upload(cid, UPLOADER, size, false, "{}").await.unwrap();
        RecordService::confirm(db, cid, &tx).await.unwrap();
    }

    #[test]
    fn test_preview() {
        let preview = RewardService::preview(&schedule(), 2048, true);
        assert_eq!(preview.amount_wei, "125");
    }

    #[tokio::test]
    async fn test_claim_then_second_claim_rejected_locally() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "cid", 1024).await;

        let receipt = RewardService::claim(&db, &handle, &schedule(), "cid", UPLOADER)
            .await
            .unwrap();
        assert_eq!(receipt.amount_wei, "110");
        let record = RecordService::get_required(&db, "cid").await.unwrap();
        assert_eq!(record.status, FileStatus::Rewarded);
        assert_eq!(record.reward_tx_hash.as_deref(), Some(receipt.tx_hash.as_str()));

        let err = RewardService::claim(&db, &handle, &schedule(), "cid", UPLOADER)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::AlreadyClaimed)));
        assert_eq!(ledger.submitted("claim_reward").await, 1);
    }

    #[tokio::test]
    async fn test_claim_guards() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "cid", 1024).await;

        let err = RewardService::claim(&db, &handle, &schedule(), "cid", OTHER)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(_)));

        let err = RewardService::claim(&db, &handle, &schedule(), "nope", UPLOADER)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ledger_rejection_leaves_record_confirmed() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "cid", 1024).await;
        ledger.claim_reward("cid").await.unwrap();

        let err = RewardService::claim(&db, &handle, &schedule(), "cid", UPLOADER)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::AlreadyClaimed)));
        let record = RecordService::get_required(&db, "cid").await.unwrap();
        assert_eq!(record.status, FileStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_auto_claim_race_is_not_an_error() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "cid", 1024).await;
        ledger.claim_reward("cid").await.unwrap();

        RewardService::auto_claim(&db, &handle, "cid").await.unwrap();
        let record = RecordService::get_required(&db, "cid").await.unwrap();
        assert_eq!(record.status, FileStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_auto_claim_failure_keeps_manual_path() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "cid", 1024).await;
        ledger.fail_next(1).await;

        let err = RewardService::auto_claim(&db, &handle, "cid").await.unwrap_err();
        assert!(err.is_retryable());
        RewardService::claim(&db, &handle, &schedule(), "cid", UPLOADER)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_claim_skips_ineligible() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "a", 1024).await;
        confirmed(&db, &ledger, "b", 2048).await;
        confirmed(&db, &ledger, "c", 0).await;
        RewardService::claim(&db, &handle, &schedule(), "c", UPLOADER)
            .await
            .unwrap();

        let cids: Vec<String> = ["a", "b", "a", "c", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let receipt = RewardService::batch_claim(&db, &handle, &schedule(), &cids, UPLOADER)
            .await
            .unwrap();

        assert_eq!(receipt.claimed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(receipt.total_wei, (110 + 120).to_string());
        let reasons: Vec<_> = receipt.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![SkipReason::Duplicate, SkipReason::AlreadyRewarded, SkipReason::NotFound]
        );
        assert_eq!(ledger.submitted("claim_rewards").await, 1);
        assert_eq!(ledger.reward_balance(UPLOADER).await.unwrap(), 110 + 120 + 100);
    }

    #[tokio::test]
    async fn test_batch_claim_with_nothing_eligible() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "a", 1024).await;

        let receipt = RewardService::batch_claim(&db, &handle, &schedule(), &["a".to_string()], OTHER)
            .await
            .unwrap();
        assert!(receipt.tx_hash.is_none());
        assert_eq!(receipt.skipped[0].reason, SkipReason::NotOwner);
        assert_eq!(ledger.submitted("claim_rewards").await, 0);
    }

    #[tokio::test]
    async fn test_batch_claim_syncs_ledger_claimed_flag() {
        let (db, ledger, handle) = setup().await;
        confirmed(&db, &ledger, "a", 1024).await;
        confirmed(&db, &ledger, "b", 1024).await;
        ledger.claim_reward("a").await.unwrap();

        let receipt = RewardService::batch_claim(
            &db,
            &handle,
            &schedule(),
            &["a".to_string(), "b".to_string()],
            UPLOADER,
        )
        .await
        .unwrap();
        assert_eq!(receipt.claimed, vec!["b".to_string()]);
        assert_eq!(
            RecordService::get_required(&db, "a").await.unwrap().status,
            FileStatus::Rewarded
        );
    }
}

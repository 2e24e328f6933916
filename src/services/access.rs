use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::RecordService;
use super::settlement::LedgerHandle;
use super::validation;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{AccessGrant, AccessGrantView, AccessSource, GrantExpiry, ReconcileOutcome};

/// Time-bounded capability grants.
///
/// Local rows are written synchronously; the ledger copy is mirrored in
/// the background. Mirrors for the same (cid, grantee) pair run in the
/// order they were requested.
pub struct AccessService;

fn mirror_key(cid: &str, grantee: &str) -> String {
    format!("{}:{}", cid, grantee)
}

impl AccessService {
    pub async fn grant(
        db: &Database,
        ledger: &LedgerHandle,
        cid: &str,
        granter: &str,
        grantee: &str,
        duration_secs: u64,
    ) -> Result<AccessGrant> {
        Self::grant_at(db, ledger, cid, granter, grantee, duration_secs, Utc::now()).await
    }

    pub async fn grant_at(
        db: &Database,
        ledger: &LedgerHandle,
        cid: &str,
        granter: &str,
        grantee: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant> {
        let granter = validation::address(granter)?;
        let grantee = validation::address(grantee)?;
        validation::grant_duration(duration_secs)?;

        let record = RecordService::get_required(db, cid).await?;
        if !record.is_uploader(&granter) {
            return Err(AppError::AccessDenied(
                "Only the uploader can grant access".to_string(),
            ));
        }
        if record.is_uploader(&grantee) {
            return Err(AppError::Validation(
                "The uploader already has access".to_string(),
            ));
        }

        let expiry = GrantExpiry::from_duration(now, duration_secs);
        let timestamp = Utc::now().to_rfc3339();

        // Re-granting reactivates the row and replaces its expiry
        sqlx::query(
            r#"
            INSERT INTO access_grants (
                id, cid, grantee_address, granter_address, expiry_kind, expires_at,
                is_active, tx_hash, last_event_block, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 1, NULL, 0, ?, ?)
            ON CONFLICT (cid, grantee_address) DO UPDATE SET
                granter_address = excluded.granter_address,
                expiry_kind = excluded.expiry_kind,
                expires_at = excluded.expires_at,
                is_active = 1,
                revoke_pending = 0,
                tx_hash = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(cid)
        .bind(&grantee)
        .bind(&granter)
        .bind(expiry.kind_str())
        .bind(expiry.unix_timestamp())
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(db.pool())
        .await?;

        tracing::info!("Access to {} granted to {} ({:?})", cid, grantee, expiry);

        let grant = Self::find_grant(db, cid, &grantee)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Grant for {} vanished", cid)))?;

        Self::mirror_grant(db, ledger, cid, &grantee, duration_secs);
        Ok(grant)
    }

    fn mirror_grant(
        db: &Database,
        ledger: &LedgerHandle,
        cid: &str,
        grantee: &str,
        duration_secs: u64,
    ) {
        let db = db.clone();
        let handle = ledger.clone();
        let cid = cid.to_string();
        let grantee = grantee.to_string();

        ledger.queue.submit_ordered(
            "grant_access",
            mirror_key(&cid, &grantee),
            cid.clone(),
            move || {
                mirror_grant_job(
                    db.clone(),
                    handle.clone(),
                    cid.clone(),
                    grantee.clone(),
                    duration_secs,
                )
            },
        );
    }

    /// Deactivate a grant. Grants that exist only on the ledger are
    /// revoked too, leaving an inactive local row behind.
    pub async fn revoke(
        db: &Database,
        ledger: &LedgerHandle,
        cid: &str,
        granter: &str,
        grantee: &str,
    ) -> Result<AccessGrant> {
        let granter = validation::address(granter)?;
        let grantee = validation::address(grantee)?;

        let record = RecordService::get_required(db, cid).await?;
        if !record.is_uploader(&granter) {
            return Err(AppError::AccessDenied(
                "Only the uploader can revoke access".to_string(),
            ));
        }
        if record.is_uploader(&grantee) {
            return Err(AppError::Validation(
                "The uploader's access cannot be revoked".to_string(),
            ));
        }

        let locally_active = Self::find_grant(db, cid, &grantee)
            .await?
            .map(|g| g.is_active)
            .unwrap_or(false);

        if !locally_active {
            let on_ledger = Self::ledger_has_access(ledger, cid, &grantee).await;
            if !on_ledger {
                return Err(AppError::NotFound(format!(
                    "No active grant for {} on {}",
                    grantee, cid
                )));
            }
        }

        let timestamp = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO access_grants (
                id, cid, grantee_address, granter_address, expiry_kind, expires_at,
                is_active, revoke_pending, tx_hash, last_event_block, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'permanent', NULL, 0, 1, NULL, 0, ?, ?)
            ON CONFLICT (cid, grantee_address) DO UPDATE SET
                is_active = 0,
                revoke_pending = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(cid)
        .bind(&grantee)
        .bind(&granter)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(db.pool())
        .await?;

        tracing::info!("Access to {} revoked for {}", cid, grantee);

        Self::mirror_revoke(db, ledger, cid, &grantee);

        Self::find_grant(db, cid, &grantee)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Grant for {} vanished", cid)))
    }

    fn mirror_revoke(db: &Database, ledger: &LedgerHandle, cid: &str, grantee: &str) {
        let db = db.clone();
        let handle = ledger.clone();
        let cid = cid.to_string();
        let grantee = grantee.to_string();

        ledger.queue.submit_ordered(
            "revoke_access",
            mirror_key(&cid, &grantee),
            cid.clone(),
            move || mirror_revoke_job(db.clone(), handle.clone(), cid.clone(), grantee.clone()),
        );
    }

    pub async fn find_grant(
        db: &Database,
        cid: &str,
        grantee: &str,
    ) -> Result<Option<AccessGrant>> {
        let grant = sqlx::query_as(
            "SELECT * FROM access_grants WHERE cid = ? AND grantee_address = ?",
        )
        .bind(cid)
        .bind(grantee.to_lowercase())
        .fetch_optional(db.pool())
        .await?;
        Ok(grant)
    }

    /// Grants on a record, visible to its uploader only
    pub async fn list_grants(
        db: &Database,
        cid: &str,
        uploader: &str,
    ) -> Result<Vec<AccessGrantView>> {
        let record = RecordService::get_required(db, cid).await?;
        if !record.is_uploader(uploader) {
            return Err(AppError::AccessDenied(
                "Only the uploader can list grants".to_string(),
            ));
        }

        let grants: Vec<AccessGrant> = sqlx::query_as(
            "SELECT * FROM access_grants WHERE cid = ? ORDER BY created_at DESC",
        )
        .bind(cid)
        .fetch_all(db.pool())
        .await?;

        Ok(grants.into_iter().map(AccessGrantView::from).collect())
    }

    pub async fn has_access(
        db: &Database,
        ledger: &LedgerHandle,
        cid: &str,
        address: &str,
    ) -> Result<bool> {
        Ok(Self::check_access_at(db, ledger, cid, address, Utc::now())
            .await?
            .is_some())
    }

    /// Which source, if any, grants `address` access to `cid` at `now`.
    ///
    /// Uploader first, then an effective local grant, then the ledger. A
    /// local revoke whose ledger mirror has not landed yet skips the ledger,
    /// which may still hold the old grant.
    pub async fn check_access_at(
        db: &Database,
        ledger: &LedgerHandle,
        cid: &str,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessSource>> {
        let address = address.to_lowercase();

        if let Some(record) = RecordService::get(db, cid).await? {
            if record.is_uploader(&address) {
                return Ok(Some(AccessSource::Uploader));
            }
        }

        if let Some(grant) = Self::find_grant(db, cid, &address).await? {
            if grant.is_effective_at(now) {
                return Ok(Some(AccessSource::LocalGrant));
            }
            if grant.revoke_pending {
                return Ok(None);
            }
        }

        if Self::ledger_has_access(ledger, cid, &address).await {
            return Ok(Some(AccessSource::Ledger));
        }
        Ok(None)
    }

    /// Ledger failures count as "no access"
    async fn ledger_has_access(ledger: &LedgerHandle, cid: &str, address: &str) -> bool {
        match ledger.call(ledger.client.has_access(cid, address)).await {
            Ok(has) => has,
            Err(e) => {
                tracing::warn!("Ledger access check for {} on {} failed: {}", address, cid, e);
                false
            }
        }
    }

    /// Apply an `access_granted` event observed on the ledger.
    pub async fn apply_granted_event(
        db: &Database,
        cid: &str,
        granter: &str,
        grantee: &str,
        expiry: GrantExpiry,
        block: u64,
    ) -> Result<ReconcileOutcome> {
        if RecordService::get(db, cid).await?.is_none() {
            tracing::warn!("Dropping access_granted event for unknown record {}", cid);
            return Ok(ReconcileOutcome::UnknownTarget);
        }

        let block = block as i64;
        if let Some(existing) = Self::find_grant(db, cid, grantee).await? {
            if existing.last_event_block > block {
                tracing::debug!("Ignoring stale access_granted event for {} at block {}", cid, block);
                return Ok(ReconcileOutcome::Ignored);
            }
            if existing.is_active
                && existing.expiry() == expiry
                && existing.last_event_block == block
            {
                return Ok(ReconcileOutcome::NoOp);
            }
        }

        let timestamp = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO access_grants (
                id, cid, grantee_address, granter_address, expiry_kind, expires_at,
                is_active, tx_hash, last_event_block, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 1, NULL, ?, ?, ?)
            ON CONFLICT (cid, grantee_address) DO UPDATE SET
                granter_address = excluded.granter_address,
                expiry_kind = excluded.expiry_kind,
                expires_at = excluded.expires_at,
                is_active = 1,
                revoke_pending = 0,
                last_event_block = excluded.last_event_block,
                updated_at = excluded.updated_at
            WHERE access_grants.last_event_block <= excluded.last_event_block
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(cid)
        .bind(grantee.to_lowercase())
        .bind(granter.to_lowercase())
        .bind(expiry.kind_str())
        .bind(expiry.unix_timestamp())
        .bind(block)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(db.pool())
        .await?;

        Ok(ReconcileOutcome::Applied)
    }

    /// Apply an `access_revoked` event observed on the ledger.
    pub async fn apply_revoked_event(
        db: &Database,
        cid: &str,
        grantee: &str,
        block: u64,
    ) -> Result<ReconcileOutcome> {
        let Some(existing) = Self::find_grant(db, cid, grantee).await? else {
            tracing::warn!("Dropping access_revoked event for unknown grant on {}", cid);
            return Ok(ReconcileOutcome::UnknownTarget);
        };

        let block = block as i64;
        if existing.last_event_block > block {
            tracing::debug!("Ignoring stale access_revoked event for {} at block {}", cid, block);
            return Ok(ReconcileOutcome::Ignored);
        }
        if !existing.is_active {
            return Ok(ReconcileOutcome::NoOp);
        }

        sqlx::query(
            r#"
            UPDATE access_grants SET is_active = 0, revoke_pending = 0, last_event_block = ?, updated_at = ?
            WHERE id = ? AND last_event_block <= ?
            "#,
        )
        .bind(block)
        .bind(Utc::now().to_rfc3339())
        .bind(&existing.id)
        .bind(block)
        .execute(db.pool())
        .await?;

        Ok(ReconcileOutcome::Applied)
    }
}

async fn mirror_grant_job(
    db: Database,
    ledger: LedgerHandle,
    cid: String,
    grantee: String,
    duration_secs: u64,
) -> Result<()> {
    let tx_hash = ledger
        .call(ledger.client.grant_access(&cid, &grantee, duration_secs))
        .await?;
    sqlx::query(
        "UPDATE access_grants SET tx_hash = ? WHERE cid = ? AND grantee_address = ? AND is_active = 1",
    )
    .bind(&tx_hash)
    .bind(&cid)
    .bind(&grantee)
    .execute(db.pool())
    .await?;
    tracing::debug!("Grant {} -> {} mirrored in {}", cid, grantee, tx_hash);
    Ok(())
}

async fn mirror_revoke_job(
    db: Database,
    ledger: LedgerHandle,
    cid: String,
    grantee: String,
) -> Result<()> {
    let tx_hash = ledger
        .call(ledger.client.revoke_access(&cid, &grantee))
        .await?;
    // From here on the ledger answers for this grantee again
    sqlx::query(
        r#"
        UPDATE access_grants SET revoke_pending = 0, tx_hash = ?
        WHERE cid = ? AND grantee_address = ? AND is_active = 0
        "#,
    )
    .bind(&tx_hash)
    .bind(&cid)
    .bind(&grantee)
    .execute(db.pool())
    .await?;
    tracing::debug!("Revoke {} -> {} mirrored in {}", cid, grantee, tx_hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerClient};
    use crate::models::{NewFileRecord, RewardSchedule};
    use crate::services::settlement::{RetryPolicy, SettlementQueue};
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::time::Duration;

    const UPLOADER: &str = "0x00000000000000000000000000000000000000a1";
    const READER: &str = "0x00000000000000000000000000000000000000b2";

    async fn setup() -> (Database, Arc<InMemoryLedger>, LedgerHandle) {
        let db = Database::in_memory().await.unwrap();
        let ledger = Arc::new(InMemoryLedger::new(RewardSchedule {
            base: 1,
            size_multiplier: 1,
            encryption_bonus: 1,
        }));
        let handle = LedgerHandle::new(
            ledger.clone(),
            SettlementQueue::new(RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            }),
            Duration::from_secs(5),
        );
        RecordService::create_pending(
            &db,
            NewFileRecord {
                cid: "cid1".into(),
                uploader_address: UPLOADER.into(),
                file_size: 10,
                is_encrypted: false,
                file_name: "a.txt".into(),
                content_type: "text/plain".into(),
                metadata: "{}".into(),
                storage_provider: "local".into(),
            },
        )
        .await
        .unwrap();
        (db, ledger, handle)
    }

    #[tokio::test]
    async fn test_only_uploader_can_grant() {
        let (db, _ledger, handle) = setup().await;
        let err = AccessService::grant(&db, &handle, "cid1", READER, READER, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(_)));

        let err = AccessService::grant(&db, &handle, "missing", UPLOADER, READER, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_grant_expiry_window() {
        let (db, ledger, handle) = setup().await;
        ledger.set_offline(true).await;

        let t0 = Utc::now();
        AccessService::grant_at(&db, &handle, "cid1", UPLOADER, READER, 3600, t0)
            .await
            .unwrap();
        handle.queue.wait_idle().await;

        let mid = AccessService::check_access_at(&db, &handle, "cid1", READER, t0 + ChronoDuration::seconds(1800))
            .await
            .unwrap();
        assert_eq!(mid, Some(AccessSource::LocalGrant));

        let after = AccessService::check_access_at(&db, &handle, "cid1", READER, t0 + ChronoDuration::seconds(3601))
            .await
            .unwrap();
        assert_eq!(after, None);
    }

    #[tokio::test]
    async fn test_grant_is_mirrored_to_ledger() {
        let (db, ledger, handle) = setup().await;
        ledger.record_upload("cid1", UPLOADER, 10, false, "{}").await.unwrap();

        AccessService::grant(&db, &handle, "cid1", UPLOADER, READER, 0).await.unwrap();
        handle.queue.wait_idle().await;

        assert!(ledger.has_access("cid1", READER).await.unwrap());
        let grant = AccessService::find_grant(&db, "cid1", READER).await.unwrap().unwrap();
        assert!(grant.tx_hash.is_some());
        assert_eq!(grant.expiry(), GrantExpiry::Permanent);
    }

    #[tokio::test]
    async fn test_revoke_right_after_grant() {
        let (db, ledger, handle) = setup().await;
        AccessService::grant(&db, &handle, "cid1", UPLOADER, READER, 0).await.unwrap();
        AccessService::revoke(&db, &handle, "cid1", UPLOADER, READER).await.unwrap();

        assert!(!AccessService::has_access(&db, &handle, "cid1", READER).await.unwrap());
        handle.queue.wait_idle().await;

        assert!(!ledger.has_access("cid1", READER).await.unwrap());
        assert!(!AccessService::has_access(&db, &handle, "cid1", READER).await.unwrap());
        assert!(AccessService::has_access(&db, &handle, "cid1", UPLOADER).await.unwrap());
        assert_eq!(ledger.submitted("revoke_access").await, 1);
    }

    #[tokio::test]
    async fn test_ledger_regrant_after_revoke_is_honoured() {
        let (db, ledger, handle) = setup().await;
        AccessService::grant(&db, &handle, "cid1", UPLOADER, READER, 0).await.unwrap();
        AccessService::revoke(&db, &handle, "cid1", UPLOADER, READER).await.unwrap();
        handle.queue.wait_idle().await;

        let grant = AccessService::find_grant(&db, "cid1", READER).await.unwrap().unwrap();
        assert!(!grant.revoke_pending);
        assert!(!AccessService::has_access(&db, &handle, "cid1", READER).await.unwrap());

        // uploader grants again straight on the ledger, no indexer event yet
        ledger.grant_access("cid1", READER, 0).await.unwrap();
        let source = AccessService::check_access_at(&db, &handle, "cid1", READER, Utc::now())
            .await
            .unwrap();
        assert_eq!(source, Some(AccessSource::Ledger));
    }

    #[tokio::test]
    async fn test_pending_revoke_hides_ledger_grant() {
        let (db, ledger, handle) = setup().await;
        ledger.grant_access("cid1", READER, 0).await.unwrap();
        ledger.set_offline(true).await;

        AccessService::grant(&db, &handle, "cid1", UPLOADER, READER, 0).await.unwrap();
        AccessService::revoke(&db, &handle, "cid1", UPLOADER, READER).await.unwrap();
        handle.queue.wait_idle().await;
        ledger.set_offline(false).await;

        // the revoke never reached the ledger, so its stale grant is ignored
        assert!(ledger.has_access("cid1", READER).await.unwrap());
        let grant = AccessService::find_grant(&db, "cid1", READER).await.unwrap().unwrap();
        assert!(grant.revoke_pending);
        assert!(!AccessService::has_access(&db, &handle, "cid1", READER).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_without_grant_is_not_found() {
        let (db, _ledger, handle) = setup().await;
        let err = AccessService::revoke(&db, &handle, "cid1", UPLOADER, READER)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ledger_only_grant_counts() {
        let (db, ledger, handle) = setup().await;
        ledger.grant_access("cid1", READER, 0).await.unwrap();

        let source = AccessService::check_access_at(&db, &handle, "cid1", READER, Utc::now())
            .await
            .unwrap();
        assert_eq!(source, Some(AccessSource::Ledger));

        ledger.set_offline(true).await;
        assert!(!AccessService::has_access(&db, &handle, "cid1", READER).await.unwrap());
        assert!(AccessService::has_access(&db, &handle, "cid1", UPLOADER).await.unwrap());
    }

    #[tokio::test]
    async fn test_regrant_reactivates() {
        let (db, _ledger, handle) = setup().await;
        AccessService::grant(&db, &handle, "cid1", UPLOADER, READER, 0).await.unwrap();
        AccessService::revoke(&db, &handle, "cid1", UPLOADER, READER).await.unwrap();
        let grant = AccessService::grant(&db, &handle, "cid1", UPLOADER, READER, 60)
            .await
            .unwrap();
        handle.queue.wait_idle().await;

        assert!(grant.is_active);
        assert!(matches!(grant.expiry(), GrantExpiry::ExpiresAt(_)));
        assert_eq!(AccessService::list_grants(&db, "cid1", UPLOADER).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_respect_block_order() {
        let (db, _ledger, _handle) = setup().await;

        let applied = AccessService::apply_granted_event(&db, "cid1", UPLOADER, READER, GrantExpiry::Permanent, 10)
            .await
            .unwrap();
        assert_eq!(applied, ReconcileOutcome::Applied);

        let again = AccessService::apply_granted_event(&db, "cid1", UPLOADER, READER, GrantExpiry::Permanent, 10)
            .await
            .unwrap();
        assert_eq!(again, ReconcileOutcome::NoOp);

        let stale = AccessService::apply_revoked_event(&db, "cid1", READER, 9).await.unwrap();
        assert_eq!(stale, ReconcileOutcome::Ignored);
        assert!(AccessService::find_grant(&db, "cid1", READER).await.unwrap().unwrap().is_active);

        let revoked = AccessService::apply_revoked_event(&db, "cid1", READER, 11).await.unwrap();
        assert_eq!(revoked, ReconcileOutcome::Applied);

        let late_grant = AccessService::apply_granted_event(&db, "cid1", UPLOADER, READER, GrantExpiry::Permanent, 10)
            .await
            .unwrap();
        assert_eq!(late_grant, ReconcileOutcome::Ignored);
        assert!(!AccessService::find_grant(&db, "cid1", READER).await.unwrap().unwrap().is_active);
    }
}

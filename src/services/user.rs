use chrono::{Duration, Utc};
use sqlx::{QueryBuilder, Sqlite};

use super::settlement::LedgerHandle;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    ActivityDay, Amount, FileListResponse, FileQuery, FileRecord, FileStatus, Pagination,
    RewardSchedule, StatusCounts, UserProfile, UserStats,
};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_ACTIVITY_DAYS: u32 = 30;
const MAX_ACTIVITY_DAYS: u32 = 90;

/// Read-model queries over an address's uploads
pub struct UserService;

impl UserService {
    /// List non-retired uploads with filters, sorting and pagination
    pub async fn list_files(
        db: &Database,
        address: &str,
        query: FileQuery,
    ) -> Result<FileListResponse> {
        let address = address.to_lowercase();
        let page = query.page.unwrap_or(1).max(1);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let sort_column = match query.sort.as_deref().unwrap_or("created_at") {
            "created_at" => "created_at",
            "file_size" => "file_size",
            "file_name" => "file_name",
            other => {
                return Err(AppError::Validation(format!("Unsupported sort field: {}", other)))
            }
        };
        let direction = match query.order.as_deref().unwrap_or("desc") {
            "asc" => "ASC",
            "desc" => "DESC",
            other => return Err(AppError::Validation(format!("Unsupported order: {}", other))),
        };

        let mut count_query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM file_records");
        push_filters(&mut count_query, &address, query.status, query.encrypted);
        let (total,): (i64,) = count_query.build_query_as().fetch_one(db.pool()).await?;

        let mut list_query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM file_records");
        push_filters(&mut list_query, &address, query.status, query.encrypted);
        list_query.push(format!(" ORDER BY {} {}, id ASC", sort_column, direction));
        list_query.push(" LIMIT ");
        list_query.push_bind(limit as i64);
        list_query.push(" OFFSET ");
        list_query.push_bind((page as i64 - 1) * limit as i64);

        let files: Vec<FileRecord> = list_query.build_query_as().fetch_all(db.pool()).await?;

        let total_pages = (total + limit as i64 - 1) / limit as i64;
        Ok(FileListResponse {
            files,
            pagination: Pagination {
                page,
                limit,
                total,
                total_pages,
            },
        })
    }

    pub async fn stats(
        db: &Database,
        ledger: &LedgerHandle,
        schedule: &RewardSchedule,
        address: &str,
    ) -> Result<UserStats> {
        let address = address.to_lowercase();

        let (total_files, total_size_bytes, encrypted_files): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(file_size), 0), COALESCE(SUM(is_encrypted), 0)
            FROM file_records WHERE uploader_address = ?
            "#,
        )
        .bind(&address)
        .fetch_one(db.pool())
        .await?;

        let rows: Vec<(FileStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM file_records WHERE uploader_address = ? GROUP BY status",
        )
        .bind(&address)
        .fetch_all(db.pool())
        .await?;

        let mut by_status = StatusCounts::default();
        for (status, count) in rows {
            match status {
                FileStatus::Pending => by_status.pending = count,
                FileStatus::Confirmed => by_status.confirmed = count,
                FileStatus::Failed => by_status.failed = count,
                FileStatus::Rewarded => by_status.rewarded = count,
            }
        }

        let rewarded: Vec<(i64, bool)> = sqlx::query_as(
            "SELECT file_size, is_encrypted FROM file_records WHERE uploader_address = ? AND status = ?",
        )
        .bind(&address)
        .bind(FileStatus::Rewarded)
        .fetch_all(db.pool())
        .await?;
        let earned: Amount = rewarded.iter().fold(0, |acc, (size, encrypted)| {
            acc.saturating_add(schedule.calculate((*size).max(0) as u64, *encrypted))
        });

        let ledger_balance_wei = match ledger.call(ledger.client.reward_balance(&address)).await {
            Ok(balance) => Some(balance.to_string()),
            Err(e) => {
                tracing::warn!("Ledger balance for {} unavailable: {}", address, e);
                None
            }
        };

        Ok(UserStats {
            address,
            total_files,
            total_size_bytes,
            encrypted_files,
            by_status,
            rewards_earned_wei: earned.to_string(),
            ledger_balance_wei,
        })
    }

    pub async fn profile(db: &Database, address: &str) -> Result<UserProfile> {
        let address = address.to_lowercase();

        let (joined_at, last_activity, total_files, total_size_bytes): (
            Option<String>,
            Option<String>,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT MIN(created_at), MAX(updated_at), COUNT(*), COALESCE(SUM(file_size), 0)
            FROM file_records WHERE uploader_address = ?
            "#,
        )
        .bind(&address)
        .fetch_one(db.pool())
        .await?;

        let (grants_given,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM access_grants WHERE granter_address = ? AND is_active = 1",
        )
        .bind(&address)
        .fetch_one(db.pool())
        .await?;

        let (grants_received,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM access_grants WHERE grantee_address = ? AND is_active = 1",
        )
        .bind(&address)
        .fetch_one(db.pool())
        .await?;

        Ok(UserProfile {
            address,
            joined_at,
            last_activity,
            total_files,
            total_size_bytes,
            grants_given,
            grants_received,
        })
    }

    /// Uploads per day over the last `days` days (today included)
    pub async fn activity(
        db: &Database,
        address: &str,
        days: Option<u32>,
    ) -> Result<Vec<ActivityDay>> {
        let days = days
            .unwrap_or(DEFAULT_ACTIVITY_DAYS)
            .clamp(1, MAX_ACTIVITY_DAYS);
        let since = (Utc::now() - Duration::days(days as i64 - 1))
            .format("%Y-%m-%d")
            .to_string();

        let rows = sqlx::query_as(
            r#"
            SELECT substr(created_at, 1, 10) AS day,
                   COUNT(*) AS uploads,
                   COALESCE(SUM(file_size), 0) AS bytes
            FROM file_records
            WHERE uploader_address = ? AND substr(created_at, 1, 10) >= ?
            GROUP BY day
            ORDER BY day ASC
            "#,
        )
        .bind(address.to_lowercase())
        .bind(since)
        .fetch_all(db.pool())
        .await?;

        Ok(rows)
    }
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    address: &str,
    status: Option<FileStatus>,
    encrypted: Option<bool>,
) {
    builder.push(" WHERE retired_at IS NULL AND uploader_address = ");
    builder.push_bind(address.to_string());
    if let Some(status) = status {
        builder.push(" AND status = ");
        builder.push_bind(status);
    }
    if let Some(encrypted) = encrypted {
        builder.push(" AND is_encrypted = ");
        builder.push_bind(encrypted);
    }
}

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{FileRecord, FileStatus};

/// File listing query parameters
#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<FileStatus>,
    pub encrypted: Option<bool>,
    /// created_at | file_size | file_name
    pub sort: Option<String>,
    /// asc | desc
    pub order: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

/// File list response
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileRecord>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize, Default)]
pub struct StatusCounts {
    pub pending: i64,
    pub confirmed: i64,
    pub failed: i64,
    pub rewarded: i64,
}

#[derive(Debug, Serialize)]
pub struct UserStats {
    pub address: String,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub encrypted_files: i64,
    pub by_status: StatusCounts,
    /// Sum of the reward formula over rewarded records
    pub rewards_earned_wei: String,
    /// None when the ledger could not be reached
    pub ledger_balance_wei: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub address: String,
    pub joined_at: Option<String>,
    pub last_activity: Option<String>,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub grants_given: i64,
    pub grants_received: i64,
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct ActivityDay {
    pub day: String,
    pub uploads: i64,
    pub bytes: i64,
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;

/// Storage adapter failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("retrieve failed: {0}")]
    RetrieveFailed(String),

    #[error("storage provider not found: {0}")]
    ProviderNotFound(String),
}

/// Ledger client failures
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("contract call failed: {0}")]
    ContractCallFailed(String),

    #[error("insufficient funds for transaction")]
    InsufficientFunds,

    #[error("reward already claimed")]
    AlreadyClaimed,

    #[error("upload already recorded")]
    AlreadyRecorded,

    #[error("not authorized for this ledger operation")]
    NotAuthorized,

    #[error("nothing to claim")]
    NothingToClaim,

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
}

impl LedgerError {
    /// Transport-level failures may succeed on a later attempt. Rejections
    /// decided by the contract never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::TransactionFailed(_)
                | LedgerError::ContractCallFailed(_)
                | LedgerError::Timeout(_)
        )
    }
}

/// Persistence layer failures
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PersistenceError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                PersistenceError::ConstraintViolation(db_err.message().to_string())
            }
            other => PersistenceError::Database(other),
        }
    }
}

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Deliberately carries no detail about why verification failed.
    #[error("Authentication failed")]
    Authentication,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Decryption failed")]
    Decryption,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Persistence(err.into())
    }
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Ledger(e) => e.is_retryable(),
            AppError::Persistence(PersistenceError::Database(_)) => true,
            _ => false,
        }
    }
}

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn success_message(message: &str) -> ApiResponse<()> {
        ApiResponse {
            code: 0,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn error(code: i32, message: &str) -> ApiResponse<()> {
        ApiResponse {
            code,
            message: message.to_string(),
            data: None,
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication => StatusCode::UNAUTHORIZED,
            AppError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(StorageError::ProviderNotFound(_)) => StatusCode::BAD_REQUEST,
            AppError::Storage(_) => StatusCode::BAD_GATEWAY,
            AppError::Ledger(LedgerError::AlreadyClaimed) => StatusCode::CONFLICT,
            AppError::Ledger(LedgerError::AlreadyRecorded) => StatusCode::CONFLICT,
            AppError::Ledger(LedgerError::NotAuthorized) => StatusCode::FORBIDDEN,
            AppError::Ledger(LedgerError::NothingToClaim) => StatusCode::BAD_REQUEST,
            AppError::Ledger(LedgerError::InsufficientFunds) => StatusCode::PAYMENT_REQUIRED,
            AppError::Ledger(LedgerError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Ledger(_) => StatusCode::BAD_GATEWAY,
            AppError::Persistence(PersistenceError::ConstraintViolation(_)) => StatusCode::CONFLICT,
            AppError::Persistence(PersistenceError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Persistence(PersistenceError::Database(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Decryption => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Persistence(PersistenceError::Database(e)) => {
                tracing::error!("Database error: {:?}", e);
                "Database error".to_string()
            }
            AppError::Persistence(PersistenceError::ConstraintViolation(msg)) => {
                tracing::warn!("Constraint violation: {}", msg);
                "Record already exists".to_string()
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                self.to_string()
            }
            AppError::Ledger(e) if e.is_retryable() => {
                tracing::error!("Ledger error: {}", e);
                self.to_string()
            }
            AppError::Ledger(e) => {
                tracing::info!("Ledger rejected request: {}", e);
                self.to_string()
            }
            AppError::Decryption => {
                tracing::error!("Decryption failed for stored content");
                self.to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                self.to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ApiResponse::<()>::error(status.as_u16() as i32, &message));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_retryable_classification() {
        assert!(LedgerError::TransactionFailed("nonce".into()).is_retryable());
        assert!(LedgerError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!LedgerError::AlreadyClaimed.is_retryable());
        assert!(!LedgerError::AlreadyRecorded.is_retryable());
        assert!(!LedgerError::NotAuthorized.is_retryable());
        assert!(!LedgerError::NothingToClaim.is_retryable());
        assert!(!LedgerError::InsufficientFunds.is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Authentication.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::Ledger(LedgerError::AlreadyClaimed).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Persistence(PersistenceError::ConstraintViolation("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Storage(StorageError::ProviderNotFound("s3".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_authentication_message_has_no_detail() {
        assert_eq!(AppError::Authentication.to_string(), "Authentication failed");
    }
}

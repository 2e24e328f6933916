use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::error::{ApiResponse, Result};
use crate::ledger::TxStatus;
use crate::services::SettlementSnapshot;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ledger_backend: &'static str,
    /// None when the ledger is unreachable
    pub block_number: Option<u64>,
    pub storage_providers: Vec<&'static str>,
    pub default_storage_provider: String,
}

/// Service health
/// GET /api/v1/health
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let block_number = match state.ledger.call(state.ledger.client.block_number()).await {
        Ok(block) => Some(block),
        Err(e) => {
            tracing::warn!("Ledger health probe failed: {}", e);
            None
        }
    };

    Json(ApiResponse::success(HealthResponse {
        status: if block_number.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        ledger_backend: state.ledger.client.backend(),
        block_number,
        storage_providers: state.storage.provider_names(),
        default_storage_provider: state.storage.default_provider().to_string(),
    }))
}

/// Background settlement counters
/// GET /api/v1/settlement/stats
pub async fn settlement_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<SettlementSnapshot>> {
    Json(ApiResponse::success(state.ledger.queue.stats()))
}

#[derive(Debug, Serialize)]
pub struct TransactionStatusResponse {
    pub tx_hash: String,
    pub status: TxStatus,
}

/// Ledger transaction status
/// GET /api/v1/transaction/:tx_hash/status
pub async fn transaction_status(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<ApiResponse<TransactionStatusResponse>>> {
    let status = state
        .ledger
        .call(state.ledger.client.transaction_status(&tx_hash))
        .await?;
    Ok(Json(ApiResponse::success(TransactionStatusResponse { tx_hash, status })))
}

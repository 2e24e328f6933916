use axum::{body::Bytes, extract::State, http::HeaderMap, Json};

use crate::error::{ApiResponse, Result};
use crate::models::ReconcileOutcome;
use crate::services::reconcile::SIGNATURE_HEADER;
use crate::services::ReconciliationService;
use crate::AppState;

/// Ledger event push
/// POST /api/v1/webhook
pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<ReconcileOutcome>>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome =
        ReconciliationService::handle(&state.db, &state.config.webhook.secret, &body, signature)
            .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

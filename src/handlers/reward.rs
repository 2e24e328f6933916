use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    BatchClaimReceipt, BatchClaimRequest, ClaimReceipt, ClaimRewardRequest, RewardBalance,
    RewardPreview, RewardPreviewQuery,
};
use crate::services::{validation, ActionMessage, AuthService, RewardService};
use crate::AppState;

/// Claim the reward for one upload
/// POST /api/v1/claim-reward
pub async fn claim_reward(
    State(state): State<AppState>,
    Json(req): Json<ClaimRewardRequest>,
) -> Result<Json<ApiResponse<ClaimReceipt>>> {
    validation::cid(&req.cid)?;
    let claimant = validation::address(&req.user_address)?;
    validation::signature(&req.signature)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &claimant,
        &req.signature,
        &ActionMessage::Claim { cid: &req.cid },
    )?;

    let receipt = RewardService::claim(
        &state.db,
        &state.ledger,
        &state.config.rewards.schedule(),
        &req.cid,
        &claimant,
    )
    .await?;

    Ok(Json(ApiResponse::success(receipt)))
}

/// Claim several rewards in one transaction
/// POST /api/v1/claim-reward/batch
pub async fn batch_claim(
    State(state): State<AppState>,
    Json(req): Json<BatchClaimRequest>,
) -> Result<Json<ApiResponse<BatchClaimReceipt>>> {
    if req.cids.is_empty() {
        return Err(AppError::Validation("No CIDs given".to_string()));
    }
    if req.cids.len() > validation::MAX_BATCH_CLAIM {
        return Err(AppError::Validation(format!(
            "At most {} CIDs per batch",
            validation::MAX_BATCH_CLAIM
        )));
    }
    for cid in &req.cids {
        validation::cid(cid)?;
    }
    let claimant = validation::address(&req.user_address)?;
    validation::signature(&req.signature)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &claimant,
        &req.signature,
        &ActionMessage::BatchClaim { cids: &req.cids },
    )?;

    let receipt = RewardService::batch_claim(
        &state.db,
        &state.ledger,
        &state.config.rewards.schedule(),
        &req.cids,
        &claimant,
    )
    .await?;

    Ok(Json(ApiResponse::success(receipt)))
}

/// Estimate the reward for an upload
/// GET /api/v1/rewards/preview?size=&encrypted=
pub async fn preview_reward(
    State(state): State<AppState>,
    Query(query): Query<RewardPreviewQuery>,
) -> Result<Json<ApiResponse<RewardPreview>>> {
    let preview = RewardService::preview(
        &state.config.rewards.schedule(),
        query.size,
        query.encrypted,
    );
    Ok(Json(ApiResponse::success(preview)))
}

/// Reward balance on the ledger
/// GET /api/v1/rewards/:address/balance
pub async fn reward_balance(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ApiResponse<RewardBalance>>> {
    let address = validation::address(&address)?;
    let balance = RewardService::balance(&state.ledger, &address).await?;
    Ok(Json(ApiResponse::success(balance)))
}

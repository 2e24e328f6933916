use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::error::{ApiResponse, Result};
use crate::models::{
    ActivityDay, ActivityQuery, FileListResponse, FileQuery, UserProfile, UserStats,
};
use crate::services::{validation, UserService};
use crate::AppState;

/// List a user's files
/// GET /api/v1/users/:address/files
pub async fn list_files(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Json<ApiResponse<FileListResponse>>> {
    let address = validation::address(&address)?;
    let files = UserService::list_files(&state.db, &address, query).await?;
    Ok(Json(ApiResponse::success(files)))
}

/// Upload and reward statistics
/// GET /api/v1/users/:address/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ApiResponse<UserStats>>> {
    let address = validation::address(&address)?;
    let stats = UserService::stats(
        &state.db,
        &state.ledger,
        &state.config.rewards.schedule(),
        &address,
    )
    .await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// GET /api/v1/users/:address/profile
pub async fn get_profile(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ApiResponse<UserProfile>>> {
    let address = validation::address(&address)?;
    let profile = UserService::profile(&state.db, &address).await?;
    Ok(Json(ApiResponse::success(profile)))
}

/// Uploads per day
/// GET /api/v1/users/:address/activity?days=
pub async fn get_activity(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<ApiResponse<Vec<ActivityDay>>>> {
    let address = validation::address(&address)?;
    let activity = UserService::activity(&state.db, &address, query.days).await?;
    Ok(Json(ApiResponse::success(activity)))
}

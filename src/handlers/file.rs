use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::{ApiResponse, Result};
use crate::models::{
    AccessGrantView, FileRecord, RetireRequest, RetrieveRequest, RetrieveResponse, UploadRequest,
    UploadResponse,
};
use crate::services::{validation, AccessService, ActionMessage, AuthService, FileService};
use crate::AppState;

/// Upload a file
/// POST /api/v1/upload
pub async fn upload_file(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<ApiResponse<UploadResponse>>> {
    let uploader = validation::address(&req.user_address)?;
    validation::signature(&req.signature)?;
    let file_name = validation::file_name(&req.file_name)?;
    validation::payload(&req.file, state.config.server.max_upload_bytes)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &uploader,
        &req.signature,
        &ActionMessage::Upload {
            file_name: &req.file_name,
            payload: &req.file,
        },
    )?;

    let response = FileService::upload(
        &state.db,
        &state.storage,
        &state.ledger,
        &state.config.rewards.schedule(),
        state.config.rewards.auto_claim,
        &uploader,
        file_name,
        req,
    )
    .await?;

    Ok(Json(ApiResponse::success(response)))
}

/// Retrieve file content
/// POST /api/v1/retrieve
pub async fn retrieve_file(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<ApiResponse<RetrieveResponse>>> {
    validation::cid(&req.cid)?;
    let requester = validation::address(&req.user_address)?;
    validation::signature(&req.signature)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &requester,
        &req.signature,
        &ActionMessage::Retrieve { cid: &req.cid },
    )?;

    let response =
        FileService::retrieve(&state.db, &state.storage, &state.ledger, &req.cid, &requester)
            .await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Get a file record
/// GET /api/v1/files/:cid
pub async fn get_file(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<ApiResponse<FileRecord>>> {
    validation::cid(&cid)?;
    let record = FileService::get_record(&state.db, &cid).await?;
    Ok(Json(ApiResponse::success(record)))
}

/// Retire a file record
/// POST /api/v1/files/:cid/retire
pub async fn retire_file(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    Json(req): Json<RetireRequest>,
) -> Result<Json<ApiResponse<FileRecord>>> {
    validation::cid(&cid)?;
    let uploader = validation::address(&req.user_address)?;
    validation::signature(&req.signature)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &uploader,
        &req.signature,
        &ActionMessage::Retire { cid: &cid },
    )?;

    let record = FileService::retire(&state.db, &cid, &uploader).await?;
    Ok(Json(ApiResponse::success(record)))
}

#[derive(Debug, Deserialize)]
pub struct GrantListQuery {
    pub address: String,
}

/// List grants on a file
/// GET /api/v1/files/:cid/grants?address=
pub async fn list_grants(
    State(state): State<AppState>,
    Path(cid): Path<String>,
    Query(query): Query<GrantListQuery>,
) -> Result<Json<ApiResponse<Vec<AccessGrantView>>>> {
    validation::cid(&cid)?;
    let uploader = validation::address(&query.address)?;
    let grants = AccessService::list_grants(&state.db, &cid, &uploader).await?;
    Ok(Json(ApiResponse::success(grants)))
}

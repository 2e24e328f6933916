use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::{ApiResponse, Result};
use crate::models::{
    AccessCheckResponse, AccessGrantView, GrantAccessRequest, RevokeAccessRequest,
};
use crate::services::{validation, AccessService, ActionMessage, AuthService};
use crate::AppState;

/// Grant read access
/// POST /api/v1/access/grant
pub async fn grant_access(
    State(state): State<AppState>,
    Json(req): Json<GrantAccessRequest>,
) -> Result<Json<ApiResponse<AccessGrantView>>> {
    validation::cid(&req.cid)?;
    let granter = validation::address(&req.granter)?;
    let grantee = validation::address(&req.grantee)?;
    validation::signature(&req.signature)?;
    validation::grant_duration(req.duration)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &granter,
        &req.signature,
        &ActionMessage::Grant {
            cid: &req.cid,
            grantee: &grantee,
            duration: req.duration,
        },
    )?;

    let grant = AccessService::grant(
        &state.db,
        &state.ledger,
        &req.cid,
        &granter,
        &grantee,
        req.duration,
    )
    .await?;

    Ok(Json(ApiResponse::success(grant.into())))
}

/// Revoke read access
/// POST /api/v1/access/revoke
pub async fn revoke_access(
    State(state): State<AppState>,
    Json(req): Json<RevokeAccessRequest>,
) -> Result<Json<ApiResponse<AccessGrantView>>> {
    validation::cid(&req.cid)?;
    let granter = validation::address(&req.granter)?;
    let grantee = validation::address(&req.grantee)?;
    validation::signature(&req.signature)?;

    AuthService::authenticate_action(
        &state.config.auth,
        &granter,
        &req.signature,
        &ActionMessage::Revoke {
            cid: &req.cid,
            grantee: &grantee,
        },
    )?;

    let grant =
        AccessService::revoke(&state.db, &state.ledger, &req.cid, &granter, &grantee).await?;
    Ok(Json(ApiResponse::success(grant.into())))
}

/// Check whether an address can read a file
/// GET /api/v1/access/:cid/:address
pub async fn check_access(
    State(state): State<AppState>,
    Path((cid, address)): Path<(String, String)>,
) -> Result<Json<ApiResponse<AccessCheckResponse>>> {
    validation::cid(&cid)?;
    let address = validation::address(&address)?;

    let source =
        AccessService::check_access_at(&state.db, &state.ledger, &cid, &address, chrono::Utc::now())
            .await?;

    Ok(Json(ApiResponse::success(AccessCheckResponse {
        cid,
        address,
        has_access: source.is_some(),
        source,
    })))
}

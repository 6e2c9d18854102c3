//! Public recovery endpoints behind the link in dunning emails

use axum::{
    extract::{Path, State},
    Json,
};
use dunning_billing::{RecoveryOutcome, RecoverySummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub payment_method: String,
}

#[derive(Debug, Serialize)]
pub struct RecoverResponse {
    pub status: RecoveryOutcome,
}

/// Unknown and malformed tokens look the same to the caller
fn parse_token(token: &str) -> ApiResult<Uuid> {
    token
        .parse::<Uuid>()
        .map_err(|_| ApiError::NotFound("recovery link not found".to_string()))
}

pub async fn recovery_summary(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<RecoverySummary>> {
    let token = parse_token(&token)?;
    Ok(Json(state.dunning.recovery.summary(token).await?))
}

pub async fn recover_payment(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(request): Json<RecoverRequest>,
) -> ApiResult<Json<RecoverResponse>> {
    let token = parse_token(&token)?;
    let status = state
        .dunning
        .recovery
        .recover(token, &request.payment_method)
        .await?;
    Ok(Json(RecoverResponse { status }))
}

//! Dashboard endpoints for the signed-in merchant

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use dunning_billing::{DunningLog, FailedPayment, PaymentStatus, RecoveryStats, User};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub stats: RecoveryStats,
}

pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<MeResponse>> {
    let user = state
        .store()
        .find_user(auth_user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;
    let stats = state.store().recovery_stats(user.id).await?;
    Ok(Json(MeResponse { user, stats }))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub stripe_account_id: String,
}

pub async fn connect(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<User>> {
    let account_id = request.stripe_account_id.trim();
    if !account_id.starts_with("acct_") || account_id.len() <= "acct_".len() {
        return Err(ApiError::BadRequest(
            "stripe_account_id must look like acct_...".to_string(),
        ));
    }

    let user = state
        .store()
        .link_stripe_account(auth_user.user_id, account_id)
        .await?;

    tracing::info!(
        user_id = %user.id,
        account_id = %account_id,
        "Stripe account connected"
    );
    Ok(Json(user))
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

pub async fn checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CheckoutResponse>> {
    let link = state
        .dunning
        .checkout
        .create_session(auth_user.user_id)
        .await?;
    Ok(Json(CheckoutResponse {
        session_id: link.session_id,
        url: link.url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FailedPaymentsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_failed_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<FailedPaymentsQuery>,
) -> ApiResult<Json<Vec<FailedPayment>>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<PaymentStatus>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let payments = state
        .store()
        .list_failed_payments(auth_user.user_id, status, limit, offset)
        .await?;
    Ok(Json(payments))
}

pub async fn failed_payment_logs(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<DunningLog>>> {
    let not_found = || ApiError::NotFound("failed payment not found".to_string());

    let payment = state
        .store()
        .find_failed_payment(id)
        .await?
        .ok_or_else(not_found)?;
    if payment.user_id != auth_user.user_id {
        return Err(not_found());
    }

    Ok(Json(state.store().list_dunning_logs(payment.id).await?))
}

//! Stripe webhook endpoint
//!
//! Signature failures are rejected with 400. Once the delivery is recorded
//! the response is 200 whatever processing did, malformed bodies included;
//! failures are kept for replay.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use dunning_billing::{BillingError, WebhookDisposition};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let disposition = state
        .dunning
        .webhooks
        .receive(&body, signature)
        .await
        .map_err(|e| match e {
            BillingError::WebhookSignatureInvalid => ApiError::from(e),
            other => {
                // Nothing was recorded, so let Stripe redeliver
                tracing::error!(error = %other, "Could not claim webhook event");
                ApiError::Internal(other.to_string())
            }
        })?;

    if let WebhookDisposition::Failed(reason) = &disposition {
        tracing::warn!(reason = %reason, "Webhook acknowledged with processing error");
    }

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}

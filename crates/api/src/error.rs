//! API error type
//!
//! Handlers return `ApiResult<T>`; every error renders as
//! `{"error": {"code": "...", "message": "..."}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dunning_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Upstream timeout: {0}")]
    GatewayTimeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::PaymentRequired(_) => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_DECLINED"),
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            ApiError::GatewayTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let message = match self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                "An internal server error occurred".to_string()
            }
            ApiError::BadGateway(detail) => {
                tracing::error!(error = %detail, "Upstream error");
                "The payment processor returned an error".to_string()
            }
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::PaymentRequired(msg)
            | ApiError::GatewayTimeout(msg) => msg,
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookEventNotSupported(msg) | BillingError::InvalidInput(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            BillingError::Conflict(msg) => ApiError::Conflict(msg),
            BillingError::PaymentDeclined(msg) => ApiError::PaymentRequired(msg),
            BillingError::StripeApi(msg) => ApiError::BadGateway(msg),
            BillingError::Timeout(what) => {
                ApiError::GatewayTimeout(format!("Timed out waiting for {}", what))
            }
            BillingError::Database(msg) | BillingError::Config(msg) | BillingError::Internal(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_statuses() {
        let cases = [
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (BillingError::NotFound("recovery link".into()), StatusCode::NOT_FOUND),
            (BillingError::Conflict("taken".into()), StatusCode::CONFLICT),
            (
                BillingError::PaymentDeclined("insufficient funds".into()),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (BillingError::StripeApi("500".into()), StatusCode::BAD_GATEWAY),
            (BillingError::Timeout("Stripe".into()), StatusCode::GATEWAY_TIMEOUT),
            (
                BillingError::Database("pool closed".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (billing, expected) in cases {
            let response = ApiError::from(billing).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_internal_details_are_not_rendered() {
        let response = ApiError::Internal("password=hunter2".to_string()).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert!(!body.to_string().contains("hunter2"));
    }
}

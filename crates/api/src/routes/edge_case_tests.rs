// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the HTTP Surface
//!
//! Drives the full router with `oneshot` against the in-memory store:
//! - Registration and login
//! - Webhook signature handling and idempotent acknowledgement
//! - Public recovery endpoints
//! - Ownership checks on dashboard endpoints

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use dunning_billing::webhooks::compute_signature;
use dunning_billing::{
    BillingResult, ChargeOutcome, CheckoutLink, CheckoutRequest, DunningConfig, DunningService,
    DunningStore, InMemoryDunningStore, NewUser, NotificationSender, PaymentProcessor,
    ProcessingResult,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;

use crate::{config::Config, routes::create_router, state::AppState};

const WEBHOOK_SECRET: &str = "whsec_router_tests";

struct ApprovingProcessor;

#[async_trait]
impl PaymentProcessor for ApprovingProcessor {
    async fn customer_email(
        &self,
        _account: Option<&str>,
        _customer_id: &str,
    ) -> BillingResult<Option<String>> {
        Ok(None)
    }

    async fn default_payment_method(
        &self,
        _account: Option<&str>,
        _customer_id: &str,
    ) -> BillingResult<Option<String>> {
        Ok(Some("pm_default".to_string()))
    }

    async fn set_default_payment_method(
        &self,
        _account: Option<&str>,
        _customer_id: &str,
        _payment_method: &str,
    ) -> BillingResult<()> {
        Ok(())
    }

    async fn confirm_payment_intent(
        &self,
        _account: Option<&str>,
        _payment_intent_id: &str,
        _payment_method: Option<&str>,
    ) -> BillingResult<ChargeOutcome> {
        Ok(ChargeOutcome::Succeeded)
    }

    async fn create_checkout_session(
        &self,
        _request: CheckoutRequest,
    ) -> BillingResult<CheckoutLink> {
        Ok(CheckoutLink {
            session_id: "cs_test".to_string(),
            url: "https://checkout.stripe.com/c/pay/cs_test".to_string(),
        })
    }
}

struct AcceptingSender;

#[async_trait]
impl NotificationSender for AcceptingSender {
    async fn send(&self, _to: &str, _subject: &str, _html: &str) -> bool {
        true
    }
}

fn test_app() -> (Router, Arc<InMemoryDunningStore>) {
    let store = Arc::new(InMemoryDunningStore::new());
    let dunning = DunningService::new(
        store.clone(),
        Arc::new(ApprovingProcessor),
        Arc::new(AcceptingSender),
        DunningConfig {
            public_url: "https://pay.example.com".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
        },
    );
    let config = Config {
        database_url: "postgres://unused".to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        jwt_secret: "test-jwt-secret-key-for-testing-only".to_string(),
        jwt_expiry_hours: 24,
        public_url: "https://pay.example.com".to_string(),
        allowed_origins: Vec::new(),
    };
    (create_router(AppState::new(config, dunning)), store)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn register(app: &Router, email: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/auth/register",
        None,
        Some(json!({ "email": email, "username": "shop_owner", "password": "hunter22" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
    body["token"].as_str().unwrap().to_string()
}

async fn post_webhook(app: &Router, payload: &str, signature: Option<String>) -> StatusCode {
    let mut request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/stripe")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        request = request.header("stripe-signature", signature);
    }
    app.clone()
        .oneshot(request.body(Body::from(payload.to_string())).unwrap())
        .await
        .unwrap()
        .status()
}

fn sign(secret: &str, payload: &str) -> String {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    format!("t={},v1={}", now, compute_signature(secret, now, payload).unwrap())
}

fn failed_payment_event(event_id: &str) -> String {
    json!({
        "id": event_id,
        "type": "payment_intent.payment_failed",
        "account": "acct_router",
        "data": { "object": {
            "id": "pi_router",
            "amount": 4999,
            "currency": "usd",
            "customer": "cus_buyer",
            "receipt_email": "buyer@example.com"
        }}
    })
    .to_string()
}

/// Registered merchant with a linked account and one tracked failure
async fn merchant_with_failure(app: &Router) -> String {
    let token = register(app, "merchant@example.com").await;
    let (status, _) = send(
        app,
        Method::POST,
        "/api/connect",
        Some(&token),
        Some(json!({ "stripe_account_id": "acct_router" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let payload = failed_payment_event("evt_router_1");
    assert_eq!(
        post_webhook(app, &payload, Some(sign(WEBHOOK_SECRET, &payload))).await,
        StatusCode::OK
    );
    token
}

#[cfg(test)]
mod auth_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let (status, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_register_seeds_templates_and_rejects_duplicates() {
        let (app, _) = test_app();
        let token = register(&app, "merchant@example.com").await;

        let (status, templates) =
            send(&app, Method::GET, "/api/templates", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let templates = templates.as_array().unwrap();
        assert_eq!(templates.len(), 3);
        let enabled: Vec<_> = templates
            .iter()
            .filter(|t| t["enabled"] == true)
            .map(|t| t["template_type"].as_str().unwrap())
            .collect();
        assert_eq!(enabled, vec!["first_failure"]);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({
                "email": "MERCHANT@example.com",
                "username": "someone_else",
                "password": "hunter22"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_register_validation_errors_are_400() {
        let (app, _) = test_app();
        for (email, username, password) in [
            ("not-an-email", "shop_owner", "hunter22"),
            ("merchant@example.com", "x", "hunter22"),
            ("merchant@example.com", "shop_owner", "short1"),
            ("merchant@example.com", "shop_owner", "nodigitshere"),
        ] {
            let (status, body) = send(
                &app,
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({ "email": email, "username": username, "password": password })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{} / {}", email, username);
            assert!(body["error"]["message"].is_string());
        }
    }

    #[tokio::test]
    async fn test_login() {
        let (app, _) = test_app();
        register(&app, "merchant@example.com").await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "merchant@example.com", "password": "wrong-pass1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "nobody@example.com", "password": "hunter22" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "merchant@example.com", "password": "hunter22" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["token"].is_string());
        assert!(body["user"].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn test_login_seeds_missing_templates() {
        let (app, store) = test_app();
        let password_hash = crate::auth::hash_password("hunter22").unwrap();
        store
            .create_user(NewUser {
                email: "unseeded@example.com".to_string(),
                username: "unseeded".to_string(),
                password_hash,
            })
            .await
            .unwrap();

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "unseeded@example.com", "password": "hunter22" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_string();

        let (_, templates) = send(&app, Method::GET, "/api/templates", Some(&token), None).await;
        assert_eq!(templates.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_dashboard_requires_token() {
        let (app, _) = test_app();
        let (status, body) = send(&app, Method::GET, "/api/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }
}

#[cfg(test)]
mod webhook_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_signature_is_400() {
        let (app, store) = test_app();
        let payload = failed_payment_event("evt_1");
        assert_eq!(post_webhook(&app, &payload, None).await, StatusCode::BAD_REQUEST);
        assert_eq!(store.failed_payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_bad_signature_is_400_and_stores_nothing() {
        let (app, store) = test_app();
        let payload = failed_payment_event("evt_1");
        let status = post_webhook(&app, &payload, Some(sign("whsec_wrong", &payload))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(store.list_webhook_events(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_valid_event_and_redelivery_are_acknowledged() {
        let (app, store) = test_app();
        let token = merchant_with_failure(&app).await;

        let payload = failed_payment_event("evt_router_1");
        assert_eq!(
            post_webhook(&app, &payload, Some(sign(WEBHOOK_SECRET, &payload))).await,
            StatusCode::OK
        );
        assert_eq!(store.failed_payment_count().await, 1);

        let (status, payments) =
            send(&app, Method::GET, "/api/failed-payments", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payments.as_array().unwrap().len(), 1);
        assert_eq!(payments[0]["attempt_count"], 2);

        let (status, me) = send(&app, Method::GET, "/api/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["stats"]["failed_count"], 1);
    }

    #[tokio::test]
    async fn test_signed_malformed_body_is_acknowledged_and_kept() {
        let (app, store) = test_app();
        let payload = r#"{"id":"evt_bad","type":"payment_intent.payment_failed"}"#;

        let status = post_webhook(&app, payload, Some(sign(WEBHOOK_SECRET, payload))).await;
        assert_eq!(status, StatusCode::OK);

        let record = store.find_webhook_event("evt_bad").await.unwrap().unwrap();
        assert_eq!(record.processing_result, ProcessingResult::Error);
        assert_eq!(record.payload, payload);
        assert!(record.error_message.unwrap().contains("Malformed event"));
    }

    #[tokio::test]
    async fn test_unknown_status_filter_is_400() {
        let (app, _) = test_app();
        let token = register(&app, "merchant@example.com").await;
        let (status, _) = send(
            &app,
            Method::GET,
            "/api/failed-payments?status=refunded",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

#[cfg(test)]
mod recovery_route_tests {
    use super::*;

    async fn recovery_token(store: &InMemoryDunningStore) -> String {
        store
            .find_failed_payment_by_intent("pi_router")
            .await
            .unwrap()
            .unwrap()
            .recovery_token
            .to_string()
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_tokens_are_404() {
        let (app, _) = test_app();
        let (status, _) = send(
            &app,
            Method::GET,
            &format!("/recover/{}", uuid::Uuid::new_v4()),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/recover/12", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_recover_then_recover_again() {
        let (app, store) = test_app();
        merchant_with_failure(&app).await;
        let token = recovery_token(&store).await;

        let (status, summary) =
            send(&app, Method::GET, &format!("/recover/{}", token), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["formatted_amount"], "$49.99");
        assert_eq!(summary["status"], "failed");

        let body = json!({ "payment_method": "pm_card_visa" });
        let (status, result) = send(
            &app,
            Method::POST,
            &format!("/recover/{}", token),
            None,
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["status"], "recovered");

        let (status, result) = send(
            &app,
            Method::POST,
            &format!("/recover/{}", token),
            None,
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["status"], "already_recovered");
    }
}

#[cfg(test)]
mod ownership_tests {
    use super::*;

    #[tokio::test]
    async fn test_logs_of_another_merchants_payment_are_404() {
        let (app, store) = test_app();
        let owner = merchant_with_failure(&app).await;
        let intruder = register(&app, "intruder@example.com").await;
        let id = store
            .find_failed_payment_by_intent("pi_router")
            .await
            .unwrap()
            .unwrap()
            .id;

        let uri = format!("/api/failed-payments/{}/logs", id);
        let (status, logs) = send(&app, Method::GET, &uri, Some(&owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["status"], "sent");

        let (status, _) = send(&app, Method::GET, &uri, Some(&intruder), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_account_linked_elsewhere_is_409() {
        let (app, _) = test_app();
        merchant_with_failure(&app).await;
        let other = register(&app, "other@example.com").await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/connect",
            Some(&other),
            Some(json!({ "stripe_account_id": "acct_router" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_foreign_template_update_is_404() {
        let (app, _) = test_app();
        let owner = register(&app, "merchant@example.com").await;
        let other = register(&app, "other@example.com").await;

        let (_, templates) = send(&app, Method::GET, "/api/templates", Some(&owner), None).await;
        let id = templates[0]["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("/api/templates/{}", id),
            Some(&other),
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_checkout_returns_url() {
        let (app, _) = test_app();
        let token = register(&app, "merchant@example.com").await;
        let (status, body) = send(&app, Method::POST, "/api/checkout", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().starts_with("https://checkout.stripe.com"));
    }
}

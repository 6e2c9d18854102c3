//! HTTP routes

pub mod account;
pub mod auth;
#[cfg(test)]
mod edge_case_tests;
pub mod health;
pub mod recovery;
pub mod templates;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/me", get(account::me))
        .route("/api/connect", post(account::connect))
        .route("/api/checkout", post(account::checkout))
        .route("/api/failed-payments", get(account::list_failed_payments))
        .route(
            "/api/failed-payments/{id}/logs",
            get(account::failed_payment_logs),
        )
        .route(
            "/api/templates",
            get(templates::list_templates).post(templates::create_template),
        )
        .route("/api/templates/{id}", put(templates::update_template))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route(
            "/recover/{token}",
            get(recovery::recovery_summary).post(recovery::recover_payment),
        )
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .merge(protected)
        .with_state(state)
}

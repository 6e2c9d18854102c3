//! Registration and login

use axum::{extract::State, http::StatusCode, Json};
use dunning_billing::{BillingError, NewUser, User};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{
        hash_password, validate_email, validate_password_strength, validate_username,
        verify_password,
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub expires_in: i64,
    pub user: User,
}

fn issue_token(state: &AppState, user: User) -> ApiResult<AuthResponse> {
    let token = state
        .jwt_manager
        .generate_access_token(user.id, &user.email)
        .map_err(|e| ApiError::Internal(format!("Failed to issue token: {}", e)))?;

    Ok(AuthResponse {
        token,
        expires_in: state.jwt_manager.expiry_hours() * 3600,
        user,
    })
}

/// Seed any missing default templates
///
/// The account exists either way; a failed seed is picked up again at the
/// next login.
async fn ensure_templates(state: &AppState, user: &User) {
    if let Err(e) = state.dunning.templates.seed_defaults(user.id).await {
        tracing::warn!(
            user_id = %user.id,
            error = %e,
            "Failed to seed default email templates"
        );
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let email = request.email.trim().to_lowercase();
    let username = request.username.trim().to_string();

    validate_email(&email).map_err(ApiError::BadRequest)?;
    validate_username(&username).map_err(ApiError::BadRequest)?;
    validate_password_strength(&request.password).map_err(ApiError::BadRequest)?;

    let password = request.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("Password hashing task failed: {}", e)))?
        .map_err(|e| ApiError::Internal(format!("Password hashing failed: {}", e)))?;

    let user = state
        .store()
        .create_user(NewUser {
            email,
            username,
            password_hash,
        })
        .await
        .map_err(|e| match e {
            BillingError::Conflict(_) => {
                ApiError::Conflict("An account with this email already exists".to_string())
            }
            other => other.into(),
        })?;

    tracing::info!(user_id = %user.id, "User registered");
    ensure_templates(&state, &user).await;

    Ok((StatusCode::CREATED, Json(issue_token(&state, user)?)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let invalid = || ApiError::Unauthorized("Invalid email or password".to_string());
    let email = request.email.trim().to_lowercase();

    let user = state
        .store()
        .find_user_by_email(&email)
        .await?
        .ok_or_else(invalid)?;

    let password = request.password;
    let password_hash = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
        .await
        .map_err(|e| ApiError::Internal(format!("Password verification task failed: {}", e)))?;

    if !valid {
        tracing::warn!(user_id = %user.id, "Login failed: wrong password");
        return Err(invalid());
    }

    tracing::info!(user_id = %user.id, "User logged in");
    ensure_templates(&state, &user).await;
    Ok(Json(issue_token(&state, user)?))
}

//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::ApiError;

/// Authenticated user information extracted from the JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken => "Invalid or expired token",
        };
        ApiError::Unauthorized(message.to_string()).into_response()
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::InvalidAuthFormat)
}

fn authenticate(auth_state: &AuthState, request: &Request) -> Result<AuthUser, AuthError> {
    let token = extract_bearer_token(request)?;
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            AuthError::InvalidToken
        })?;

    Ok(AuthUser {
        user_id: claims.sub,
        email: claims.email,
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match authenticate(&auth_state, &request) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

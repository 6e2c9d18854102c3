//! Edge Case Tests for Authentication
//!
//! Boundary conditions in:
//! - Registration input validation (email, username, password)
//! - Password hashing
//! - Bearer token middleware

#[cfg(test)]
mod validation_tests {
    use super::super::password::*;

    // =========================================================================
    // Password: exactly the minimum length with a letter and a digit passes
    // =========================================================================
    #[test]
    fn test_password_at_minimum_length() {
        assert!(validate_password_strength("abcdefg1").is_ok());
        assert!(validate_password_strength("abcdef1").is_err());
    }

    #[test]
    fn test_password_needs_letter_and_digit() {
        assert!(validate_password_strength("12345678").is_err());
        assert!(validate_password_strength("abcdefgh").is_err());
        assert!(validate_password_strength(&"a1".repeat(65)).is_err());
    }

    #[test]
    fn test_email_shapes() {
        assert!(validate_email("buyer@example.com").is_ok());
        assert!(validate_email("first.last@mail.example.co.uk").is_ok());
        for bad in [
            "",
            "buyer",
            "buyer@",
            "@example.com",
            "buyer@example",
            "buyer@.com",
            "buyer@example.",
            "buyer@@example.com",
            "buy er@example.com",
        ] {
            assert!(validate_email(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    // =========================================================================
    // Username: 3 and 32 characters are the inclusive bounds
    // =========================================================================
    #[test]
    fn test_username_bounds_and_charset() {
        assert!(validate_username("abc").is_ok());
        assert!(validate_username(&"a".repeat(32)).is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
        assert!(validate_username("shop_owner-01").is_ok());
        assert!(validate_username("shop owner").is_err());
        assert!(validate_username("shop.owner").is_err());
    }
}

#[cfg(test)]
mod hashing_tests {
    use super::super::password::*;

    #[test]
    fn test_hash_then_verify() {
        let hash = hash_password("correct-horse-1").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct-horse-1", &hash));
        assert!(!verify_password("wrong-horse-1", &hash));
    }

    #[test]
    fn test_same_password_gets_distinct_salts() {
        let a = hash_password("correct-horse-1").unwrap();
        let b = hash_password("correct-horse-1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_hash_never_matches() {
        assert!(!verify_password("anything1", "not-a-phc-string"));
    }
}

#[cfg(test)]
mod middleware_tests {
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::super::jwt::JwtManager;
    use super::super::middleware::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn app() -> Router {
        let auth_state = AuthState {
            jwt_manager: JwtManager::new(SECRET, 24),
        };
        Router::new()
            .route(
                "/whoami",
                get(|Extension(user): Extension<AuthUser>| async move { user.email }),
            )
            .route_layer(middleware::from_fn_with_state(auth_state, require_auth))
    }

    async fn status_for(header: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri("/whoami");
        if let Some(value) = header {
            request = request.header(AUTHORIZATION, value);
        }
        app()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_valid_bearer_token_passes() {
        let token = JwtManager::new(SECRET, 24)
            .generate_access_token(Uuid::new_v4(), "merchant@example.com")
            .unwrap();
        assert_eq!(
            status_for(Some(&format!("Bearer {}", token))).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_missing_or_malformed_auth_is_unauthorized() {
        assert_eq!(status_for(None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(Some("Basic abc")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(Some("Bearer ")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(Some("Bearer not.a.jwt")).await,
            StatusCode::UNAUTHORIZED
        );
    }
}

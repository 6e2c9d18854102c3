//! Authentication module

#[cfg(test)]
mod edge_case_tests;
pub mod jwt;
pub mod middleware;
pub mod password;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
pub use password::{
    hash_password, validate_email, validate_password_strength, validate_username, verify_password,
};

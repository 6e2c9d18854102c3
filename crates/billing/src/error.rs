//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the failure came from a collaborator and may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_) | BillingError::Timeout(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match e {
            stripe::StripeError::Stripe(ref err) if matches!(err.error_type, stripe::ErrorType::Card) => {
                BillingError::PaymentDeclined(
                    err.message
                        .clone()
                        .unwrap_or_else(|| "Card was declined".to_string()),
                )
            }
            other => BillingError::StripeApi(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::Timeout("stripe".into()).is_transient());
        assert!(BillingError::Database("closed".into()).is_transient());
        assert!(!BillingError::WebhookSignatureInvalid.is_transient());
        assert!(!BillingError::PaymentDeclined("insufficient funds".into()).is_transient());
    }
}

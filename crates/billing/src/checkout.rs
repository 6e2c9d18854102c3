//! Checkout for the service's own subscription

use std::sync::Arc;

use uuid::Uuid;

use crate::client::{CheckoutLink, CheckoutRequest, PaymentProcessor};
use crate::error::{BillingError, BillingResult};
use crate::models::SubscriptionStatus;
use crate::store::DunningStore;

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn DunningStore>,
    processor: Arc<dyn PaymentProcessor>,
    public_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn DunningStore>,
        processor: Arc<dyn PaymentProcessor>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            processor,
            public_url: public_url.into(),
        }
    }

    /// Create a subscription checkout session for a user
    ///
    /// Activation happens when `checkout.session.completed` arrives.
    pub async fn create_session(&self, user_id: Uuid) -> BillingResult<CheckoutLink> {
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        if user.subscription_status == SubscriptionStatus::Active {
            return Err(BillingError::Conflict(
                "Subscription is already active".to_string(),
            ));
        }

        let base = self.public_url.trim_end_matches('/');
        let link = self
            .processor
            .create_checkout_session(CheckoutRequest {
                user_id,
                email: user.email,
                existing_customer_id: user.billing_customer_id,
                success_url: format!("{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}", base),
                cancel_url: format!("{}/billing/cancel", base),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %link.session_id,
            "Checkout session created"
        );
        Ok(link)
    }
}

// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Dunning Billing Module
//!
//! Recovers failed payments for merchants with a connected Stripe account.
//!
//! ## Features
//!
//! - **Webhooks**: Verify and process Stripe payment and subscription events
//! - **Dunning Emails**: Per-user templates with recovery links
//! - **Recovery Flow**: Customers retry a failed charge with a new card
//! - **Scheduled Retries**: Re-attempt failed charges on an interval
//! - **Dead-Letter Replay**: Re-run webhook events whose processing failed
//! - **Checkout**: Subscribe merchants to the service itself

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod models;
pub mod notifier;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod templates;
pub mod webhooks;


// Checkout
pub use checkout::CheckoutService;

// Client
pub use client::{
    ChargeOutcome, CheckoutLink, CheckoutRequest, PaymentProcessor, StripeClient, StripeConfig,
};

// Email
pub use email::{EmailConfig, NotificationSender, ResendEmailService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, WebhookEvent};

// Models
pub use models::{
    DeliveryStatus, DunningLog, EmailTemplate, FailedPayment, NewEmailTemplate, NewUser,
    PaymentStatus, ProcessingResult, RecoveryStats, SubscriptionStatus, TemplateType,
    TemplateUpdate, User, WebhookEventRecord,
};

// Notifier
pub use notifier::{recovery_url, DunningNotifier, NotifyOutcome};

// Recovery
pub use recovery::{RecoveryOutcome, RecoveryService, RecoverySummary};

// Retry
pub use retry::{RetryAction, RetryResult, RetryScheduler, MAX_RETRY_ATTEMPTS, RETRY_INTERVAL_HOURS};

// Store
pub use store::{DunningStore, InMemoryDunningStore, PgDunningStore};

// Templates
pub use templates::{format_amount, TemplateService};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookHandler, WebhookReplayResult};

use std::sync::Arc;

use sqlx::PgPool;

/// Settings shared by the dunning services
#[derive(Debug, Clone)]
pub struct DunningConfig {
    /// Base URL recovery links point at
    pub public_url: String,
    pub webhook_secret: String,
}

impl DunningConfig {
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            webhook_secret,
        })
    }
}

/// Main dunning service that combines all dunning functionality
#[derive(Clone)]
pub struct DunningService {
    pub store: Arc<dyn DunningStore>,
    pub checkout: CheckoutService,
    pub notifier: DunningNotifier,
    pub recovery: RecoveryService,
    pub retry: RetryScheduler,
    pub templates: TemplateService,
    pub webhooks: WebhookHandler,
}

impl DunningService {
    /// Create a new dunning service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = DunningConfig::from_env()?;
        let stripe = StripeClient::from_env()?;
        let email = ResendEmailService::from_env();

        if !email.is_enabled() {
            tracing::warn!("RESEND_API_KEY not set, dunning emails will not be delivered");
        }

        Ok(Self::new(
            Arc::new(PgDunningStore::new(pool)),
            Arc::new(stripe),
            Arc::new(email),
            config,
        ))
    }

    /// Create a new dunning service with explicit collaborators
    pub fn new(
        store: Arc<dyn DunningStore>,
        processor: Arc<dyn PaymentProcessor>,
        sender: Arc<dyn NotificationSender>,
        config: DunningConfig,
    ) -> Self {
        let notifier = DunningNotifier::new(store.clone(), sender, config.public_url.clone());

        Self {
            checkout: CheckoutService::new(
                store.clone(),
                processor.clone(),
                config.public_url.clone(),
            ),
            recovery: RecoveryService::new(store.clone(), processor.clone(), notifier.clone()),
            retry: RetryScheduler::new(store.clone(), processor.clone(), notifier.clone()),
            templates: TemplateService::new(store.clone()),
            webhooks: WebhookHandler::new(
                store.clone(),
                processor,
                notifier.clone(),
                config.webhook_secret,
            ),
            notifier,
            store,
        }
    }
}

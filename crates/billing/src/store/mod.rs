//! Persistence for users, failed payments, dunning logs, templates and
//! webhook events.
//!
//! Every read-modify-write the dunning flow depends on is a single store
//! operation, so implementations can make it atomic: the failure upsert,
//! the `failed -> recovered` transition and template activation.

mod memory;
mod postgres;

pub use memory::InMemoryDunningStore;
pub use postgres::PgDunningStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    DeliveryStatus, DunningLog, EmailTemplate, FailedPayment, FailureUpsert, NewEmailTemplate,
    NewFailedPayment, NewUser, PaymentStatus, ProcessingResult, RecoveryStats, SubscriptionStatus,
    TemplateType, TemplateUpdate, User, WebhookEventRecord,
};

/// How long a webhook claim may sit in `processing` before another worker
/// is allowed to take it over
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[async_trait]
pub trait DunningStore: Send + Sync {
    // ============ USERS ============

    /// Insert a user; `Conflict` if the email is taken
    async fn create_user(&self, new: NewUser) -> BillingResult<User>;

    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>>;

    async fn find_user_by_stripe_account(&self, account_id: &str) -> BillingResult<Option<User>>;

    async fn find_user_by_billing_customer(&self, customer_id: &str)
        -> BillingResult<Option<User>>;

    /// Link a processor account and set the connected flag; `Conflict` if
    /// the account belongs to another user
    async fn link_stripe_account(&self, user_id: Uuid, account_id: &str) -> BillingResult<User>;

    /// Returns false if the user does not exist
    async fn set_subscription_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<bool>;

    async fn set_billing_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<bool>;

    // ============ FAILED PAYMENTS ============

    /// Insert a failed payment, or bump `attempt_count` on the existing row
    /// for the same payment intent
    async fn record_payment_failure(&self, new: NewFailedPayment) -> BillingResult<FailureUpsert>;

    async fn find_failed_payment(&self, id: i64) -> BillingResult<Option<FailedPayment>>;

    async fn find_failed_payment_by_token(&self, token: Uuid)
        -> BillingResult<Option<FailedPayment>>;

    async fn find_failed_payment_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<FailedPayment>>;

    /// Transition `failed -> recovered`, stamping `recovered_at` and clearing
    /// `next_retry_at`. Returns the updated row only when this call performed
    /// the transition.
    async fn mark_recovered(
        &self,
        id: i64,
        recovered_at: OffsetDateTime,
    ) -> BillingResult<Option<FailedPayment>>;

    async fn list_failed_payments(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<FailedPayment>>;

    /// Still-failed payments whose `next_retry_at` has passed, oldest first
    async fn due_retries(&self, now: OffsetDateTime, limit: i64)
        -> BillingResult<Vec<FailedPayment>>;

    /// Count one scheduler attempt and set or clear `next_retry_at` on a
    /// still-failed payment
    async fn record_retry_attempt(&self, id: i64, next_retry_at: Option<OffsetDateTime>)
        -> BillingResult<bool>;

    async fn recovery_stats(&self, user_id: Uuid) -> BillingResult<RecoveryStats>;

    // ============ DUNNING LOGS ============

    async fn append_dunning_log(
        &self,
        failed_payment_id: i64,
        template_type: TemplateType,
        status: DeliveryStatus,
    ) -> BillingResult<DunningLog>;

    async fn list_dunning_logs(&self, failed_payment_id: i64) -> BillingResult<Vec<DunningLog>>;

    // ============ EMAIL TEMPLATES ============

    /// Insert a template; an enabled template disables its siblings
    async fn create_template(&self, new: NewEmailTemplate) -> BillingResult<EmailTemplate>;

    /// Update a template owned by `user_id`; enabling it disables its siblings
    async fn update_template(
        &self,
        user_id: Uuid,
        template_id: Uuid,
        update: TemplateUpdate,
    ) -> BillingResult<Option<EmailTemplate>>;

    async fn list_templates(&self, user_id: Uuid) -> BillingResult<Vec<EmailTemplate>>;

    async fn find_active_template(
        &self,
        user_id: Uuid,
        template_type: TemplateType,
    ) -> BillingResult<Option<EmailTemplate>>;

    // ============ WEBHOOK EVENTS ============

    /// Claim exclusive processing of an event. Returns false when the event
    /// was already processed or is being processed by someone else (unless
    /// that claim is older than `PROCESSING_TIMEOUT_MINUTES`).
    async fn claim_webhook_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<bool>;

    /// Re-claim a recorded event for replay. Only events that errored or
    /// whose claim went stale can be re-claimed.
    async fn reclaim_webhook_event(&self, stripe_event_id: &str) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn find_webhook_event(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>>;

    async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
}

//! Stripe webhook handling
//!
//! Verifies signed deliveries, claims each event exactly once in the
//! webhook event table, and dispatches payment and subscription events.
//! Processing failures are recorded against the event and replayed from
//! the stored payload instead of being surfaced to Stripe.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PaymentProcessor;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionObject, EventKind, PaymentIntentObject, SubscriptionObject, WebhookEvent,
};
use crate::models::{
    FailureUpsert, NewFailedPayment, ProcessingResult, SubscriptionStatus, TemplateType,
    WebhookEventRecord,
};
use crate::notifier::DunningNotifier;
use crate::recovery::settle_recovery;
use crate::retry::RETRY_INTERVAL_HOURS;
use crate::store::DunningStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`)
///
/// Any `v1` entry may match; rotated secrets produce several.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(secret, timestamp, payload)
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;

    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!(
            candidates = candidates.len(),
            "Webhook signature mismatch"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// How a delivered or replayed event was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    Processed,
    /// Recorded as `error` for replay
    Failed(String),
    /// Already processed, or claimed by another worker
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct WebhookReplayResult {
    pub stripe_event_id: String,
    pub disposition: WebhookDisposition,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn DunningStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: DunningNotifier,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn DunningStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: DunningNotifier,
        webhook_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the signature, then parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now)?;

        let event: WebhookEvent = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput(format!("Malformed event: {}", e))
        })?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook signature verified"
        );
        Ok(event)
    }

    /// Verify and handle a raw delivery
    ///
    /// Only a bad signature or a failed claim is an error. A signed body that
    /// is not a valid event is kept as `error` and acknowledged, since
    /// redelivering the same bytes cannot fix it.
    pub async fn receive(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, now)?;

        match serde_json::from_str::<WebhookEvent>(payload) {
            Ok(event) => self.handle_event(&event, payload).await,
            Err(e) => self.record_malformed(payload, &e.to_string()).await,
        }
    }

    async fn record_malformed(
        &self,
        payload: &str,
        parse_error: &str,
    ) -> BillingResult<WebhookDisposition> {
        let raw: Option<serde_json::Value> = serde_json::from_str(payload).ok();
        let field = |name: &str| {
            raw.as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let event_id = field("id").unwrap_or_else(|| {
            let digest = <Sha256 as sha2::Digest>::digest(payload.as_bytes());
            format!("malformed_{}", hex::encode(digest))
        });
        let event_type = field("type").unwrap_or_else(|| "unknown".to_string());

        tracing::error!(
            event_id = %event_id,
            event_type = %event_type,
            parse_error = %parse_error,
            "Signed webhook payload is not a valid event"
        );

        if !self
            .store
            .claim_webhook_event(&event_id, &event_type, payload)
            .await?
        {
            return Ok(WebhookDisposition::Duplicate);
        }

        let message = format!("Malformed event: {}", parse_error);
        self.record_result(&event_id, ProcessingResult::Error, Some(&message))
            .await;
        Ok(WebhookDisposition::Failed(message))
    }

    /// Handle a verified event
    ///
    /// Claims the event id atomically so redeliveries and concurrent
    /// deliveries are processed once. Only a failure to claim is returned
    /// as an error; processing failures are recorded on the event.
    pub async fn handle_event(
        &self,
        event: &WebhookEvent,
        payload: &str,
    ) -> BillingResult<WebhookDisposition> {
        let claimed = self
            .store
            .claim_webhook_event(&event.id, &event.event_type, payload)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                e
            })?;

        if !claimed {
            let existing = self
                .store
                .find_webhook_event(&event.id)
                .await
                .ok()
                .flatten()
                .map(|r| r.processing_result);

            let reason = match existing {
                Some(ProcessingResult::Success) => "already processed successfully",
                Some(ProcessingResult::Processing) => "currently being processed by another worker",
                Some(ProcessingResult::Error) => "previously failed, awaiting replay",
                None => "unknown (race condition?)",
            };

            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Duplicate webhook event"
            );

            // A redelivered failure is still another failed attempt
            if existing == Some(ProcessingResult::Success)
                && event.kind() == EventKind::PaymentIntentFailed
            {
                if let Err(e) = self.count_redelivered_failure(event).await {
                    tracing::warn!(
                        event_id = %event.id,
                        error = %e,
                        "Failed to count redelivered payment failure"
                    );
                }
            }
            return Ok(WebhookDisposition::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        Ok(self.process_and_record(event).await)
    }

    async fn process_and_record(&self, event: &WebhookEvent) -> WebhookDisposition {
        let result = self.process_event_internal(event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => (ProcessingResult::Success, None),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed, recorded for replay"
                );
                (ProcessingResult::Error, Some(e.to_string()))
            }
        };

        self.record_result(&event.id, processing_result, error_message.as_deref())
            .await;

        match error_message {
            None => WebhookDisposition::Processed,
            Some(message) => WebhookDisposition::Failed(message),
        }
    }

    /// Persist the processing result, retrying once
    async fn record_result(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        let first = self
            .store
            .finish_webhook_event(event_id, result, error_message)
            .await;

        if let Err(e) = first {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to update webhook event failed, retrying"
            );

            if let Err(retry_err) = self
                .store
                .finish_webhook_event(event_id, result, error_message)
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    processing_result = %result,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to update webhook event after retry; it stays in 'processing' \
                     until the claim goes stale"
                );
            }
        }
    }

    async fn process_event_internal(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.kind() {
            EventKind::PaymentIntentFailed => self.handle_payment_intent_failed(event).await,
            EventKind::PaymentIntentSucceeded => self.handle_payment_intent_succeeded(event).await,
            EventKind::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventKind::SubscriptionUpdated => self.handle_subscription_changed(event, false).await,
            EventKind::SubscriptionDeleted => self.handle_subscription_changed(event, true).await,
            EventKind::Other(event_type) => {
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_payment_intent_failed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let intent: PaymentIntentObject = event.object("PaymentIntent")?;

        let account_id = match intent.on_behalf_of.as_deref().or(event.account.as_deref()) {
            Some(id) => id,
            None => {
                tracing::warn!(
                    payment_intent_id = %intent.id,
                    "Failed payment carries no connected account, skipping"
                );
                return Ok(());
            }
        };

        let user = match self.store.find_user_by_stripe_account(account_id).await? {
            Some(user) => user,
            None => {
                tracing::warn!(
                    account_id = %account_id,
                    payment_intent_id = %intent.id,
                    "Failed payment for unknown account, skipping"
                );
                return Ok(());
            }
        };

        let customer_email = match intent.receipt_email.clone().filter(|e| !e.is_empty()) {
            Some(email) => Some(email),
            // Direct charges keep the customer on the connected account
            None => match &intent.customer {
                Some(customer_id) => {
                    self.processor
                        .customer_email(event.account.as_deref(), customer_id)
                        .await?
                }
                None => None,
            },
        };

        let customer_email = match customer_email {
            Some(email) => email,
            None => {
                tracing::info!(
                    user_id = %user.id,
                    payment_intent_id = %intent.id,
                    "Failed payment has no customer email, skipping"
                );
                return Ok(());
            }
        };

        let now = OffsetDateTime::now_utc();
        let upsert = self
            .store
            .record_payment_failure(NewFailedPayment {
                user_id: user.id,
                payment_intent_id: intent.id.clone(),
                customer_id: intent.customer.clone(),
                customer_email,
                amount: intent.amount,
                currency: intent.currency.to_lowercase(),
                failure_reason: intent.failure_reason(),
                next_retry_at: Some(now + time::Duration::hours(RETRY_INTERVAL_HOURS)),
                recovery_token: Uuid::new_v4(),
            })
            .await?;

        match upsert {
            FailureUpsert::Created(payment) => {
                tracing::info!(
                    user_id = %user.id,
                    failed_payment_id = payment.id,
                    payment_intent_id = %payment.payment_intent_id,
                    amount = payment.amount,
                    currency = %payment.currency,
                    "Recorded failed payment"
                );

                if let Err(e) = self
                    .notifier
                    .notify(payment.id, user.id, TemplateType::FirstFailure)
                    .await
                {
                    tracing::warn!(
                        failed_payment_id = payment.id,
                        error = %e,
                        "Failed to send first-failure notification"
                    );
                }
            }
            FailureUpsert::Repeated(payment) => {
                tracing::info!(
                    user_id = %user.id,
                    failed_payment_id = payment.id,
                    payment_intent_id = %payment.payment_intent_id,
                    attempt_count = payment.attempt_count,
                    "Payment failed again"
                );
            }
        }

        Ok(())
    }

    /// Bump `attempt_count` on an already tracked, still-failed payment
    ///
    /// Goes through the same upsert as a new failure, which never notifies
    /// for a row that already exists.
    async fn count_redelivered_failure(&self, event: &WebhookEvent) -> BillingResult<()> {
        let intent: PaymentIntentObject = event.object("PaymentIntent")?;

        let payment = match self.store.find_failed_payment_by_intent(&intent.id).await? {
            Some(payment) if !payment.is_recovered() => payment,
            _ => return Ok(()),
        };

        let upsert = self
            .store
            .record_payment_failure(NewFailedPayment {
                user_id: payment.user_id,
                payment_intent_id: payment.payment_intent_id,
                customer_id: payment.customer_id,
                customer_email: payment.customer_email,
                amount: payment.amount,
                currency: payment.currency,
                failure_reason: payment.failure_reason,
                next_retry_at: payment.next_retry_at,
                recovery_token: payment.recovery_token,
            })
            .await?;

        tracing::info!(
            event_id = %event.id,
            failed_payment_id = upsert.payment().id,
            attempt_count = upsert.payment().attempt_count,
            "Counted redelivered payment failure"
        );
        Ok(())
    }

    async fn handle_payment_intent_succeeded(&self, event: &WebhookEvent) -> BillingResult<()> {
        let intent: PaymentIntentObject = event.object("PaymentIntent")?;

        let payment = match self.store.find_failed_payment_by_intent(&intent.id).await? {
            Some(payment) => payment,
            None => {
                tracing::debug!(
                    payment_intent_id = %intent.id,
                    "Succeeded payment was never tracked as failed"
                );
                return Ok(());
            }
        };

        if payment.is_recovered() {
            tracing::info!(
                failed_payment_id = payment.id,
                payment_intent_id = %intent.id,
                "Payment already recovered"
            );
            return Ok(());
        }

        settle_recovery(self.store.as_ref(), &self.notifier, &payment).await?;
        Ok(())
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let session: CheckoutSessionObject = event.object("CheckoutSession")?;

        let user_id = match session
            .client_reference_id
            .as_deref()
            .and_then(|id| id.parse::<Uuid>().ok())
        {
            Some(id) => id,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "Checkout session without a user reference, skipping"
                );
                return Ok(());
            }
        };

        let customer_id = match session.customer.as_deref() {
            Some(id) => id,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    user_id = %user_id,
                    "Checkout session completed without a customer"
                );
                return Ok(());
            }
        };

        if !self.store.set_billing_customer(user_id, customer_id).await? {
            tracing::warn!(
                session_id = %session.id,
                user_id = %user_id,
                "Checkout completed for unknown user"
            );
            return Ok(());
        }

        self.store
            .set_subscription_status(user_id, SubscriptionStatus::Active)
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer_id,
            session_id = %session.id,
            "Subscription activated from checkout"
        );
        Ok(())
    }

    async fn handle_subscription_changed(
        &self,
        event: &WebhookEvent,
        deleted: bool,
    ) -> BillingResult<()> {
        let subscription: SubscriptionObject = event.object("Subscription")?;

        let user = match self
            .store
            .find_user_by_billing_customer(&subscription.customer)
            .await?
        {
            Some(user) => user,
            None => {
                tracing::warn!(
                    customer_id = %subscription.customer,
                    subscription_id = %subscription.id,
                    "Subscription event for unknown customer"
                );
                return Ok(());
            }
        };

        let status = if deleted {
            SubscriptionStatus::Canceled
        } else {
            match SubscriptionStatus::from_stripe(&subscription.status) {
                Some(status) => status,
                None => {
                    tracing::info!(
                        user_id = %user.id,
                        stripe_status = %subscription.status,
                        "Ignoring transitional subscription status"
                    );
                    return Ok(());
                }
            }
        };

        self.store.set_subscription_status(user.id, status).await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription.id,
            from = %user.subscription_status,
            to = %status,
            "Subscription status updated"
        );
        Ok(())
    }

    // ============ DEAD-LETTER ============

    pub async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_webhook_events(result, limit).await
    }

    /// Re-run a recorded event from its stored payload
    ///
    /// Only events that errored, or whose claim went stale, can be replayed.
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookDisposition> {
        let record = self
            .store
            .find_webhook_event(stripe_event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", stripe_event_id)))?;

        if !self.store.reclaim_webhook_event(stripe_event_id).await? {
            return Err(BillingError::Conflict(format!(
                "webhook event {} is {}",
                stripe_event_id, record.processing_result
            )));
        }

        let event: WebhookEvent = match serde_json::from_str(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                let message = format!("Stored payload is not a valid event: {}", e);
                self.record_result(stripe_event_id, ProcessingResult::Error, Some(&message))
                    .await;
                return Ok(WebhookDisposition::Failed(message));
            }
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Replaying webhook event"
        );

        Ok(self.process_and_record(&event).await)
    }

    /// Replay up to `limit` events recorded as `error`
    pub async fn replay_failed(&self, limit: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed = self
            .store
            .list_webhook_events(Some(ProcessingResult::Error), limit)
            .await?;

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            let disposition = match self.replay_webhook(&record.stripe_event_id).await {
                Ok(disposition) => disposition,
                Err(BillingError::Conflict(_)) => WebhookDisposition::Duplicate,
                Err(e) => {
                    tracing::error!(
                        event_id = %record.stripe_event_id,
                        error = %e,
                        "Webhook replay failed"
                    );
                    WebhookDisposition::Failed(e.to_string())
                }
            };
            results.push(WebhookReplayResult {
                stripe_event_id: record.stripe_event_id,
                disposition,
            });
        }

        if !results.is_empty() {
            let recovered = results
                .iter()
                .filter(|r| r.disposition == WebhookDisposition::Processed)
                .count();
            tracing::info!(
                replayed = results.len(),
                recovered = recovered,
                "Dead-letter replay finished"
            );
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"invoice.created","data":{"object":{}}}"#;

    fn header(secret: &str, timestamp: i64, payload: &str) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            compute_signature(secret, timestamp, payload).unwrap()
        )
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let now = 1_700_000_000;
        let sig = header(SECRET, now, PAYLOAD);
        assert!(verify_signature(PAYLOAD, &sig, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let now = 1_700_000_000;
        let good = compute_signature(SECRET, now, PAYLOAD).unwrap();
        let sig = format!("t={},v1={},v1={}", now, "00".repeat(32), good);
        assert!(verify_signature(PAYLOAD, &sig, SECRET, now).is_ok());
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let now = 1_700_000_000;
        let sig = header("whsec_other", now, PAYLOAD);
        assert!(matches!(
            verify_signature(PAYLOAD, &sig, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let now = 1_700_000_000;
        let sig = header(SECRET, now, PAYLOAD);
        let tampered = PAYLOAD.replace("evt_1", "evt_2");
        assert!(verify_signature(&tampered, &sig, SECRET, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let signed_at = 1_700_000_000;
        let sig = header(SECRET, signed_at, PAYLOAD);
        assert!(verify_signature(PAYLOAD, &sig, SECRET, signed_at + 301).is_err());
        assert!(verify_signature(PAYLOAD, &sig, SECRET, signed_at + 300).is_ok());
    }

    #[test]
    fn test_malformed_headers_are_rejected() {
        let now = 1_700_000_000;
        for bad in ["", "v1=abc", "t=1700000000", "t=notanumber,v1=abc", "garbage"] {
            assert!(
                verify_signature(PAYLOAD, bad, SECRET, now).is_err(),
                "header {:?} should be rejected",
                bad
            );
        }
    }
}

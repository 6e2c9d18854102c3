//! Scheduled charge retries
//!
//! Failed payments carry a `next_retry_at`; the worker calls
//! [`RetryScheduler::run_due_retries`] periodically to confirm the original
//! payment intent again with the customer's default payment method.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::client::{ChargeOutcome, PaymentProcessor};
use crate::error::{BillingError, BillingResult};
use crate::models::{FailedPayment, TemplateType};
use crate::notifier::DunningNotifier;
use crate::recovery::settle_recovery;
use crate::store::DunningStore;

/// Delay between automatic retries
pub const RETRY_INTERVAL_HOURS: i64 = 24;

/// Attempts after which automatic retries stop
pub const MAX_RETRY_ATTEMPTS: i32 = 4;

/// Stripe's status for an intent with nothing to charge
const NO_PAYMENT_METHOD: &str = "requires_payment_method";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    Recovered,
    /// Another path recovered it first
    AlreadyRecovered,
    /// Charge is processing; checked again next interval
    Pending,
    /// Declined; customer notified and retry rescheduled
    Rescheduled,
    /// Declined on the last allowed attempt, or rejected outright; no
    /// further retries
    Exhausted,
    /// Processor or store failure; retry rescheduled without notifying
    Deferred(String),
}

#[derive(Debug, Clone)]
pub struct RetryResult {
    pub failed_payment_id: i64,
    pub action: RetryAction,
}

#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn DunningStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: DunningNotifier,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn DunningStore>,
        processor: Arc<dyn PaymentProcessor>,
        notifier: DunningNotifier,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
        }
    }

    /// Retry up to `limit` payments whose `next_retry_at` is at or before `now`
    pub async fn run_due_retries(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<RetryResult>> {
        let due = self.store.due_retries(now, limit).await?;
        if due.is_empty() {
            tracing::debug!("No payments due for retry");
            return Ok(Vec::new());
        }

        tracing::info!(count = due.len(), "Retrying due payments");

        let mut results = Vec::with_capacity(due.len());
        for payment in due {
            let action = match self.retry_one(&payment, now).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(
                        failed_payment_id = payment.id,
                        error = %e,
                        "Retry bookkeeping failed"
                    );
                    RetryAction::Deferred(e.to_string())
                }
            };
            results.push(RetryResult {
                failed_payment_id: payment.id,
                action,
            });
        }

        Ok(results)
    }

    async fn retry_one(
        &self,
        payment: &FailedPayment,
        now: OffsetDateTime,
    ) -> BillingResult<RetryAction> {
        let next = now + time::Duration::hours(RETRY_INTERVAL_HOURS);
        let attempts = attempts_including_this_retry(payment);
        let next_retry = (attempts < MAX_RETRY_ATTEMPTS).then_some(next);

        let account = self
            .store
            .find_user(payment.user_id)
            .await?
            .and_then(|user| user.stripe_account_id);

        let decline_reason = match self.charge(account.as_deref(), payment).await {
            Ok(ChargeOutcome::Succeeded) => {
                let won = settle_recovery(self.store.as_ref(), &self.notifier, payment).await?;
                return Ok(if won {
                    RetryAction::Recovered
                } else {
                    RetryAction::AlreadyRecovered
                });
            }
            Ok(ChargeOutcome::Processing) => {
                self.store.record_retry_attempt(payment.id, next_retry).await?;
                return Ok(RetryAction::Pending);
            }
            Ok(ChargeOutcome::Incomplete(status)) => status,
            Err(BillingError::PaymentDeclined(reason)) => reason,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    failed_payment_id = payment.id,
                    payment_intent_id = %payment.payment_intent_id,
                    error = %e,
                    "Retry could not reach the processor"
                );
                self.store.record_retry_attempt(payment.id, next_retry).await?;
                return Ok(match next_retry {
                    Some(_) => RetryAction::Deferred(e.to_string()),
                    None => RetryAction::Exhausted,
                });
            }
            Err(e) => {
                // Retrying cannot fix a rejected request
                tracing::error!(
                    failed_payment_id = payment.id,
                    payment_intent_id = %payment.payment_intent_id,
                    error = %e,
                    "Retry rejected by the processor, giving up"
                );
                self.store.record_retry_attempt(payment.id, None).await?;
                return Ok(RetryAction::Exhausted);
            }
        };

        self.store.record_retry_attempt(payment.id, next_retry).await?;

        if next_retry.is_none() {
            tracing::info!(
                failed_payment_id = payment.id,
                payment_intent_id = %payment.payment_intent_id,
                attempts = attempts,
                reason = %decline_reason,
                "Retries exhausted"
            );
            return Ok(RetryAction::Exhausted);
        }

        tracing::info!(
            failed_payment_id = payment.id,
            payment_intent_id = %payment.payment_intent_id,
            attempts = attempts,
            reason = %decline_reason,
            "Retry declined, rescheduled"
        );

        if let Err(e) = self
            .notifier
            .notify(payment.id, payment.user_id, TemplateType::RetryFailed)
            .await
        {
            tracing::warn!(
                failed_payment_id = payment.id,
                error = %e,
                "Failed to send retry-failed notification"
            );
        }

        Ok(RetryAction::Rescheduled)
    }

    /// Confirm the intent again with the customer's default payment method
    ///
    /// Stripe detaches the method from an intent once it fails, so a bare
    /// confirm would be rejected.
    async fn charge(
        &self,
        account: Option<&str>,
        payment: &FailedPayment,
    ) -> BillingResult<ChargeOutcome> {
        let method = match payment.customer_id.as_deref() {
            Some(customer_id) => {
                self.processor
                    .default_payment_method(account, customer_id)
                    .await?
            }
            None => None,
        };

        match method {
            Some(method) => {
                self.processor
                    .confirm_payment_intent(account, &payment.payment_intent_id, Some(&method))
                    .await
            }
            None => Ok(ChargeOutcome::Incomplete(NO_PAYMENT_METHOD.to_string())),
        }
    }
}

/// Attempts made once the current retry runs
///
/// The original charge counts as the first. `payment_failed` webhooks bump
/// `attempt_count` for declined retries too, so the larger count wins
/// instead of adding them.
fn attempts_including_this_retry(payment: &FailedPayment) -> i32 {
    payment.attempt_count.max(payment.retry_count + 2)
}

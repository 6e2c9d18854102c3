//! Customer-facing recovery flow
//!
//! A customer follows the link from a dunning email, supplies a new payment
//! method and the original payment intent is confirmed with it. The
//! recovery token is the only credential, so nothing here requires a
//! logged-in user.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ChargeOutcome, PaymentProcessor};
use crate::error::{BillingError, BillingResult};
use crate::models::{FailedPayment, PaymentStatus, TemplateType};
use crate::notifier::DunningNotifier;
use crate::store::DunningStore;
use crate::templates::format_amount;

/// Transition a failed payment to `recovered` and send the recovered
/// notification
///
/// Shared by the webhook, the recovery page and the retry scheduler. Only
/// the caller that wins the transition notifies; returns whether this call
/// won.
pub(crate) async fn settle_recovery(
    store: &dyn DunningStore,
    notifier: &DunningNotifier,
    payment: &FailedPayment,
) -> BillingResult<bool> {
    let recovered = match store
        .mark_recovered(payment.id, OffsetDateTime::now_utc())
        .await?
    {
        Some(recovered) => recovered,
        None => {
            tracing::info!(
                failed_payment_id = payment.id,
                payment_intent_id = %payment.payment_intent_id,
                "Payment was already recovered by another path"
            );
            return Ok(false);
        }
    };

    tracing::info!(
        user_id = %recovered.user_id,
        failed_payment_id = recovered.id,
        payment_intent_id = %recovered.payment_intent_id,
        amount = recovered.amount,
        currency = %recovered.currency,
        "Payment recovered"
    );

    if let Err(e) = notifier
        .notify(recovered.id, recovered.user_id, TemplateType::PaymentRecovered)
        .await
    {
        tracing::warn!(
            failed_payment_id = recovered.id,
            error = %e,
            "Failed to send payment-recovered notification"
        );
    }

    Ok(true)
}

/// What the recovery page shows before the customer pays
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySummary {
    pub amount: i64,
    pub currency: String,
    pub formatted_amount: String,
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub recovered_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    /// Nothing to do; no processor calls were made
    AlreadyRecovered,
    /// Charge accepted but not settled; the succeeded webhook finishes it
    Pending,
}

#[derive(Clone)]
pub struct RecoveryService {
    store: Arc<dyn DunningStore>,
    processor: Arc<dyn PaymentProcessor>,
    notifier: DunningNotifier,
}

impl RecoveryService {
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

    async fn payment_for_token(&self, token: Uuid) -> BillingResult<FailedPayment> {
        self.store
            .find_failed_payment_by_token(token)
            .await?
            .ok_or_else(|| BillingError::NotFound("recovery link".to_string()))
    }

    pub async fn summary(&self, token: Uuid) -> BillingResult<RecoverySummary> {
        let payment = self.payment_for_token(token).await?;
        Ok(RecoverySummary {
            formatted_amount: format_amount(payment.amount, &payment.currency),
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            recovered_at: payment.recovered_at,
        })
    }

    /// Retry the failed charge with a new payment method
    pub async fn recover(&self, token: Uuid, payment_method: &str) -> BillingResult<RecoveryOutcome> {
        let payment_method = payment_method.trim();
        if payment_method.is_empty() {
            return Err(BillingError::InvalidInput(
                "payment_method is required".to_string(),
            ));
        }

        let payment = self.payment_for_token(token).await?;
        if payment.is_recovered() {
            tracing::info!(
                failed_payment_id = payment.id,
                "Recovery requested for an already recovered payment"
            );
            return Ok(RecoveryOutcome::AlreadyRecovered);
        }

        let account = self
            .store
            .find_user(payment.user_id)
            .await?
            .and_then(|user| user.stripe_account_id);

        if let Some(customer_id) = &payment.customer_id {
            self.processor
                .set_default_payment_method(account.as_deref(), customer_id, payment_method)
                .await?;
        }

        let outcome = self
            .processor
            .confirm_payment_intent(
                account.as_deref(),
                &payment.payment_intent_id,
                Some(payment_method),
            )
            .await?;

        match outcome {
            ChargeOutcome::Succeeded => {
                if settle_recovery(self.store.as_ref(), &self.notifier, &payment).await? {
                    Ok(RecoveryOutcome::Recovered)
                } else {
                    Ok(RecoveryOutcome::AlreadyRecovered)
                }
            }
            ChargeOutcome::Processing => {
                tracing::info!(
                    failed_payment_id = payment.id,
                    payment_intent_id = %payment.payment_intent_id,
                    "Recovery charge is processing"
                );
                Ok(RecoveryOutcome::Pending)
            }
            ChargeOutcome::Incomplete(status) => {
                tracing::warn!(
                    failed_payment_id = payment.id,
                    payment_intent_id = %payment.payment_intent_id,
                    stripe_status = %status,
                    "Recovery charge did not complete"
                );
                Err(BillingError::PaymentDeclined(format!(
                    "Payment could not be completed ({})",
                    status
                )))
            }
        }
    }
}

//! Dunning notifications
//!
//! Picks the user's enabled template for an event, fills in the
//! placeholders for a failed payment, hands the message to the
//! [`NotificationSender`] and records the outcome in the dunning log.

use std::sync::Arc;

use uuid::Uuid;

use crate::email::NotificationSender;
use crate::error::{BillingError, BillingResult};
use crate::models::{DeliveryStatus, TemplateType};
use crate::store::DunningStore;
use crate::templates::{format_amount, render, TemplateVars};

/// What happened to a notification request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// User has no enabled template of this type; nothing sent or logged
    NoTemplate,
    Sent,
    DeliveryFailed,
}

/// Public URL a customer follows to update their payment method
pub fn recovery_url(public_url: &str, token: Uuid) -> String {
    format!("{}/recover/{}", public_url.trim_end_matches('/'), token)
}

#[derive(Clone)]
pub struct DunningNotifier {
    store: Arc<dyn DunningStore>,
    sender: Arc<dyn NotificationSender>,
    public_url: String,
}

impl DunningNotifier {
    pub fn new(
        store: Arc<dyn DunningStore>,
        sender: Arc<dyn NotificationSender>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sender,
            public_url: public_url.into(),
        }
    }

    pub async fn notify(
        &self,
        failed_payment_id: i64,
        user_id: Uuid,
        template_type: TemplateType,
    ) -> BillingResult<NotifyOutcome> {
        let template = match self.store.find_active_template(user_id, template_type).await? {
            Some(t) => t,
            None => {
                tracing::info!(
                    user_id = %user_id,
                    failed_payment_id = failed_payment_id,
                    template_type = %template_type,
                    "No enabled template, skipping notification"
                );
                return Ok(NotifyOutcome::NoTemplate);
            }
        };

        let payment = self
            .store
            .find_failed_payment(failed_payment_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("failed payment {}", failed_payment_id))
            })?;

        let link = recovery_url(&self.public_url, payment.recovery_token);
        let amount = format_amount(payment.amount, &payment.currency);
        let vars = TemplateVars {
            recovery_link: &link,
            amount: &amount,
            customer_email: &payment.customer_email,
        };

        let subject = render(&template.subject, &vars);
        let body = render(&template.body, &vars);

        let delivered = self
            .sender
            .send(&payment.customer_email, &subject, &body)
            .await;
        let status = if delivered {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };

        self.store
            .append_dunning_log(payment.id, template_type, status)
            .await?;

        tracing::info!(
            failed_payment_id = payment.id,
            payment_intent_id = %payment.payment_intent_id,
            template_type = %template_type,
            status = %status,
            "Dunning notification processed"
        );

        Ok(if delivered {
            NotifyOutcome::Sent
        } else {
            NotifyOutcome::DeliveryFailed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_url_trims_trailing_slash() {
        let token = Uuid::nil();
        assert_eq!(
            recovery_url("https://pay.example.com/", token),
            "https://pay.example.com/recover/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            recovery_url("https://pay.example.com", token),
            "https://pay.example.com/recover/00000000-0000-0000-0000-000000000000"
        );
    }
}

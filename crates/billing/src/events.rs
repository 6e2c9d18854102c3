//! Webhook event envelope
//!
//! Only the fields the dunning flow reads are modelled, so payloads from
//! newer Stripe API versions still parse.

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};

/// Signed event delivered to the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    /// Connected account the event originated from
    #[serde(default)]
    pub account: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Event types the processor dispatches on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PaymentIntentFailed,
    PaymentIntentSucceeded,
    CheckoutSessionCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other(String),
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            "payment_intent.payment_failed" => EventKind::PaymentIntentFailed,
            "payment_intent.succeeded" => EventKind::PaymentIntentSucceeded,
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// Deserialize `data.object` into the expected object type
    pub fn object<T: serde::de::DeserializeOwned>(&self, expected: &str) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookEventNotSupported(format!("Expected {}: {}", expected, e))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub receipt_email: Option<String>,
    #[serde(default)]
    pub on_behalf_of: Option<String>,
    #[serde(default)]
    pub last_payment_error: Option<LastPaymentError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastPaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl PaymentIntentObject {
    /// Human-readable failure reason, most specific first
    pub fn failure_reason(&self) -> Option<String> {
        self.last_payment_error.as_ref().and_then(|e| {
            e.message
                .clone()
                .or_else(|| e.decline_code.clone())
                .or_else(|| e.code.clone())
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_failed_payment_intent_event() {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.payment_failed",
            "created": 1_700_000_000,
            "api_version": "2024-06-20",
            "data": {
                "object": {
                    "id": "pi_1",
                    "object": "payment_intent",
                    "amount": 4999,
                    "currency": "usd",
                    "customer": "cus_1",
                    "receipt_email": null,
                    "on_behalf_of": "acct_1",
                    "last_payment_error": {
                        "code": "card_declined",
                        "decline_code": "insufficient_funds",
                        "message": "Your card has insufficient funds."
                    }
                }
            }
        });

        let event: WebhookEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.kind(), EventKind::PaymentIntentFailed);

        let intent: PaymentIntentObject = event.object("PaymentIntent").unwrap();
        assert_eq!(intent.amount, 4999);
        assert_eq!(intent.on_behalf_of.as_deref(), Some("acct_1"));
        assert_eq!(
            intent.failure_reason().as_deref(),
            Some("Your card has insufficient funds.")
        );
    }

    #[test]
    fn test_unknown_event_type_is_other() {
        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_2",
            "type": "invoice.created",
            "data": { "object": {} }
        }))
        .unwrap();
        assert_eq!(event.kind(), EventKind::Other("invoice.created".to_string()));
    }

    #[test]
    fn test_wrong_object_shape_is_reported() {
        let event: WebhookEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_3",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "cs_1" } }
        }))
        .unwrap();
        let err = event.object::<PaymentIntentObject>("PaymentIntent").unwrap_err();
        assert!(matches!(err, BillingError::WebhookEventNotSupported(_)));
    }
}

//! Persistent records for the dunning flow
//!
//! Status columns are stored as TEXT and mapped onto enums through
//! `TryFrom<String>`, so the same row types serve the PostgreSQL and the
//! in-memory stores.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Unrecognised value in a TEXT status column
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, UnknownVariant> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, UnknownVariant> {
                value.parse()
            }
        }
    };
}

text_enum! {
    /// Subscription state of a user's own plan with the dunning service
    SubscriptionStatus ("subscription status") {
        Trial => "trial",
        Active => "active",
        PastDue => "past_due",
        Canceled => "canceled",
    }
}

text_enum! {
    PaymentStatus ("payment status") {
        Failed => "failed",
        Recovered => "recovered",
    }
}

text_enum! {
    /// Outcome recorded on a dunning log row
    DeliveryStatus ("delivery status") {
        Sent => "sent",
        Failed => "failed",
    }
}

text_enum! {
    /// Which dunning email a template is used for
    TemplateType ("template type") {
        FirstFailure => "first_failure",
        RetryFailed => "retry_failed",
        PaymentRecovered => "payment_recovered",
    }
}

text_enum! {
    ProcessingResult ("processing result") {
        Processing => "processing",
        Success => "success",
        Error => "error",
    }
}

impl SubscriptionStatus {
    /// Map a Stripe subscription status onto ours
    pub fn from_stripe(status: &str) -> Option<Self> {
        match status {
            "trialing" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub stripe_account_id: Option<String>,
    pub stripe_connected: bool,
    pub billing_customer_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FailedPayment {
    pub id: i64,
    pub user_id: Uuid,
    pub payment_intent_id: String,
    pub customer_id: Option<String>,
    pub customer_email: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub attempt_count: i32,
    /// Charges attempted by the retry scheduler
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    pub recovery_token: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub recovered_at: Option<OffsetDateTime>,
}

impl FailedPayment {
    pub fn is_recovered(&self) -> bool {
        self.status == PaymentStatus::Recovered
    }
}

#[derive(Debug, Clone)]
pub struct NewFailedPayment {
    pub user_id: Uuid,
    pub payment_intent_id: String,
    pub customer_id: Option<String>,
    pub customer_email: String,
    pub amount: i64,
    pub currency: String,
    pub failure_reason: Option<String>,
    pub next_retry_at: Option<OffsetDateTime>,
    pub recovery_token: Uuid,
}

/// Result of recording a payment failure against the payment-intent key
#[derive(Debug, Clone)]
pub enum FailureUpsert {
    /// First failure for this payment intent
    Created(FailedPayment),
    /// Already tracked; attempt count was incremented
    Repeated(FailedPayment),
}

impl FailureUpsert {
    pub fn payment(&self) -> &FailedPayment {
        match self {
            FailureUpsert::Created(p) | FailureUpsert::Repeated(p) => p,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DunningLog {
    pub id: Uuid,
    pub failed_payment_id: i64,
    #[sqlx(try_from = "String")]
    pub template_type: TemplateType,
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub template_type: TemplateType,
    pub subject: String,
    pub body: String,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewEmailTemplate {
    pub user_id: Uuid,
    pub template_type: TemplateType,
    pub subject: String,
    pub body: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateUpdate {
    pub subject: Option<String>,
    pub body: Option<String>,
    pub enabled: Option<bool>,
}

/// Stored webhook event (idempotency claim and dead-letter entry)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    #[serde(skip_serializing)]
    pub payload: String,
    #[sqlx(try_from = "String")]
    pub processing_result: ProcessingResult,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Per-user recovery totals for the dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct RecoveryStats {
    pub failed_count: i64,
    pub recovered_count: i64,
    /// Minor units, summed across currencies
    pub recovered_amount: i64,
}

//! Dunning email templates
//!
//! Placeholder substitution, currency formatting, and per-user template
//! management.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{EmailTemplate, NewEmailTemplate, TemplateType, TemplateUpdate};
use crate::store::DunningStore;

pub const PLACEHOLDER_RECOVERY_LINK: &str = "{{recovery_link}}";
pub const PLACEHOLDER_AMOUNT: &str = "{{amount}}";
pub const PLACEHOLDER_CUSTOMER_EMAIL: &str = "{{customer_email}}";

const MAX_SUBJECT_LEN: usize = 200;
const MAX_BODY_LEN: usize = 50_000;

fn currency_symbol(currency: &str) -> Option<&'static str> {
    match currency.to_ascii_lowercase().as_str() {
        "usd" | "cad" | "aud" | "nzd" | "sgd" | "hkd" | "mxn" => Some("$"),
        "eur" => Some("€"),
        "gbp" => Some("£"),
        "jpy" | "cny" => Some("¥"),
        "inr" => Some("₹"),
        _ => None,
    }
}

/// Format minor units as a currency amount with two decimals
///
/// `4999` in `usd` renders as `$49.99`; currencies without a known symbol
/// are prefixed with their upper-case code.
pub fn format_amount(amount_minor: i64, currency: &str) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    let value = format!("{}.{:02}", abs / 100, abs % 100);

    match currency_symbol(currency) {
        Some(symbol) => format!("{sign}{symbol}{value}"),
        None => format!("{sign}{} {value}", currency.to_ascii_uppercase()),
    }
}

/// Values substituted into a template
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub recovery_link: &'a str,
    pub amount: &'a str,
    pub customer_email: &'a str,
}

pub fn render(text: &str, vars: &TemplateVars<'_>) -> String {
    text.replace(PLACEHOLDER_RECOVERY_LINK, vars.recovery_link)
        .replace(PLACEHOLDER_AMOUNT, vars.amount)
        .replace(PLACEHOLDER_CUSTOMER_EMAIL, vars.customer_email)
}

/// Templates every new user starts with
pub fn default_templates(user_id: Uuid) -> Vec<NewEmailTemplate> {
    vec![
        NewEmailTemplate {
            user_id,
            template_type: TemplateType::FirstFailure,
            subject: "Your payment of {{amount}} didn't go through".to_string(),
            body: "<p>Hi {{customer_email}},</p>\
                   <p>We couldn't process your payment of <strong>{{amount}}</strong>.</p>\
                   <p><a href=\"{{recovery_link}}\">Update your payment method</a> \
                   to keep your account in good standing.</p>"
                .to_string(),
            enabled: true,
        },
        NewEmailTemplate {
            user_id,
            template_type: TemplateType::RetryFailed,
            subject: "Reminder: {{amount}} is still outstanding".to_string(),
            body: "<p>Hi {{customer_email}},</p>\
                   <p>We tried again to charge <strong>{{amount}}</strong> but the payment \
                   failed.</p><p><a href=\"{{recovery_link}}\">Update your payment method</a>.</p>"
                .to_string(),
            enabled: false,
        },
        NewEmailTemplate {
            user_id,
            template_type: TemplateType::PaymentRecovered,
            subject: "Payment of {{amount}} received".to_string(),
            body: "<p>Hi {{customer_email}},</p>\
                   <p>Thanks! Your payment of <strong>{{amount}}</strong> went through.</p>"
                .to_string(),
            enabled: false,
        },
    ]
}

/// Per-user template management
#[derive(Clone)]
pub struct TemplateService {
    store: Arc<dyn DunningStore>,
}

impl TemplateService {
    pub fn new(store: Arc<dyn DunningStore>) -> Self {
        Self { store }
    }

    /// Create the default template for every type the user has none of
    ///
    /// Safe to call again after a partial or failed seed.
    pub async fn seed_defaults(&self, user_id: Uuid) -> BillingResult<Vec<EmailTemplate>> {
        let existing: Vec<TemplateType> = self
            .store
            .list_templates(user_id)
            .await?
            .into_iter()
            .map(|t| t.template_type)
            .collect();

        let mut created = Vec::new();
        for template in default_templates(user_id) {
            if existing.contains(&template.template_type) {
                continue;
            }
            created.push(self.store.create_template(template).await?);
        }

        if !created.is_empty() {
            tracing::info!(
                user_id = %user_id,
                count = created.len(),
                "Seeded default email templates"
            );
        }
        Ok(created)
    }

    pub async fn list(&self, user_id: Uuid) -> BillingResult<Vec<EmailTemplate>> {
        self.store.list_templates(user_id).await
    }

    pub async fn create(&self, template: NewEmailTemplate) -> BillingResult<EmailTemplate> {
        validate_subject(&template.subject)?;
        validate_body(template.template_type, &template.body)?;

        let created = self.store.create_template(template).await?;
        tracing::info!(
            user_id = %created.user_id,
            template_id = %created.id,
            template_type = %created.template_type,
            enabled = created.enabled,
            "Email template created"
        );
        Ok(created)
    }

    pub async fn update(
        &self,
        user_id: Uuid,
        template_id: Uuid,
        update: TemplateUpdate,
    ) -> BillingResult<EmailTemplate> {
        if let Some(subject) = &update.subject {
            validate_subject(subject)?;
        }

        if let Some(body) = &update.body {
            let template_type = self
                .store
                .list_templates(user_id)
                .await?
                .into_iter()
                .find(|t| t.id == template_id)
                .map(|t| t.template_type)
                .ok_or_else(|| BillingError::NotFound(format!("template {}", template_id)))?;
            validate_body(template_type, body)?;
        }

        self.store
            .update_template(user_id, template_id, update)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("template {}", template_id)))
    }
}

fn validate_subject(subject: &str) -> BillingResult<()> {
    if subject.trim().is_empty() {
        return Err(BillingError::InvalidInput("subject must not be empty".to_string()));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(BillingError::InvalidInput(format!(
            "subject must be at most {} characters",
            MAX_SUBJECT_LEN
        )));
    }
    Ok(())
}

fn validate_body(template_type: TemplateType, body: &str) -> BillingResult<()> {
    if body.trim().is_empty() {
        return Err(BillingError::InvalidInput("body must not be empty".to_string()));
    }
    if body.len() > MAX_BODY_LEN {
        return Err(BillingError::InvalidInput(format!(
            "body must be at most {} characters",
            MAX_BODY_LEN
        )));
    }
    // A failure notice the customer cannot act on is useless
    if template_type != TemplateType::PaymentRecovered && !body.contains(PLACEHOLDER_RECOVERY_LINK)
    {
        return Err(BillingError::InvalidInput(format!(
            "{} templates must include {}",
            template_type, PLACEHOLDER_RECOVERY_LINK
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDunningStore;

    #[test]
    fn test_format_amount_usd() {
        assert_eq!(format_amount(4999, "usd"), "$49.99");
        assert_eq!(format_amount(5, "USD"), "$0.05");
        assert_eq!(format_amount(100_000, "usd"), "$1000.00");
    }

    #[test]
    fn test_format_amount_other_currencies() {
        assert_eq!(format_amount(1250, "eur"), "€12.50");
        assert_eq!(format_amount(1250, "gbp"), "£12.50");
        assert_eq!(format_amount(1250, "chf"), "CHF 12.50");
        assert_eq!(format_amount(-300, "usd"), "-$3.00");
    }

    #[test]
    fn test_render_replaces_every_occurrence() {
        let vars = TemplateVars {
            recovery_link: "https://pay.example.com/recover/abc",
            amount: "$49.99",
            customer_email: "buyer@example.com",
        };
        let out = render(
            "{{amount}} due. Pay: {{recovery_link}} ({{amount}}) for {{customer_email}}",
            &vars,
        );
        assert_eq!(
            out,
            "$49.99 due. Pay: https://pay.example.com/recover/abc ($49.99) for buyer@example.com"
        );
    }

    #[test]
    fn test_default_templates_only_enable_first_failure() {
        let defaults = default_templates(Uuid::new_v4());
        let enabled: Vec<_> = defaults.iter().filter(|t| t.enabled).collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].template_type, TemplateType::FirstFailure);
        for t in defaults
            .iter()
            .filter(|t| t.template_type != TemplateType::PaymentRecovered)
        {
            assert!(validate_body(t.template_type, &t.body).is_ok());
        }
    }

    #[tokio::test]
    async fn test_failure_template_without_link_is_rejected() {
        let service = TemplateService::new(Arc::new(InMemoryDunningStore::new()));
        let err = service
            .create(NewEmailTemplate {
                user_id: Uuid::new_v4(),
                template_type: TemplateType::FirstFailure,
                subject: "Payment failed".to_string(),
                body: "<p>Please pay {{amount}}</p>".to_string(),
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_seed_defaults_fills_only_missing_types() {
        let service = TemplateService::new(Arc::new(InMemoryDunningStore::new()));
        let user_id = Uuid::new_v4();
        service
            .create(NewEmailTemplate {
                user_id,
                template_type: TemplateType::RetryFailed,
                subject: "Still failing".to_string(),
                body: "<a href=\"{{recovery_link}}\">Update card</a>".to_string(),
                enabled: true,
            })
            .await
            .unwrap();

        let created = service.seed_defaults(user_id).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(created
            .iter()
            .all(|t| t.template_type != TemplateType::RetryFailed));

        assert!(service.seed_defaults(user_id).await.unwrap().is_empty());
        assert_eq!(service.list(user_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_unknown_template_is_not_found() {
        let service = TemplateService::new(Arc::new(InMemoryDunningStore::new()));
        let err = service
            .update(
                Uuid::new_v4(),
                Uuid::new_v4(),
                TemplateUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}

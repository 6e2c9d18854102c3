//! In-memory store
//!
//! Used by tests and local development. All tables sit behind one mutex,
//! which gives every trait method the same atomicity the SQL statements
//! have in the PostgreSQL store.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DunningStore, PROCESSING_TIMEOUT_MINUTES};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    DeliveryStatus, DunningLog, EmailTemplate, FailedPayment, FailureUpsert, NewEmailTemplate,
    NewFailedPayment, NewUser, PaymentStatus, ProcessingResult, RecoveryStats, SubscriptionStatus,
    TemplateType, TemplateUpdate, User, WebhookEventRecord,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    payments: Vec<FailedPayment>,
    next_payment_id: i64,
    logs: Vec<DunningLog>,
    templates: Vec<EmailTemplate>,
    webhook_events: Vec<WebhookEventRecord>,
}

impl Tables {
    fn payment_mut(&mut self, id: i64) -> Option<&mut FailedPayment> {
        self.payments.iter_mut().find(|p| p.id == id)
    }

    fn disable_siblings(&mut self, user_id: Uuid, template_type: TemplateType, keep: Option<Uuid>) {
        let now = OffsetDateTime::now_utc();
        for t in self.templates.iter_mut().filter(|t| {
            t.user_id == user_id && t.template_type == template_type && Some(t.id) != keep
        }) {
            if t.enabled {
                t.enabled = false;
                t.updated_at = now;
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryDunningStore {
    tables: Mutex<Tables>,
}

impl InMemoryDunningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failed-payment rows, for assertions
    pub async fn failed_payment_count(&self) -> usize {
        self.tables.lock().await.payments.len()
    }

    /// Number of dunning log rows across all payments, for assertions
    pub async fn dunning_log_count(&self) -> usize {
        self.tables.lock().await.logs.len()
    }
}

#[async_trait]
impl DunningStore for InMemoryDunningStore {
    async fn create_user(&self, new: NewUser) -> BillingResult<User> {
        let mut tables = self.tables.lock().await;
        if tables.users.values().any(|u| u.email == new.email) {
            return Err(BillingError::Conflict(
                "email already registered".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            username: new.username,
            password_hash: new.password_hash,
            stripe_account_id: None,
            stripe_connected: false,
            billing_customer_id: None,
            subscription_status: SubscriptionStatus::Trial,
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let tables = self.tables.lock().await;
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_stripe_account(&self, account_id: &str) -> BillingResult<Option<User>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.stripe_account_id.as_deref() == Some(account_id))
            .cloned())
    }

    async fn find_user_by_billing_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<User>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.billing_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn link_stripe_account(&self, user_id: Uuid, account_id: &str) -> BillingResult<User> {
        let mut tables = self.tables.lock().await;
        if tables
            .users
            .values()
            .any(|u| u.id != user_id && u.stripe_account_id.as_deref() == Some(account_id))
        {
            return Err(BillingError::Conflict(format!(
                "Stripe account {} is linked to another user",
                account_id
            )));
        }

        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        user.stripe_account_id = Some(account_id.to_string());
        user.stripe_connected = true;
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn set_subscription_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.users.get_mut(&user_id) {
            Some(user) => {
                user.subscription_status = status;
                user.updated_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        })
    }

    async fn set_billing_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.users.get_mut(&user_id) {
            Some(user) => {
                user.billing_customer_id = Some(customer_id.to_string());
                user.updated_at = OffsetDateTime::now_utc();
                true
            }
            None => false,
        })
    }

    async fn record_payment_failure(&self, new: NewFailedPayment) -> BillingResult<FailureUpsert> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = tables
            .payments
            .iter_mut()
            .find(|p| p.payment_intent_id == new.payment_intent_id)
        {
            existing.attempt_count += 1;
            existing.updated_at = now;
            return Ok(FailureUpsert::Repeated(existing.clone()));
        }

        tables.next_payment_id += 1;
        let payment = FailedPayment {
            id: tables.next_payment_id,
            user_id: new.user_id,
            payment_intent_id: new.payment_intent_id,
            customer_id: new.customer_id,
            customer_email: new.customer_email,
            amount: new.amount,
            currency: new.currency,
            status: PaymentStatus::Failed,
            failure_reason: new.failure_reason,
            attempt_count: 1,
            retry_count: 0,
            next_retry_at: new.next_retry_at,
            recovery_token: new.recovery_token,
            created_at: now,
            updated_at: now,
            recovered_at: None,
        };
        tables.payments.push(payment.clone());
        Ok(FailureUpsert::Created(payment))
    }

    async fn find_failed_payment(&self, id: i64) -> BillingResult<Option<FailedPayment>> {
        let tables = self.tables.lock().await;
        Ok(tables.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_failed_payment_by_token(
        &self,
        token: Uuid,
    ) -> BillingResult<Option<FailedPayment>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.recovery_token == token)
            .cloned())
    }

    async fn find_failed_payment_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<FailedPayment>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.payment_intent_id == payment_intent_id)
            .cloned())
    }

    async fn mark_recovered(
        &self,
        id: i64,
        recovered_at: OffsetDateTime,
    ) -> BillingResult<Option<FailedPayment>> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.payment_mut(id) {
            Some(p) if p.status == PaymentStatus::Failed => {
                p.status = PaymentStatus::Recovered;
                p.recovered_at = Some(recovered_at);
                p.next_retry_at = None;
                p.updated_at = OffsetDateTime::now_utc();
                Some(p.clone())
            }
            _ => None,
        })
    }

    async fn list_failed_payments(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<FailedPayment>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<FailedPayment> = tables
            .payments
            .iter()
            .filter(|p| p.user_id == user_id && status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn due_retries(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<FailedPayment>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<FailedPayment> = tables
            .payments
            .iter()
            .filter(|p| {
                p.status == PaymentStatus::Failed && p.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|p| p.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn record_retry_attempt(
        &self,
        id: i64,
        next_retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        Ok(match tables.payment_mut(id) {
            Some(p) if p.status == PaymentStatus::Failed => {
                p.next_retry_at = next_retry_at;
                p.retry_count += 1;
                p.updated_at = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        })
    }

    async fn recovery_stats(&self, user_id: Uuid) -> BillingResult<RecoveryStats> {
        let tables = self.tables.lock().await;
        let mut stats = RecoveryStats::default();
        for p in tables.payments.iter().filter(|p| p.user_id == user_id) {
            match p.status {
                PaymentStatus::Failed => stats.failed_count += 1,
                PaymentStatus::Recovered => {
                    stats.recovered_count += 1;
                    stats.recovered_amount += p.amount;
                }
            }
        }
        Ok(stats)
    }

    async fn append_dunning_log(
        &self,
        failed_payment_id: i64,
        template_type: TemplateType,
        status: DeliveryStatus,
    ) -> BillingResult<DunningLog> {
        let mut tables = self.tables.lock().await;
        if !tables.payments.iter().any(|p| p.id == failed_payment_id) {
            return Err(BillingError::Database(format!(
                "failed payment {} does not exist",
                failed_payment_id
            )));
        }

        let log = DunningLog {
            id: Uuid::new_v4(),
            failed_payment_id,
            template_type,
            status,
            sent_at: OffsetDateTime::now_utc(),
        };
        tables.logs.push(log.clone());
        Ok(log)
    }

    async fn list_dunning_logs(&self, failed_payment_id: i64) -> BillingResult<Vec<DunningLog>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .logs
            .iter()
            .filter(|l| l.failed_payment_id == failed_payment_id)
            .cloned()
            .collect())
    }

    async fn create_template(&self, new: NewEmailTemplate) -> BillingResult<EmailTemplate> {
        let mut tables = self.tables.lock().await;
        if new.enabled {
            tables.disable_siblings(new.user_id, new.template_type, None);
        }

        let now = OffsetDateTime::now_utc();
        let template = EmailTemplate {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            template_type: new.template_type,
            subject: new.subject,
            body: new.body,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
        };
        tables.templates.push(template.clone());
        Ok(template)
    }

    async fn update_template(
        &self,
        user_id: Uuid,
        template_id: Uuid,
        update: TemplateUpdate,
    ) -> BillingResult<Option<EmailTemplate>> {
        let mut tables = self.tables.lock().await;
        let Some(template_type) = tables
            .templates
            .iter()
            .find(|t| t.id == template_id && t.user_id == user_id)
            .map(|t| t.template_type)
        else {
            return Ok(None);
        };

        if update.enabled == Some(true) {
            tables.disable_siblings(user_id, template_type, Some(template_id));
        }

        let Some(template) = tables.templates.iter_mut().find(|t| t.id == template_id) else {
            return Ok(None);
        };
        if let Some(subject) = update.subject {
            template.subject = subject;
        }
        if let Some(body) = update.body {
            template.body = body;
        }
        if let Some(enabled) = update.enabled {
            template.enabled = enabled;
        }
        template.updated_at = OffsetDateTime::now_utc();
        Ok(Some(template.clone()))
    }

    async fn list_templates(&self, user_id: Uuid) -> BillingResult<Vec<EmailTemplate>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .templates
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_active_template(
        &self,
        user_id: Uuid,
        template_type: TemplateType,
    ) -> BillingResult<Option<EmailTemplate>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .templates
            .iter()
            .filter(|t| t.user_id == user_id && t.template_type == template_type && t.enabled)
            .max_by_key(|t| t.updated_at)
            .cloned())
    }

    async fn claim_webhook_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let stale_before = now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);

        if let Some(existing) = tables
            .webhook_events
            .iter_mut()
            .find(|e| e.stripe_event_id == stripe_event_id)
        {
            let stale = existing.processing_result == ProcessingResult::Processing
                && existing.processing_started_at.is_some_and(|at| at < stale_before);
            if stale {
                existing.processing_started_at = Some(now);
                existing.error_message = Some(format!("Recovered from stuck state at {}", now));
            }
            return Ok(stale);
        }

        tables.webhook_events.push(WebhookEventRecord {
            id: Uuid::new_v4(),
            stripe_event_id: stripe_event_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.to_string(),
            processing_result: ProcessingResult::Processing,
            error_message: None,
            processing_started_at: Some(now),
            created_at: now,
        });
        Ok(true)
    }

    async fn reclaim_webhook_event(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();
        let stale_before = now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);

        let Some(existing) = tables
            .webhook_events
            .iter_mut()
            .find(|e| e.stripe_event_id == stripe_event_id)
        else {
            return Ok(false);
        };

        let reclaimable = match existing.processing_result {
            ProcessingResult::Error => true,
            ProcessingResult::Processing => existing
                .processing_started_at
                .is_some_and(|at| at < stale_before),
            ProcessingResult::Success => false,
        };
        if reclaimable {
            existing.processing_result = ProcessingResult::Processing;
            existing.processing_started_at = Some(now);
        }
        Ok(reclaimable)
    }

    async fn finish_webhook_event(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .webhook_events
            .iter_mut()
            .find(|e| e.stripe_event_id == stripe_event_id)
        {
            existing.processing_result = result;
            existing.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn find_webhook_event(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .webhook_events
            .iter()
            .find(|e| e.stripe_event_id == stripe_event_id)
            .cloned())
    }

    async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .webhook_events
            .iter()
            .filter(|e| result.map_or(true, |r| e.processing_result == r))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_failure(user_id: Uuid, intent: &str) -> NewFailedPayment {
        NewFailedPayment {
            user_id,
            payment_intent_id: intent.to_string(),
            customer_id: Some("cus_123".to_string()),
            customer_email: "buyer@example.com".to_string(),
            amount: 4999,
            currency: "usd".to_string(),
            failure_reason: Some("card_declined".to_string()),
            next_retry_at: None,
            recovery_token: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_failure_upsert_keys_on_payment_intent() {
        let store = InMemoryDunningStore::new();
        let user_id = Uuid::new_v4();

        let first = store
            .record_payment_failure(new_failure(user_id, "pi_1"))
            .await
            .unwrap();
        assert!(matches!(first, FailureUpsert::Created(_)));

        let second = store
            .record_payment_failure(new_failure(user_id, "pi_1"))
            .await
            .unwrap();
        match second {
            FailureUpsert::Repeated(p) => {
                assert_eq!(p.id, first.payment().id);
                assert_eq!(p.attempt_count, 2);
                // The token minted for the redelivery is discarded
                assert_eq!(p.recovery_token, first.payment().recovery_token);
            }
            other => panic!("expected repeated failure, got {:?}", other),
        }
        assert_eq!(store.failed_payment_count().await, 1);
    }

    #[tokio::test]
    async fn test_mark_recovered_transitions_once() {
        let store = InMemoryDunningStore::new();
        let created = store
            .record_payment_failure(new_failure(Uuid::new_v4(), "pi_2"))
            .await
            .unwrap();
        let id = created.payment().id;
        let at = OffsetDateTime::now_utc();

        let first = store.mark_recovered(id, at).await.unwrap();
        assert!(first.is_some());
        let second = store
            .mark_recovered(id, at + Duration::hours(1))
            .await
            .unwrap();
        assert!(second.is_none());

        let stored = store.find_failed_payment(id).await.unwrap().unwrap();
        assert_eq!(stored.recovered_at, Some(at));
    }

    #[tokio::test]
    async fn test_enabling_template_disables_siblings() {
        let store = InMemoryDunningStore::new();
        let user_id = Uuid::new_v4();
        let template = |subject: &str| NewEmailTemplate {
            user_id,
            template_type: TemplateType::FirstFailure,
            subject: subject.to_string(),
            body: "body".to_string(),
            enabled: true,
        };

        let a = store.create_template(template("a")).await.unwrap();
        let b = store.create_template(template("b")).await.unwrap();

        let active = store
            .find_active_template(user_id, TemplateType::FirstFailure)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, b.id);

        store
            .update_template(
                user_id,
                a.id,
                TemplateUpdate {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let enabled: Vec<_> = store
            .list_templates(user_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.enabled)
            .collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, a.id);
    }

    #[tokio::test]
    async fn test_template_update_requires_owner() {
        let store = InMemoryDunningStore::new();
        let owner = Uuid::new_v4();
        let template = store
            .create_template(NewEmailTemplate {
                user_id: owner,
                template_type: TemplateType::RetryFailed,
                subject: "s".to_string(),
                body: "b".to_string(),
                enabled: false,
            })
            .await
            .unwrap();

        let result = store
            .update_template(Uuid::new_v4(), template.id, TemplateUpdate::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_webhook_claim_is_exclusive() {
        let store = InMemoryDunningStore::new();
        assert!(store
            .claim_webhook_event("evt_1", "payment_intent.succeeded", "{}")
            .await
            .unwrap());
        assert!(!store
            .claim_webhook_event("evt_1", "payment_intent.succeeded", "{}")
            .await
            .unwrap());

        store
            .finish_webhook_event("evt_1", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert!(store.reclaim_webhook_event("evt_1").await.unwrap());

        store
            .finish_webhook_event("evt_1", ProcessingResult::Success, None)
            .await
            .unwrap();
        assert!(!store.reclaim_webhook_event("evt_1").await.unwrap());
    }
}

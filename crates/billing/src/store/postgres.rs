//! PostgreSQL-backed store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DunningStore, PROCESSING_TIMEOUT_MINUTES};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    DeliveryStatus, DunningLog, EmailTemplate, FailedPayment, FailureUpsert, NewEmailTemplate,
    NewFailedPayment, NewUser, PaymentStatus, ProcessingResult, RecoveryStats, SubscriptionStatus,
    TemplateType, TemplateUpdate, User, WebhookEventRecord,
};

const USER_COLUMNS: &str = "id, email, username, password_hash, stripe_account_id, \
    stripe_connected, billing_customer_id, subscription_status, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, user_id, payment_intent_id, customer_id, customer_email, \
    amount, currency, status, failure_reason, attempt_count, retry_count, next_retry_at, \
    recovery_token, created_at, updated_at, recovered_at";

const TEMPLATE_COLUMNS: &str =
    "id, user_id, template_type, subject, body, enabled, created_at, updated_at";

const WEBHOOK_COLUMNS: &str = "id, stripe_event_id, event_type, payload, processing_result, \
    error_message, processing_started_at, created_at";

#[derive(sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    payment: FailedPayment,
    inserted: bool,
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct PgDunningStore {
    pool: PgPool,
}

impl PgDunningStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DunningStore for PgDunningStore {
    async fn create_user(&self, new: NewUser) -> BillingResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (id, email, username, password_hash, subscription_status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        );

        sqlx::query_as::<_, User>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.email)
            .bind(&new.username)
            .bind(&new.password_hash)
            .bind(SubscriptionStatus::Trial.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BillingError::Conflict("email already registered".to_string())
                } else {
                    BillingError::Database(e.to_string())
                }
            })
    }

    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_stripe_account(&self, account_id: &str) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE stripe_account_id = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_billing_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE billing_customer_id = $1");
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn link_stripe_account(&self, user_id: Uuid, account_id: &str) -> BillingResult<User> {
        let sql = format!(
            r#"
            UPDATE users
            SET stripe_account_id = $2, stripe_connected = TRUE, updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );

        let user = sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BillingError::Conflict(format!(
                        "Stripe account {} is linked to another user",
                        account_id
                    ))
                } else {
                    BillingError::Database(e.to_string())
                }
            })?;

        user.ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    async fn set_subscription_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET subscription_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_billing_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET billing_customer_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_payment_failure(&self, new: NewFailedPayment) -> BillingResult<FailureUpsert> {
        // xmax is zero only for a freshly inserted tuple, which tells the two
        // branches of the upsert apart in a single round trip
        let sql = format!(
            r#"
            INSERT INTO failed_payments
                (user_id, payment_intent_id, customer_id, customer_email, amount, currency,
                 status, failure_reason, attempt_count, next_retry_at, recovery_token)
            VALUES ($1, $2, $3, $4, $5, $6, 'failed', $7, 1, $8, $9)
            ON CONFLICT (payment_intent_id) DO UPDATE SET
                attempt_count = failed_payments.attempt_count + 1,
                updated_at = NOW()
            RETURNING {PAYMENT_COLUMNS}, (xmax = 0) AS inserted
            "#
        );

        let row = sqlx::query_as::<_, UpsertRow>(&sql)
            .bind(new.user_id)
            .bind(&new.payment_intent_id)
            .bind(&new.customer_id)
            .bind(&new.customer_email)
            .bind(new.amount)
            .bind(&new.currency)
            .bind(&new.failure_reason)
            .bind(new.next_retry_at)
            .bind(new.recovery_token)
            .fetch_one(&self.pool)
            .await?;

        Ok(if row.inserted {
            FailureUpsert::Created(row.payment)
        } else {
            FailureUpsert::Repeated(row.payment)
        })
    }

    async fn find_failed_payment(&self, id: i64) -> BillingResult<Option<FailedPayment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM failed_payments WHERE id = $1");
        Ok(sqlx::query_as::<_, FailedPayment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_failed_payment_by_token(
        &self,
        token: Uuid,
    ) -> BillingResult<Option<FailedPayment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM failed_payments WHERE recovery_token = $1");
        Ok(sqlx::query_as::<_, FailedPayment>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_failed_payment_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<FailedPayment>> {
        let sql =
            format!("SELECT {PAYMENT_COLUMNS} FROM failed_payments WHERE payment_intent_id = $1");
        Ok(sqlx::query_as::<_, FailedPayment>(&sql)
            .bind(payment_intent_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn mark_recovered(
        &self,
        id: i64,
        recovered_at: OffsetDateTime,
    ) -> BillingResult<Option<FailedPayment>> {
        let sql = format!(
            r#"
            UPDATE failed_payments
            SET status = 'recovered',
                recovered_at = $2,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING {PAYMENT_COLUMNS}
            "#
        );

        Ok(sqlx::query_as::<_, FailedPayment>(&sql)
            .bind(id)
            .bind(recovered_at)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_failed_payments(
        &self,
        user_id: Uuid,
        status: Option<PaymentStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<FailedPayment>> {
        let sql = format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM failed_payments
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        );

        Ok(sqlx::query_as::<_, FailedPayment>(&sql)
            .bind(user_id)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn due_retries(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<FailedPayment>> {
        let sql = format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM failed_payments
            WHERE status = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            "#
        );

        Ok(sqlx::query_as::<_, FailedPayment>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn record_retry_attempt(
        &self,
        id: i64,
        next_retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE failed_payments
            SET next_retry_at = $2, retry_count = retry_count + 1, updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recovery_stats(&self, user_id: Uuid) -> BillingResult<RecoveryStats> {
        Ok(sqlx::query_as::<_, RecoveryStats>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_count,
                COUNT(*) FILTER (WHERE status = 'recovered') AS recovered_count,
                COALESCE(SUM(amount) FILTER (WHERE status = 'recovered'), 0)::BIGINT
                    AS recovered_amount
            FROM failed_payments
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn append_dunning_log(
        &self,
        failed_payment_id: i64,
        template_type: TemplateType,
        status: DeliveryStatus,
    ) -> BillingResult<DunningLog> {
        Ok(sqlx::query_as::<_, DunningLog>(
            r#"
            INSERT INTO dunning_logs (id, failed_payment_id, template_type, status, sent_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id, failed_payment_id, template_type, status, sent_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(failed_payment_id)
        .bind(template_type.as_str())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_dunning_logs(&self, failed_payment_id: i64) -> BillingResult<Vec<DunningLog>> {
        Ok(sqlx::query_as::<_, DunningLog>(
            r#"
            SELECT id, failed_payment_id, template_type, status, sent_at
            FROM dunning_logs
            WHERE failed_payment_id = $1
            ORDER BY sent_at ASC
            "#,
        )
        .bind(failed_payment_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_template(&self, new: NewEmailTemplate) -> BillingResult<EmailTemplate> {
        let mut tx = self.pool.begin().await?;

        if new.enabled {
            sqlx::query(
                r#"
                UPDATE email_templates
                SET enabled = FALSE, updated_at = NOW()
                WHERE user_id = $1 AND template_type = $2 AND enabled
                "#,
            )
            .bind(new.user_id)
            .bind(new.template_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!(
            r#"
            INSERT INTO email_templates (id, user_id, template_type, subject, body, enabled)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TEMPLATE_COLUMNS}
            "#
        );

        let template = sqlx::query_as::<_, EmailTemplate>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.user_id)
            .bind(new.template_type.as_str())
            .bind(&new.subject)
            .bind(&new.body)
            .bind(new.enabled)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(template)
    }

    async fn update_template(
        &self,
        user_id: Uuid,
        template_id: Uuid,
        update: TemplateUpdate,
    ) -> BillingResult<Option<EmailTemplate>> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT template_type FROM email_templates WHERE id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(template_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((template_type,)) = existing else {
            return Ok(None);
        };

        if update.enabled == Some(true) {
            sqlx::query(
                r#"
                UPDATE email_templates
                SET enabled = FALSE, updated_at = NOW()
                WHERE user_id = $1 AND template_type = $2 AND id <> $3 AND enabled
                "#,
            )
            .bind(user_id)
            .bind(&template_type)
            .bind(template_id)
            .execute(&mut *tx)
            .await?;
        }

        let sql = format!(
            r#"
            UPDATE email_templates
            SET subject = COALESCE($2, subject),
                body = COALESCE($3, body),
                enabled = COALESCE($4, enabled),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TEMPLATE_COLUMNS}
            "#
        );

        let template = sqlx::query_as::<_, EmailTemplate>(&sql)
            .bind(template_id)
            .bind(&update.subject)
            .bind(&update.body)
            .bind(update.enabled)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(template))
    }

    async fn list_templates(&self, user_id: Uuid) -> BillingResult<Vec<EmailTemplate>> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE user_id = $1 \
             ORDER BY template_type, created_at"
        );
        Ok(sqlx::query_as::<_, EmailTemplate>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn find_active_template(
        &self,
        user_id: Uuid,
        template_type: TemplateType,
    ) -> BillingResult<Option<EmailTemplate>> {
        let sql = format!(
            r#"
            SELECT {TEMPLATE_COLUMNS}
            FROM email_templates
            WHERE user_id = $1 AND template_type = $2 AND enabled
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, EmailTemplate>(&sql)
            .bind(user_id)
            .bind(template_type.as_str())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn claim_webhook_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<bool> {
        // INSERT...ON CONFLICT...RETURNING gives exactly one concurrent caller
        // the claim; a stuck claim past the timeout can be taken over
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, stripe_event_id, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE webhook_events.processing_result = 'processing'
              AND webhook_events.processing_started_at < NOW() - make_interval(mins => $5)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(stripe_event_id)
        .bind(event_type)
        .bind(payload)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn reclaim_webhook_event(&self, stripe_event_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_event_id = $1
              AND (processing_result = 'error'
                   OR (processing_result = 'processing'
                       AND processing_started_at < NOW() - make_interval(mins => $2)))
            "#,
        )
        .bind(stripe_event_id)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_webhook_event(
        &self,
        stripe_event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2, error_message = $3
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_webhook_event(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM webhook_events WHERE stripe_event_id = $1");
        Ok(sqlx::query_as::<_, WebhookEventRecord>(&sql)
            .bind(stripe_event_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let sql = format!(
            r#"
            SELECT {WEBHOOK_COLUMNS}
            FROM webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        );
        Ok(sqlx::query_as::<_, WebhookEventRecord>(&sql)
            .bind(result.map(|r| r.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

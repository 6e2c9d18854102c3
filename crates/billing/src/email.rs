//! Email delivery for dunning notifications
//!
//! Sends transactional emails via the Resend API. Delivery problems never
//! escape this module: callers get a boolean and the diagnostics go to the
//! log.

use std::time::Duration;

use async_trait::async_trait;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

const RESEND_API_URL: &str = "https://api.resend.com";

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// Base URL of the Resend API
    pub api_url: String,
    /// Retries after the first attempt for network errors and 5xx responses
    pub max_retries: usize,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Billing <billing@example.com>".to_string()),
            api_url: std::env::var("RESEND_API_URL")
                .unwrap_or_else(|_| RESEND_API_URL.to_string()),
            max_retries: 2,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Outbound notification channel
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Returns true when the provider accepted the message
    async fn send(&self, to: &str, subject: &str, html: &str) -> bool;
}

/// Failure worth another attempt
#[derive(Debug)]
enum TransientFailure {
    Status(reqwest::StatusCode, String),
    Network(reqwest::Error),
}

/// Final answer from the provider
enum Delivery {
    Accepted,
    Rejected(reqwest::StatusCode, String),
}

/// Resend-backed notification sender
#[derive(Clone)]
pub struct ResendEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl ResendEmailService {
    pub fn new(config: EmailConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client for email");
                reqwest::Client::new()
            });
        Self { config, client }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    async fn attempt(&self, body: &serde_json::Value) -> Result<Delivery, TransientFailure> {
        let response = self
            .client
            .post(format!("{}/emails", self.config.api_url))
            .bearer_auth(&self.config.resend_api_key)
            .json(body)
            .send()
            .await
            .map_err(TransientFailure::Network)?;

        let status = response.status();
        if status.is_success() {
            return Ok(Delivery::Accepted);
        }

        let text = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(TransientFailure::Status(status, text))
        } else {
            Ok(Delivery::Rejected(status, text))
        }
    }
}

#[async_trait]
impl NotificationSender for ResendEmailService {
    async fn send(&self, to: &str, subject: &str, html: &str) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let strategy = ExponentialBackoff::from_millis(10)
            .factor(10)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);

        match Retry::start(strategy, || self.attempt(&body)).await {
            Ok(Delivery::Accepted) => {
                tracing::info!(to = %to, subject = %subject, "Dunning email sent");
                true
            }
            Ok(Delivery::Rejected(status, body)) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Email provider rejected message"
                );
                false
            }
            Err(TransientFailure::Status(status, body)) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Email provider unavailable after retries"
                );
                false
            }
            Err(TransientFailure::Network(e)) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to reach email provider after retries"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_url: String) -> EmailConfig {
        EmailConfig {
            resend_api_key: "re_test_key".to_string(),
            email_from: "Billing <billing@example.com>".to_string(),
            api_url,
            max_retries: 1,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_send_accepted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test_key")
            .with_status(200)
            .with_body(r#"{"id":"email_123"}"#)
            .create_async()
            .await;

        let sender = ResendEmailService::new(config(server.url()));
        assert!(sender.send("buyer@example.com", "Hi", "<p>Hi</p>").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid to"}"#)
            .expect(1)
            .create_async()
            .await;

        let sender = ResendEmailService::new(config(server.url()));
        assert!(!sender.send("not-an-email", "Hi", "<p>Hi</p>").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let sender = ResendEmailService::new(config(server.url()));
        assert!(!sender.send("buyer@example.com", "Hi", "<p>Hi</p>").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_disabled_sender_skips() {
        let mut cfg = config("http://127.0.0.1:9".to_string());
        cfg.resend_api_key.clear();
        let sender = ResendEmailService::new(cfg);
        assert!(!sender.is_enabled());
        assert!(!sender.send("buyer@example.com", "Hi", "<p>Hi</p>").await);
    }
}

//! Stripe client and the payment-processor seam
//!
//! Everything the dunning flow asks of the processor goes through
//! [`PaymentProcessor`], so webhook handling, recovery and retries can run
//! against a fake in tests.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    AccountId, AttachPaymentMethod, CheckoutSession, CheckoutSessionMode, Client,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, Customer, CustomerId,
    CustomerInvoiceSettings, PaymentIntent, PaymentIntentConfirmParams, PaymentIntentId,
    PaymentIntentStatus, PaymentMethod, PaymentMethodId, UpdateCustomer, UpdatePaymentIntent,
};

use crate::error::{BillingError, BillingResult};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Price used for the service's own subscription checkout
    pub price_id: Option<String>,
    /// Upper bound on any single Stripe API call
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let timeout_secs = std::env::var("STRIPE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            secret_key,
            webhook_secret,
            price_id: std::env::var("STRIPE_PRICE_ID").ok().filter(|v| !v.is_empty()),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Result of asking the processor to confirm a payment intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded,
    /// Accepted but not settled yet; `payment_intent.succeeded` follows
    Processing,
    /// Anything else, with Stripe's status string
    Incomplete(String),
}

/// Parameters for a subscription checkout session
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: uuid::Uuid,
    pub email: String,
    pub existing_customer_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutLink {
    pub session_id: String,
    pub url: String,
}

/// Payment-processor operations used by the dunning flow
///
/// `account` is the connected account the object lives on; `None` means
/// the platform account.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Email on a customer record, if the customer exists and has one
    async fn customer_email(
        &self,
        account: Option<&str>,
        customer_id: &str,
    ) -> BillingResult<Option<String>>;

    /// The customer's default payment method for invoices, if one is set
    async fn default_payment_method(
        &self,
        account: Option<&str>,
        customer_id: &str,
    ) -> BillingResult<Option<String>>;

    /// Attach a payment method to the customer and make it the default
    async fn set_default_payment_method(
        &self,
        account: Option<&str>,
        customer_id: &str,
        payment_method: &str,
    ) -> BillingResult<()>;

    /// Confirm (retry) a payment intent, first setting `payment_method` on
    /// it when given
    async fn confirm_payment_intent(
        &self,
        account: Option<&str>,
        payment_intent_id: &str,
        payment_method: Option<&str>,
    ) -> BillingResult<ChargeOutcome>;

    async fn create_checkout_session(&self, request: CheckoutRequest)
        -> BillingResult<CheckoutLink>;
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Client scoped to a connected account, or the platform client
    fn scoped(&self, account: Option<&str>) -> BillingResult<Client> {
        match account {
            Some(account) => {
                let account_id = account
                    .parse::<AccountId>()
                    .map_err(|e| BillingError::InvalidInput(format!("Invalid account ID: {}", e)))?;
                Ok(self.client.clone().with_stripe_account(account_id))
            }
            None => Ok(self.client.clone()),
        }
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => {
                tracing::error!(
                    operation = operation,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Stripe request timed out"
                );
                Err(BillingError::Timeout(format!("Stripe {}", operation)))
            }
        }
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn customer_email(
        &self,
        account: Option<&str>,
        customer_id: &str,
    ) -> BillingResult<Option<String>> {
        let client = self.scoped(account)?;
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let customer = self
            .timed(
                "customer retrieve",
                Customer::retrieve(&client, &customer_id, &[]),
            )
            .await?;

        if customer.deleted {
            return Ok(None);
        }
        Ok(customer.email.filter(|e| !e.is_empty()))
    }

    async fn default_payment_method(
        &self,
        account: Option<&str>,
        customer_id: &str,
    ) -> BillingResult<Option<String>> {
        let client = self.scoped(account)?;
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let customer = self
            .timed(
                "customer retrieve",
                Customer::retrieve(&client, &customer_id, &[]),
            )
            .await?;

        if customer.deleted {
            return Ok(None);
        }
        Ok(customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|method| method.id().to_string()))
    }

    async fn set_default_payment_method(
        &self,
        account: Option<&str>,
        customer_id: &str,
        payment_method: &str,
    ) -> BillingResult<()> {
        let client = self.scoped(account)?;
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;
        let payment_method_id = payment_method
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method: {}", e)))?;

        self.timed(
            "payment method attach",
            PaymentMethod::attach(
                &client,
                &payment_method_id,
                AttachPaymentMethod {
                    customer: customer_id.clone(),
                },
            ),
        )
        .await?;

        let mut update = UpdateCustomer::new();
        update.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(payment_method.to_string()),
            ..Default::default()
        });

        self.timed(
            "customer update",
            Customer::update(&client, &customer_id, update),
        )
        .await?;

        tracing::info!(
            customer_id = %customer_id,
            payment_method = %payment_method_id,
            "Updated default payment method"
        );
        Ok(())
    }

    async fn confirm_payment_intent(
        &self,
        account: Option<&str>,
        payment_intent_id: &str,
        payment_method: Option<&str>,
    ) -> BillingResult<ChargeOutcome> {
        let client = self.scoped(account)?;

        // Confirm takes no payment method; it has to be set on the intent first
        if let Some(payment_method) = payment_method {
            let intent_id = payment_intent_id
                .parse::<PaymentIntentId>()
                .map_err(|e| BillingError::StripeApi(format!("Invalid payment intent ID: {}", e)))?;
            let payment_method_id = payment_method
                .parse::<PaymentMethodId>()
                .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method: {}", e)))?;

            let mut update = UpdatePaymentIntent::new();
            update.payment_method = Some(payment_method_id);
            self.timed(
                "payment intent update",
                PaymentIntent::update(&client, &intent_id, update),
            )
            .await?;
        }

        let intent = self
            .timed(
                "payment intent confirm",
                PaymentIntent::confirm(
                    &client,
                    payment_intent_id,
                    PaymentIntentConfirmParams::default(),
                ),
            )
            .await?;

        let outcome = match intent.status {
            PaymentIntentStatus::Succeeded => ChargeOutcome::Succeeded,
            PaymentIntentStatus::Processing => ChargeOutcome::Processing,
            other => ChargeOutcome::Incomplete(other.as_str().to_string()),
        };

        tracing::info!(
            payment_intent_id = %payment_intent_id,
            outcome = ?outcome,
            "Confirmed payment intent"
        );
        Ok(outcome)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutLink> {
        let price_id = self
            .config
            .price_id
            .clone()
            .ok_or_else(|| BillingError::Config("STRIPE_PRICE_ID not set".to_string()))?;
        let user_id = request.user_id.to_string();

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&user_id);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);

        let existing_customer = request
            .existing_customer_id
            .as_deref()
            .map(|id| id.parse::<CustomerId>())
            .transpose()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;
        match existing_customer {
            Some(customer) => params.customer = Some(customer),
            None => params.customer_email = Some(&request.email),
        }

        let session = self
            .timed(
                "checkout session create",
                CheckoutSession::create(&self.client, params),
            )
            .await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))?;

        tracing::info!(
            user_id = %request.user_id,
            session_id = %session.id,
            "Created subscription checkout session"
        );

        Ok(CheckoutLink {
            session_id: session.id.to_string(),
            url,
        })
    }
}

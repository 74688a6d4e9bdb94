//! Payment verification and settlement
//!
//! A purchase moves through `initiated -> pending -> verified | failed`. The
//! provider is always asked for the payment's state; the client's word is
//! never taken for it. Once verified, the payment is settled through the
//! ledger, which records the transaction and grants the pack exactly once.

pub mod card;
pub mod nowpayments;
pub mod paypal;
pub mod plans;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

pub use card::StripeCardVerifier;
pub use nowpayments::{CryptoInvoice, InvoiceRequest, NowPaymentsClient, NowPaymentsConfig};
pub use paypal::{PaypalConfig, PaypalVerifier};
pub use plans::{find_plan, CreditPlan, PLANS, PLAN_CURRENCY};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{CreditLedger, PaymentSettlement, Settlement};

/// Timeout for every outbound provider request
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries after the first attempt for transient provider failures
const PROVIDER_RETRIES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Paypal,
    Crypto,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Crypto => "crypto",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "card" | "stripe" => Ok(PaymentMethod::Card),
            "paypal" => Ok(PaymentMethod::Paypal),
            "crypto" | "nowpayments" => Ok(PaymentMethod::Crypto),
            other => Err(BillingError::InvalidInput(format!(
                "unsupported payment method: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Verified,
    Pending,
    Failed,
}

/// What the provider reports about a payment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPayment {
    pub method: PaymentMethod,
    pub transaction_id: String,
    pub state: PaymentState,
    /// Provider's own status string
    pub provider_status: String,
    pub amount_cents: i64,
    pub currency: String,
    /// `user_id:plan_id` the payment was created for; settlement refuses payments without one
    pub order_id: Option<String>,
}

/// One payment provider
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, transaction_id: &str) -> BillingResult<VerifiedPayment>;
}

/// Dispatches verification to the configured provider for each method
#[derive(Clone, Default)]
pub struct PaymentGateway {
    card: Option<Arc<dyn PaymentVerifier>>,
    paypal: Option<Arc<dyn PaymentVerifier>>,
    crypto: Option<Arc<dyn PaymentVerifier>>,
}

impl PaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_card(mut self, verifier: Arc<dyn PaymentVerifier>) -> Self {
        self.card = Some(verifier);
        self
    }

    pub fn with_paypal(mut self, verifier: Arc<dyn PaymentVerifier>) -> Self {
        self.paypal = Some(verifier);
        self
    }

    pub fn with_crypto(mut self, verifier: Arc<dyn PaymentVerifier>) -> Self {
        self.crypto = Some(verifier);
        self
    }

    pub async fn verify(
        &self,
        method: PaymentMethod,
        transaction_id: &str,
    ) -> BillingResult<VerifiedPayment> {
        let verifier = match method {
            PaymentMethod::Card => self.card.as_ref().ok_or(BillingError::ProviderNotConfigured("card"))?,
            PaymentMethod::Paypal => self
                .paypal
                .as_ref()
                .ok_or(BillingError::ProviderNotConfigured("paypal"))?,
            PaymentMethod::Crypto => self
                .crypto
                .as_ref()
                .ok_or(BillingError::ProviderNotConfigured("crypto"))?,
        };

        if transaction_id.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "transaction id is required".to_string(),
            ));
        }

        let payment = verifier.verify(transaction_id).await?;
        tracing::debug!(
            payment_method = %method,
            transaction_id = %transaction_id,
            provider_status = %payment.provider_status,
            "Verified payment with provider"
        );
        Ok(payment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Settled(Settlement),
    /// Provider has not finished processing; the client should retry later
    Pending { provider_status: String },
}

/// `order_id` format shared by crypto invoices and IPN callbacks
pub fn order_reference(user_id: &str, plan_id: &str) -> String {
    format!("{}:{}", user_id, plan_id)
}

/// Split an order reference back into `(user_id, plan_id)`
pub fn parse_order_reference(order_id: &str) -> BillingResult<(&str, &str)> {
    match order_id.rsplit_once(':') {
        Some((user_id, plan_id)) if !user_id.is_empty() && !plan_id.is_empty() => {
            Ok((user_id, plan_id))
        }
        _ => Err(BillingError::InvalidInput(format!(
            "malformed order reference: {}",
            order_id
        ))),
    }
}

/// Verification plus settlement
#[derive(Clone)]
pub struct PaymentService {
    gateway: PaymentGateway,
    ledger: CreditLedger,
}

impl PaymentService {
    pub fn new(gateway: PaymentGateway, ledger: CreditLedger) -> Self {
        Self { gateway, ledger }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Ask the provider about `transaction_id` and settle it if verified
    pub async fn verify_and_settle(
        &self,
        user_id: &str,
        method: PaymentMethod,
        transaction_id: &str,
        plan_id: &str,
    ) -> BillingResult<PaymentOutcome> {
        let plan = find_plan(plan_id)?;
        let payment = self.gateway.verify(method, transaction_id).await?;

        match payment.state {
            PaymentState::Pending => Ok(PaymentOutcome::Pending {
                provider_status: payment.provider_status,
            }),
            PaymentState::Failed => {
                tracing::warn!(
                    user_id = %user_id,
                    transaction_id = %transaction_id,
                    provider_status = %payment.provider_status,
                    "Payment verification failed"
                );
                Err(BillingError::PaymentNotCompleted(transaction_id.to_string()))
            }
            PaymentState::Verified => {
                let order_id = payment.order_id.as_deref().ok_or_else(|| {
                    BillingError::InvalidInput(
                        "payment carries no order reference".to_string(),
                    )
                })?;
                if order_id != order_reference(user_id, plan_id) {
                    return Err(BillingError::InvalidInput(
                        "payment belongs to a different order".to_string(),
                    ));
                }
                let settlement = self.settle(user_id, plan, &payment).await?;
                Ok(PaymentOutcome::Settled(settlement))
            }
        }
    }

    /// Settle a payment already known to be verified
    pub async fn settle(
        &self,
        user_id: &str,
        plan: &CreditPlan,
        payment: &VerifiedPayment,
    ) -> BillingResult<Settlement> {
        if payment.state != PaymentState::Verified {
            return Err(BillingError::PaymentNotCompleted(
                payment.transaction_id.clone(),
            ));
        }
        if !payment.currency.eq_ignore_ascii_case(PLAN_CURRENCY) {
            return Err(BillingError::InvalidInput(format!(
                "unsupported currency: {}",
                payment.currency
            )));
        }
        if payment.amount_cents < plan.price_cents {
            tracing::warn!(
                user_id = %user_id,
                transaction_id = %payment.transaction_id,
                plan_id = %plan.id,
                paid_cents = payment.amount_cents,
                expected_cents = plan.price_cents,
                "Paid amount below plan price"
            );
            return Err(BillingError::AmountMismatch {
                expected_cents: plan.price_cents,
                paid_cents: payment.amount_cents,
            });
        }

        self.ledger
            .settle_payment(&PaymentSettlement {
                user_id: user_id.to_string(),
                transaction_id: payment.transaction_id.clone(),
                method: payment.method,
                plan_id: plan.id.to_string(),
                credits: plan.credits,
                amount_cents: payment.amount_cents,
                currency: payment.currency.to_ascii_lowercase(),
            })
            .await
    }
}

/// Shared HTTP client for provider APIs
pub(crate) fn provider_http_client() -> BillingResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Run a provider call, retrying transient failures with exponential backoff
pub(crate) async fn with_retry<T, F, Fut>(operation: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(100)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(PROVIDER_RETRIES);
    RetryIf::spawn(strategy, operation, |e: &BillingError| e.is_transient()).await
}

/// Map a non-success provider response to an error
pub(crate) fn provider_status_error(provider: &str, status: StatusCode, body: &str) -> BillingError {
    if status == StatusCode::NOT_FOUND {
        BillingError::NotFound(format!("{} payment", provider))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        BillingError::Config(format!("{} rejected the configured credentials", provider))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BillingError::UpstreamProvider(format!("{} returned {}: {}", provider, status, body))
    } else {
        BillingError::InvalidInput(format!("{} returned {}: {}", provider, status, body))
    }
}

/// Parse a decimal amount such as `"19.00"` into cents
pub(crate) fn decimal_to_cents(value: &str) -> BillingResult<i64> {
    let invalid = || BillingError::UpstreamProvider(format!("invalid amount: {}", value));
    let (whole, fraction) = value.trim().split_once('.').unwrap_or((value.trim(), "0"));
    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let mut fraction = fraction.to_string();
    if fraction.is_empty() || fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if fraction.len() == 1 {
        fraction.push('0');
    }
    let fraction: i64 = fraction.parse().map_err(|_| invalid())?;
    Ok(whole * 100 + fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CreditLedger;
    use shipmail_shared::SubscriptionTier;

    struct FixedVerifier(VerifiedPayment);

    #[async_trait]
    impl PaymentVerifier for FixedVerifier {
        async fn verify(&self, _transaction_id: &str) -> BillingResult<VerifiedPayment> {
            Ok(self.0.clone())
        }
    }

    fn payment(state: PaymentState, amount_cents: i64) -> VerifiedPayment {
        VerifiedPayment {
            method: PaymentMethod::Paypal,
            transaction_id: "ORDER-1".to_string(),
            state,
            provider_status: "COMPLETED".to_string(),
            amount_cents,
            currency: "USD".to_string(),
            order_id: Some("user-1:sms-1k".to_string()),
        }
    }

    async fn service(payment: VerifiedPayment) -> PaymentService {
        let ledger = CreditLedger::in_memory();
        ledger
            .create_account("user-1", "owner@example.com", SubscriptionTier::Free)
            .await
            .unwrap();
        let gateway = PaymentGateway::new().with_paypal(Arc::new(FixedVerifier(payment)));
        PaymentService::new(gateway, ledger)
    }

    #[test]
    fn test_payment_method_aliases() {
        assert_eq!("stripe".parse::<PaymentMethod>().unwrap(), PaymentMethod::Card);
        assert_eq!("PayPal".parse::<PaymentMethod>().unwrap(), PaymentMethod::Paypal);
        assert_eq!("nowpayments".parse::<PaymentMethod>().unwrap(), PaymentMethod::Crypto);
        assert!("cash".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_order_reference_round_trip() {
        let reference = order_reference("uid-42", "sms-1k");
        assert_eq!(reference, "uid-42:sms-1k");
        assert_eq!(parse_order_reference(&reference).unwrap(), ("uid-42", "sms-1k"));
        assert!(parse_order_reference("no-separator").is_err());
        assert!(parse_order_reference(":sms-1k").is_err());
    }

    #[test]
    fn test_decimal_to_cents() {
        assert_eq!(decimal_to_cents("19.00").unwrap(), 1900);
        assert_eq!(decimal_to_cents("129").unwrap(), 12900);
        assert_eq!(decimal_to_cents("7.5").unwrap(), 750);
        assert!(decimal_to_cents("1.234").is_err());
        assert!(decimal_to_cents("abc").is_err());
    }

    #[test]
    fn test_provider_status_error_classification() {
        assert!(provider_status_error("paypal", StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!provider_status_error("paypal", StatusCode::BAD_REQUEST, "").is_transient());
        assert!(matches!(
            provider_status_error("paypal", StatusCode::NOT_FOUND, ""),
            BillingError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let gateway = PaymentGateway::new();
        let result = gateway.verify(PaymentMethod::Card, "pi_123").await;
        assert!(matches!(result, Err(BillingError::ProviderNotConfigured("card"))));
    }

    #[tokio::test]
    async fn test_verified_payment_grants_plan_once() {
        let service = service(payment(PaymentState::Verified, 2900)).await;

        let first = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await
            .unwrap();
        assert!(matches!(first, PaymentOutcome::Settled(Settlement::Granted(_))));

        let second = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await
            .unwrap();
        assert_eq!(second, PaymentOutcome::Settled(Settlement::AlreadySettled));

        let balances = service.ledger().balances("user-1").await.unwrap();
        assert_eq!(balances.sms.extra, 1000);
    }

    #[tokio::test]
    async fn test_underpayment_is_rejected() {
        let service = service(payment(PaymentState::Verified, 1000)).await;
        let result = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await;
        assert!(matches!(
            result,
            Err(BillingError::AmountMismatch {
                expected_cents: 2900,
                paid_cents: 1000
            })
        ));
    }

    #[tokio::test]
    async fn test_pending_payment_grants_nothing() {
        let service = service(payment(PaymentState::Pending, 2900)).await;
        let outcome = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await
            .unwrap();
        assert!(matches!(outcome, PaymentOutcome::Pending { .. }));
        assert_eq!(service.ledger().balances("user-1").await.unwrap().sms.extra, 0);
    }

    #[tokio::test]
    async fn test_failed_payment_is_an_error() {
        let service = service(payment(PaymentState::Failed, 2900)).await;
        let result = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await;
        assert!(matches!(result, Err(BillingError::PaymentNotCompleted(_))));
    }

    #[tokio::test]
    async fn test_order_reference_must_match_caller() {
        let mut crypto = payment(PaymentState::Verified, 2900);
        crypto.order_id = Some("someone-else:sms-1k".to_string());
        let service = service(crypto).await;
        let result = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_payment_without_order_reference_is_rejected() {
        let mut unbound = payment(PaymentState::Verified, 2900);
        unbound.order_id = None;
        let service = service(unbound).await;
        let result = service
            .verify_and_settle("user-1", PaymentMethod::Paypal, "ORDER-1", "sms-1k")
            .await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
        assert_eq!(service.ledger().balances("user-1").await.unwrap().sms.extra, 0);
    }
}

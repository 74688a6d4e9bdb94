// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider response bodies
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shipmail Billing Module
//!
//! The credit ledger and everything that feeds it.
//!
//! ## Features
//!
//! - **Credit Ledger**: Email, SMS and lead allowances plus expiring extra credits
//! - **Payments**: Card (Stripe), PayPal and crypto (NOWPayments) verification
//! - **Settlement**: Exactly-once conversion of verified payments into credits
//! - **Webhooks**: Signed provider callbacks with claimed-event de-duplication
//! - **Invariants**: Read-only consistency checks over the ledger tables

pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod payments;
pub mod webhooks;


use std::sync::Arc;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{CreditLogEntry, CreditLogKind};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    AccountSnapshot, BalanceLine, ConsumptionPlan, CreditBalances, CreditLedger, CreditSource,
    ExtraCreditGrant, LedgerStore, MemoryLedgerStore, PgLedgerStore, RenewalSummary, Settlement,
    PaymentSettlement, SufficiencyReport, WebhookEventStore, WebhookOutcome, EXTRA_CREDIT_TTL,
};

// Payments
pub use payments::{
    find_plan, CreditPlan, CryptoInvoice, NowPaymentsClient, NowPaymentsConfig, PaymentGateway,
    PaymentMethod, PaymentOutcome, PaymentService, PaymentState, PaypalConfig, PaypalVerifier,
    StripeCardVerifier, VerifiedPayment, PLANS,
};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookHandler, WebhookSecrets};

use sqlx::PgPool;

/// Provider credentials; any provider left unset is reported as not configured
#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub paypal: Option<PaypalConfig>,
    pub nowpayments: Option<NowPaymentsConfig>,
    pub nowpayments_ipn_secret: Option<String>,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub ledger: CreditLedger,
    pub payments: PaymentService,
    pub webhooks: WebhookHandler,
    /// Invoice creation for crypto checkout
    pub crypto: Option<Arc<NowPaymentsClient>>,
}

impl BillingService {
    /// Billing over Postgres
    pub fn new(pool: PgPool, config: BillingConfig) -> BillingResult<Self> {
        let store = Arc::new(PgLedgerStore::new(pool));
        Self::with_stores(store.clone(), store, config)
    }

    /// Billing over an in-process store
    pub fn in_memory(config: BillingConfig) -> BillingResult<(Self, Arc<MemoryLedgerStore>)> {
        let store = Arc::new(MemoryLedgerStore::new());
        let service = Self::with_stores(store.clone(), store.clone(), config)?;
        Ok((service, store))
    }

    pub fn with_stores(
        ledger_store: Arc<dyn LedgerStore>,
        events: Arc<dyn WebhookEventStore>,
        config: BillingConfig,
    ) -> BillingResult<Self> {
        let ledger = CreditLedger::new(ledger_store);

        let mut gateway = PaymentGateway::new();
        if let Some(key) = &config.stripe_secret_key {
            gateway = gateway.with_card(Arc::new(StripeCardVerifier::new(key)));
        }
        if let Some(paypal) = config.paypal.clone() {
            gateway = gateway.with_paypal(Arc::new(PaypalVerifier::new(paypal)?));
        }
        let crypto = match config.nowpayments.clone() {
            Some(np) => {
                let client = Arc::new(NowPaymentsClient::new(np)?);
                gateway = gateway.with_crypto(client.clone());
                Some(client)
            }
            None => None,
        };

        let payments = PaymentService::new(gateway, ledger.clone());
        let webhooks = WebhookHandler::new(
            payments.clone(),
            events,
            WebhookSecrets {
                card: config.stripe_webhook_secret.clone(),
                crypto: config.nowpayments_ipn_secret.clone(),
            },
        );

        tracing::info!(
            card = config.stripe_secret_key.is_some(),
            paypal = config.paypal.is_some(),
            crypto = crypto.is_some(),
            "Billing service initialized"
        );

        Ok(Self {
            ledger,
            payments,
            webhooks,
            crypto,
        })
    }

    /// Create a crypto invoice for `plan_id`
    pub async fn create_crypto_invoice(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> BillingResult<CryptoInvoice> {
        let client = self
            .crypto
            .as_ref()
            .ok_or(BillingError::ProviderNotConfigured("crypto"))?;
        let plan = find_plan(plan_id)?;
        // Fails early for unknown users instead of taking their money
        self.ledger.account(user_id).await?;
        client.create_invoice(user_id, plan).await
    }
}

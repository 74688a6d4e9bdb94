//! Billing and ledger errors

use shipmail_shared::CreditType;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Insufficient {credit_type} credits: requested {requested}, available {available}")]
    InsufficientCredits {
        credit_type: CreditType,
        requested: i64,
        available: i64,
    },

    #[error("Invalid amount for {credit_type}: {amount}")]
    InvalidAmount { credit_type: CreditType, amount: i64 },

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Paid amount {paid_cents} is below plan price {expected_cents}")]
    AmountMismatch { expected_cents: i64, paid_cents: i64 },

    #[error("Payment {0} has not completed")]
    PaymentNotCompleted(String),

    #[error("Payment provider not configured: {0}")]
    ProviderNotConfigured(&'static str),

    #[error("Payment provider error: {0}")]
    UpstreamProvider(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::UpstreamProvider(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::UpstreamProvider(format!("Stripe: {}", e))
    }
}

impl BillingError {
    /// Whether retrying the same request later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::UpstreamProvider(_) | BillingError::Database(_)
        )
    }
}

//! Storage seams for the ledger and for webhook bookkeeping

use async_trait::async_trait;
use shipmail_shared::{CreditAmounts, SubscriptionStatus, SubscriptionTier};
use time::OffsetDateTime;

use super::account::{AccountSnapshot, ConsumptionPlan, CreditSource, ExtraCreditGrant};
use crate::error::BillingResult;
use crate::events::CreditLogEntry;
use crate::payments::PaymentMethod;

/// Credits to add to an account
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub amounts: CreditAmounts,
    pub source: CreditSource,
    pub reference: Option<String>,
    pub metadata: serde_json::Value,
}

/// A verified payment to turn into a transaction row plus grants
#[derive(Debug, Clone)]
pub struct PaymentSettlement {
    pub user_id: String,
    pub transaction_id: String,
    pub method: PaymentMethod,
    pub plan_id: String,
    pub credits: CreditAmounts,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Granted(Vec<ExtraCreditGrant>),
    /// The transaction was recorded by an earlier call
    AlreadySettled,
}

/// Persistent state behind [`super::CreditLedger`]
///
/// Every mutating method runs as one atomic unit per user: it re-reads the
/// account, applies the rules in [`super::account`] and commits or writes
/// nothing at all.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert the account if it doesn't exist and return its snapshot
    async fn create_account(
        &self,
        user_id: &str,
        email: &str,
        tier: SubscriptionTier,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot>;

    async fn load_account(&self, user_id: &str, now: OffsetDateTime)
        -> BillingResult<AccountSnapshot>;

    async fn consume(
        &self,
        user_id: &str,
        amounts: &CreditAmounts,
        metadata: serde_json::Value,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumptionPlan>;

    async fn grant(
        &self,
        user_id: &str,
        request: &GrantRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ExtraCreditGrant>>;

    /// Record the transaction and grant its credits, once per provider id
    async fn settle_payment(
        &self,
        settlement: &PaymentSettlement,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement>;

    /// Zero usage counters and move the account into its next period
    async fn reset_usage(&self, user_id: &str, now: OffsetDateTime)
        -> BillingResult<AccountSnapshot>;

    /// Renewing accounts whose period ended at or before `now`
    async fn accounts_due_for_renewal(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<String>>;

    async fn set_tier(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot>;

    /// Newest entries first
    async fn credit_logs(&self, user_id: &str, limit: i64) -> BillingResult<Vec<CreditLogEntry>>;
}

/// Processing state of a claimed webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Success,
    Ignored,
    Error,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Success => "success",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Error => "error",
        }
    }
}

/// Webhook de-duplication and crypto payment status
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Atomically claim `(provider, event_id)`
    ///
    /// Returns `false` when another delivery already claimed it. Events that
    /// previously failed, or stayed in processing longer than
    /// `stuck_after_minutes`, can be claimed again.
    async fn claim_event(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        stuck_after_minutes: i32,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        provider: &str,
        event_id: &str,
        outcome: WebhookOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    /// Upsert the last status reported for a crypto payment
    async fn record_crypto_payment(
        &self,
        payment_id: &str,
        user_id: &str,
        plan_id: &str,
        status: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()>;
}

//! Credit ledger
//!
//! [`CreditLedger`] is the one interface through which email, SMS and lead
//! allowances are read and changed. Balances are derived on every read from
//! the user's counters plus the live extra-credit grants:
//!
//! ```text
//! available = max(0, total - used + remaining unexpired grants)
//! ```
//!
//! Consumption spends the subscription allowance first and then grants,
//! soonest-to-expire first. Every mutation is atomic per user.

pub mod account;
pub mod memory;
pub mod postgres;
pub mod store;

use std::sync::Arc;

use shipmail_shared::{CreditAmounts, CreditType, SubscriptionStatus, SubscriptionTier};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

pub use account::{
    AccountSnapshot, BalanceLine, ConsumptionPlan, CreditBalances, CreditFlags, CreditSource,
    ExtraCreditGrant, GrantDraw, LedgerEntry, SufficiencyReport, EXTRA_CREDIT_TTL,
};
pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::{
    GrantRequest, LedgerStore, PaymentSettlement, Settlement, WebhookEventStore, WebhookOutcome,
};

use crate::error::{BillingError, BillingResult};
use crate::events::CreditLogEntry;

type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Result of one renewal sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    pub renewed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    clock: Clock,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgLedgerStore::new(pool)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()))
    }

    /// Replace the wall clock used for expiry and period decisions
    pub fn with_clock(mut self, clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    /// Create the account with its tier allowance; an existing account is
    /// returned unchanged
    pub async fn create_account(
        &self,
        user_id: &str,
        email: &str,
        tier: SubscriptionTier,
    ) -> BillingResult<AccountSnapshot> {
        self.store
            .create_account(user_id, email, tier, self.now())
            .await
    }

    pub async fn account(&self, user_id: &str) -> BillingResult<AccountSnapshot> {
        self.store.load_account(user_id, self.now()).await
    }

    pub async fn get_available(&self, user_id: &str, credit_type: CreditType) -> BillingResult<i64> {
        Ok(self.account(user_id).await?.available(credit_type))
    }

    pub async fn balances(&self, user_id: &str) -> BillingResult<CreditBalances> {
        Ok(self.account(user_id).await?.balances())
    }

    pub async fn check_sufficient(
        &self,
        user_id: &str,
        required: &CreditAmounts,
    ) -> BillingResult<SufficiencyReport> {
        self.account(user_id).await?.check(required)
    }

    /// Spend credits, all or nothing
    pub async fn consume(
        &self,
        user_id: &str,
        amounts: &CreditAmounts,
        metadata: serde_json::Value,
    ) -> BillingResult<ConsumptionPlan> {
        let result = self
            .store
            .consume(user_id, amounts, metadata, self.now())
            .await;
        log_consumption(user_id, result)
    }

    /// Spend credits inside the caller's Postgres transaction
    ///
    /// The draw commits or rolls back together with whatever else the caller
    /// writes on `conn`, and the user row stays locked until then. Always
    /// goes to Postgres, whatever store backs this ledger.
    pub async fn consume_in(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        amounts: &CreditAmounts,
        metadata: serde_json::Value,
    ) -> BillingResult<ConsumptionPlan> {
        let result = postgres::consume_on(conn, user_id, amounts, metadata, self.now()).await;
        log_consumption(user_id, result)
    }

    /// Add extra credits that expire after [`EXTRA_CREDIT_TTL`]
    pub async fn grant(
        &self,
        user_id: &str,
        amounts: &CreditAmounts,
        source: CreditSource,
        reference: Option<String>,
        metadata: serde_json::Value,
    ) -> BillingResult<Vec<ExtraCreditGrant>> {
        if source == CreditSource::Usage {
            return Err(BillingError::InvalidInput(
                "usage is not a grant source".to_string(),
            ));
        }
        account::validate_grant(amounts)?;

        let request = GrantRequest {
            amounts: *amounts,
            source,
            reference,
            metadata,
        };
        let granted = self.store.grant(user_id, &request, self.now()).await?;

        tracing::info!(
            user_id = %user_id,
            source = %source,
            emails = amounts.emails,
            sms = amounts.sms,
            leads = amounts.leads,
            "Granted extra credits"
        );
        Ok(granted)
    }

    /// Record a verified payment and grant its credits exactly once
    pub async fn settle_payment(&self, settlement: &PaymentSettlement) -> BillingResult<Settlement> {
        account::validate_grant(&settlement.credits)?;
        let outcome = self.store.settle_payment(settlement, self.now()).await?;

        match &outcome {
            Settlement::Granted(_) => tracing::info!(
                user_id = %settlement.user_id,
                transaction_id = %settlement.transaction_id,
                payment_method = %settlement.method,
                plan_id = %settlement.plan_id,
                "Payment settled"
            ),
            Settlement::AlreadySettled => tracing::info!(
                transaction_id = %settlement.transaction_id,
                payment_method = %settlement.method,
                "Payment already settled, skipping grant"
            ),
        }
        Ok(outcome)
    }

    /// Zero usage and start the next billing period
    pub async fn reset(&self, user_id: &str) -> BillingResult<AccountSnapshot> {
        let snapshot = self.store.reset_usage(user_id, self.now()).await?;
        tracing::info!(
            user_id = %user_id,
            period_end = %snapshot.period_end,
            "Reset usage for new billing period"
        );
        Ok(snapshot)
    }

    /// Reset every renewing account whose period has ended
    pub async fn renew_due(&self, limit: i64) -> BillingResult<RenewalSummary> {
        let due = self
            .store
            .accounts_due_for_renewal(self.now(), limit)
            .await?;

        let mut summary = RenewalSummary::default();
        for user_id in due {
            match self.reset(&user_id).await {
                Ok(_) => summary.renewed += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(user_id = %user_id, error = %e, "Failed to renew account");
                }
            }
        }
        Ok(summary)
    }

    /// Move the account to another tier and refresh its allowance
    pub async fn set_tier(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
    ) -> BillingResult<AccountSnapshot> {
        let snapshot = self
            .store
            .set_tier(user_id, tier, status, self.now())
            .await?;
        tracing::info!(user_id = %user_id, tier = %tier, status = %status, "Subscription tier updated");
        Ok(snapshot)
    }

    pub async fn credit_logs(&self, user_id: &str, limit: i64) -> BillingResult<Vec<CreditLogEntry>> {
        self.store.credit_logs(user_id, limit.clamp(1, 500)).await
    }
}

fn log_consumption(
    user_id: &str,
    result: BillingResult<ConsumptionPlan>,
) -> BillingResult<ConsumptionPlan> {
    match result {
        Ok(plan) => {
            if !plan.is_empty() {
                let total = plan.total();
                tracing::info!(
                    user_id = %user_id,
                    emails = total.emails,
                    sms = total.sms,
                    leads = total.leads,
                    grant_draws = plan.draws.len(),
                    "Consumed credits"
                );
            }
            Ok(plan)
        }
        Err(e @ BillingError::InsufficientCredits { .. }) => {
            tracing::warn!(user_id = %user_id, error = %e, "Credit consumption rejected");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

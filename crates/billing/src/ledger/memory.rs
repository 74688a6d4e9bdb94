//! In-process ledger store
//!
//! Holds everything behind one async mutex, which gives the same per-user
//! serialization as the row locks of the Postgres store. Used by tests and
//! by local runs without a database.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use shipmail_shared::{CreditAmounts, CreditType, SubscriptionStatus, SubscriptionTier};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use super::account::{
    add_one_month, live_grants, next_period, AccountSnapshot, ConsumptionPlan, CreditSource,
    ExtraCreditGrant, LedgerEntry,
};
use super::store::{
    GrantRequest, LedgerStore, PaymentSettlement, Settlement, WebhookEventStore, WebhookOutcome,
};
use crate::error::{BillingError, BillingResult};
use crate::events::{CreditLogEntry, CreditLogKind};
use crate::payments::PaymentMethod;

struct MemoryAccount {
    email: String,
    tier: SubscriptionTier,
    status: SubscriptionStatus,
    total: CreditAmounts,
    used: CreditAmounts,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    anchor_day: u8,
}

struct MemoryWebhookEvent {
    result: String,
    started_at: OffsetDateTime,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, MemoryAccount>,
    entries: HashMap<String, Vec<LedgerEntry>>,
    logs: Vec<CreditLogEntry>,
    transactions: HashSet<(PaymentMethod, String)>,
    webhook_events: HashMap<(String, String), MemoryWebhookEvent>,
    crypto_payments: HashMap<String, String>,
}

impl MemoryState {
    fn snapshot(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<AccountSnapshot> {
        let account = self
            .accounts
            .get(user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        let entries = self
            .entries
            .get(user_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(AccountSnapshot {
            user_id: user_id.to_string(),
            email: account.email.clone(),
            tier: account.tier,
            status: account.status,
            total: account.total,
            used: account.used,
            grants: live_grants(entries, now),
            period_start: account.period_start,
            period_end: account.period_end,
            anchor_day: account.anchor_day,
        })
    }

    fn append_grants(
        &mut self,
        user_id: &str,
        request: &GrantRequest,
        now: OffsetDateTime,
    ) -> Vec<ExtraCreditGrant> {
        let mut granted = Vec::new();
        let entries = self.entries.entry(user_id.to_string()).or_default();
        for (credit_type, quantity) in request.amounts.non_zero() {
            let entry = LedgerEntry::grant(
                credit_type,
                quantity,
                request.source,
                request.reference.clone(),
                now,
            );
            granted.push(ExtraCreditGrant {
                id: entry.id,
                credit_type,
                quantity,
                granted: quantity,
                source: entry.source,
                purchased_at: entry.created_at,
                expires_at: entry.expires_at,
            });
            entries.push(entry);
        }
        self.logs.push(CreditLogEntry::new(
            user_id,
            CreditLogKind::Add,
            request.amounts,
            request.metadata.clone(),
            now,
        ));
        granted
    }
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the usage counters of an account
    ///
    /// Lets callers reproduce states the consume path never produces, such
    /// as usage above the allowance after a downgrade.
    pub async fn force_usage(&self, user_id: &str, used: CreditAmounts) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        account.used = used;
        Ok(())
    }

    /// Raw ledger entries of a user in insertion order
    pub async fn entries(&self, user_id: &str) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state.entries.get(user_id).cloned().unwrap_or_default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    /// Processing result recorded for a webhook event
    pub async fn webhook_result(&self, provider: &str, event_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .webhook_events
            .get(&(provider.to_string(), event_id.to_string()))
            .map(|e| e.result.clone())
    }

    pub async fn crypto_payment_status(&self, payment_id: &str) -> Option<String> {
        self.state.lock().await.crypto_payments.get(payment_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn create_account(
        &self,
        user_id: &str,
        email: &str,
        tier: SubscriptionTier,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let mut state = self.state.lock().await;
        state
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| MemoryAccount {
                email: email.to_string(),
                tier,
                status: SubscriptionStatus::Trial,
                total: tier.allowance(),
                used: CreditAmounts::zero(),
                period_start: now,
                period_end: add_one_month(now),
                anchor_day: now.day(),
            });
        state.snapshot(user_id, now)
    }

    async fn load_account(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        self.state.lock().await.snapshot(user_id, now)
    }

    async fn consume(
        &self,
        user_id: &str,
        amounts: &CreditAmounts,
        metadata: serde_json::Value,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumptionPlan> {
        let mut state = self.state.lock().await;
        let plan = state.snapshot(user_id, now)?.plan_consumption(amounts)?;
        if plan.is_empty() {
            return Ok(plan);
        }

        if let Some(account) = state.accounts.get_mut(user_id) {
            for credit_type in CreditType::ALL {
                let used = account.used.get(credit_type) + plan.base.get(credit_type);
                account.used.set(credit_type, used);
            }
        }
        let entries = state.entries.entry(user_id.to_string()).or_default();
        entries.extend(plan.draws.iter().map(|d| LedgerEntry::draw(d, now)));
        state.logs.push(CreditLogEntry::new(
            user_id,
            CreditLogKind::Use,
            plan.total(),
            metadata,
            now,
        ));
        Ok(plan)
    }

    async fn grant(
        &self,
        user_id: &str,
        request: &GrantRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ExtraCreditGrant>> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(user_id) {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(state.append_grants(user_id, request, now))
    }

    async fn settle_payment(
        &self,
        settlement: &PaymentSettlement,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&settlement.user_id) {
            return Err(BillingError::UserNotFound(settlement.user_id.clone()));
        }
        let key = (settlement.method, settlement.transaction_id.clone());
        if !state.transactions.insert(key) {
            return Ok(Settlement::AlreadySettled);
        }
        if settlement.credits.is_zero() {
            return Ok(Settlement::Granted(Vec::new()));
        }

        let request = GrantRequest {
            amounts: settlement.credits,
            source: CreditSource::Payment,
            reference: Some(settlement.transaction_id.clone()),
            metadata: serde_json::json!({
                "transactionId": settlement.transaction_id,
                "paymentMethod": settlement.method.as_str(),
                "planId": settlement.plan_id,
            }),
        };
        Ok(Settlement::Granted(state.append_grants(
            &settlement.user_id,
            &request,
            now,
        )))
    }

    async fn reset_usage(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        let cleared = account.used;
        let (start, end) = next_period(account.period_end, now, account.anchor_day);
        account.used = CreditAmounts::zero();
        account.period_start = start;
        account.period_end = end;
        state.logs.push(CreditLogEntry::new(
            user_id,
            CreditLogKind::Reset,
            cleared,
            serde_json::json!({ "periodEnd": end.unix_timestamp() }),
            now,
        ));
        state.snapshot(user_id, now)
    }

    async fn accounts_due_for_renewal(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<String>> {
        let state = self.state.lock().await;
        let mut due: Vec<(&String, OffsetDateTime)> = state
            .accounts
            .iter()
            .filter(|(_, a)| a.status.renews() && a.period_end <= now)
            .map(|(id, a)| (id, a.period_end))
            .collect();
        due.sort_by_key(|(_, end)| *end);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn set_tier(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        account.tier = tier;
        account.status = status;
        account.total = tier.allowance();
        state.snapshot(user_id, now)
    }

    async fn credit_logs(&self, user_id: &str, limit: i64) -> BillingResult<Vec<CreditLogEntry>> {
        let state = self.state.lock().await;
        if !state.accounts.contains_key(user_id) {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }
        Ok(state
            .logs
            .iter()
            .rev()
            .filter(|l| l.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WebhookEventStore for MemoryLedgerStore {
    async fn claim_event(
        &self,
        provider: &str,
        event_id: &str,
        _event_type: &str,
        stuck_after_minutes: i32,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let key = (provider.to_string(), event_id.to_string());
        let reclaimable = match state.webhook_events.get(&key) {
            None => true,
            Some(existing) => {
                existing.result == WebhookOutcome::Error.as_str()
                    || (existing.result == "processing"
                        && existing.started_at
                            < now - Duration::minutes(i64::from(stuck_after_minutes)))
            }
        };
        if reclaimable {
            state.webhook_events.insert(
                key,
                MemoryWebhookEvent {
                    result: "processing".to_string(),
                    started_at: now,
                },
            );
        }
        Ok(reclaimable)
    }

    async fn finish_event(
        &self,
        provider: &str,
        event_id: &str,
        outcome: WebhookOutcome,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state
            .webhook_events
            .get_mut(&(provider.to_string(), event_id.to_string()))
        {
            event.result = outcome.as_str().to_string();
        }
        Ok(())
    }

    async fn record_crypto_payment(
        &self,
        payment_id: &str,
        _user_id: &str,
        _plan_id: &str,
        status: &str,
        _now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state
            .crypto_payments
            .insert(payment_id.to_string(), status.to_string());
        Ok(())
    }
}

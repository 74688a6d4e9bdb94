//! Scheduled job bodies
//!
//! Each job logs its own outcome and never returns an error to the
//! scheduler; a failed run is retried on the next tick.

use shipmail_api::{campaigns, leads, leads::LeadSearchClient};
use shipmail_billing::{
    CreditLedger, InvariantChecker, RenewalSummary, ViolationSeverity,
};
use shipmail_shared::PgCounterStore;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Accounts renewed per run
pub const RENEWAL_BATCH: i64 = 500;
/// Scheduled campaigns started per run
pub const DISPATCH_BATCH: i64 = 100;
/// Rate-limit windows kept after they close
const USAGE_RETENTION: time::Duration = time::Duration::days(2);

/// Reset usage counters of accounts whose billing period has ended
pub async fn renew_subscriptions(ledger: &CreditLedger) -> Option<RenewalSummary> {
    match ledger.renew_due(RENEWAL_BATCH).await {
        Ok(summary) => {
            if summary.renewed > 0 || summary.failed > 0 {
                info!(
                    renewed = summary.renewed,
                    failed = summary.failed,
                    "Subscription renewal complete"
                );
            }
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Subscription renewal failed");
            None
        }
    }
}

pub async fn dispatch_campaigns(pool: &PgPool, ledger: &CreditLedger) {
    if let Err(e) =
        campaigns::dispatch_due(pool, ledger, OffsetDateTime::now_utc(), DISPATCH_BATCH).await
    {
        error!(error = %e, "Scheduled campaign dispatch failed");
    }
}

pub async fn fetch_leads(pool: &PgPool, ledger: &CreditLedger, client: &LeadSearchClient) {
    if let Err(e) = leads::run_daily_fetch(pool, ledger, client).await {
        error!(error = %e, "Daily lead fetch failed");
    }
}

pub async fn sweep_invariants(pool: &PgPool) {
    let checker = InvariantChecker::new(pool.clone());
    let summary = match checker.run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Invariant sweep failed");
            return;
        }
    };

    if summary.healthy {
        info!(checks = summary.checks_run, "Invariant sweep clean");
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }
    warn!(
        checks_failed = summary.checks_failed,
        critical = summary.count_at(ViolationSeverity::Critical),
        violations = summary.violations.len(),
        "Invariant sweep found violations"
    );
}

/// Drop closed rate-limit windows from `api_usage`
pub async fn purge_usage_counters(store: &PgCounterStore) {
    match store
        .purge_expired(OffsetDateTime::now_utc() - USAGE_RETENTION)
        .await
    {
        Ok(deleted) => info!(deleted, "Rate-limit counter cleanup complete"),
        Err(e) => error!(error = %e, "Rate-limit counter cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipmail_shared::{CreditAmounts, SubscriptionTier};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_renewal_resets_ended_periods_only() {
        let now = Arc::new(Mutex::new(OffsetDateTime::now_utc()));
        let clock = now.clone();
        let ledger = CreditLedger::in_memory().with_clock(move || *clock.lock().unwrap());

        ledger
            .create_account("uid-a", "a@store.example", SubscriptionTier::Starter)
            .await
            .unwrap();
        ledger
            .consume(
                "uid-a",
                &CreditAmounts::single(shipmail_shared::CreditType::Emails, 1_000),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let summary = renew_subscriptions(&ledger).await.unwrap();
        assert_eq!(summary.renewed, 0);

        *now.lock().unwrap() += time::Duration::days(32);
        let summary = renew_subscriptions(&ledger).await.unwrap();
        assert_eq!(summary.renewed, 1);

        let account = ledger.account("uid-a").await.unwrap();
        assert_eq!(account.used, CreditAmounts::zero());
    }
}

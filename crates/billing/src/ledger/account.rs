//! Account snapshots and the pure ledger arithmetic
//!
//! Stores load an [`AccountSnapshot`] (inside their transaction when they are
//! about to mutate) and use the functions here to decide what to write. Both
//! the Postgres and the in-memory store go through the same code, so the
//! balance rules exist exactly once.

use serde::{Deserialize, Serialize};
use shipmail_shared::{CreditAmounts, CreditType, SubscriptionStatus, SubscriptionTier};
use std::fmt;
use std::str::FromStr;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// How long purchased or earned extra credits stay usable
pub const EXTRA_CREDIT_TTL: Duration = Duration::days(30);

/// Largest quantity of one credit type a single grant may add
pub const MAX_GRANT_PER_TYPE: i64 = 1_000_000_000;

/// Where a ledger entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditSource {
    /// Verified payment settled through a provider
    Payment,
    /// One-off purchase recorded by staff
    Purchase,
    Referral,
    Admin,
    /// Draw against a grant
    Usage,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSource::Payment => "payment",
            CreditSource::Purchase => "purchase",
            CreditSource::Referral => "referral",
            CreditSource::Admin => "admin",
            CreditSource::Usage => "usage",
        }
    }
}

impl fmt::Display for CreditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditSource {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(CreditSource::Payment),
            "purchase" => Ok(CreditSource::Purchase),
            "referral" => Ok(CreditSource::Referral),
            "admin" => Ok(CreditSource::Admin),
            "usage" => Ok(CreditSource::Usage),
            other => Err(BillingError::InvalidInput(format!(
                "unknown credit source: {}",
                other
            ))),
        }
    }
}

/// One row of the append-only credit ledger
///
/// Grants carry a positive delta and no `grant_id`. Draws carry a negative
/// delta, point at the grant they spend and copy its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub credit_type: CreditType,
    pub delta: i64,
    pub grant_id: Option<Uuid>,
    pub source: CreditSource,
    pub reference: Option<String>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    pub fn grant(
        credit_type: CreditType,
        quantity: i64,
        source: CreditSource,
        reference: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            credit_type,
            delta: quantity,
            grant_id: None,
            source,
            reference,
            expires_at: now + EXTRA_CREDIT_TTL,
            created_at: now,
        }
    }

    pub fn draw(draw: &GrantDraw, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            credit_type: draw.credit_type,
            delta: -draw.amount,
            grant_id: Some(draw.grant_id),
            source: CreditSource::Usage,
            reference: None,
            expires_at: draw.expires_at,
            created_at: now,
        }
    }

    pub fn is_grant(&self) -> bool {
        self.grant_id.is_none()
    }
}

/// A live extra-credit grant with what is left of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtraCreditGrant {
    pub id: Uuid,
    pub credit_type: CreditType,
    /// Remaining quantity
    pub quantity: i64,
    /// Quantity originally granted
    pub granted: i64,
    pub source: CreditSource,
    #[serde(with = "time::serde::rfc3339")]
    pub purchased_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// Consumption order: soonest expiry first, then oldest purchase
fn consumption_order(a: &ExtraCreditGrant, b: &ExtraCreditGrant) -> std::cmp::Ordering {
    a.expires_at
        .cmp(&b.expires_at)
        .then(a.purchased_at.cmp(&b.purchased_at))
        .then(a.id.cmp(&b.id))
}

/// Fold ledger entries into the grants that are still usable at `now`
///
/// A grant is live while `expires_at > now` and something is left after its
/// draws. The result is sorted in consumption order.
pub fn live_grants(entries: &[LedgerEntry], now: OffsetDateTime) -> Vec<ExtraCreditGrant> {
    let mut grants: Vec<ExtraCreditGrant> = entries
        .iter()
        .filter(|e| e.is_grant() && e.expires_at > now)
        .map(|g| {
            let drawn = entries
                .iter()
                .filter(|d| d.grant_id == Some(g.id))
                .fold(0i64, |acc, d| acc.saturating_add(d.delta));
            ExtraCreditGrant {
                id: g.id,
                credit_type: g.credit_type,
                quantity: g.delta.saturating_add(drawn),
                granted: g.delta,
                source: g.source,
                purchased_at: g.created_at,
                expires_at: g.expires_at,
            }
        })
        .filter(|g| g.quantity > 0)
        .collect();
    grants.sort_by(consumption_order);
    grants
}

/// Per-type requirement check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditFlags {
    pub emails: bool,
    pub sms: bool,
    pub leads: bool,
}

impl CreditFlags {
    pub fn get(&self, credit_type: CreditType) -> bool {
        match credit_type {
            CreditType::Emails => self.emails,
            CreditType::Sms => self.sms,
            CreditType::Leads => self.leads,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SufficiencyReport {
    pub required: CreditAmounts,
    pub available: CreditAmounts,
    pub sufficient: CreditFlags,
    pub all_sufficient: bool,
}

/// Part of a consumption taken from one grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantDraw {
    pub grant_id: Uuid,
    pub credit_type: CreditType,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// What a consumption writes: counter increments plus grant draws
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumptionPlan {
    /// Added to the `used_*` counters
    pub base: CreditAmounts,
    pub draws: Vec<GrantDraw>,
}

impl ConsumptionPlan {
    /// Everything consumed, base and extra
    pub fn total(&self) -> CreditAmounts {
        let mut total = self.base;
        for draw in &self.draws {
            total.set(
                draw.credit_type,
                total.get(draw.credit_type).saturating_add(draw.amount),
            );
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_zero() && self.draws.is_empty()
    }
}

/// Balance of one credit type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceLine {
    pub total: i64,
    pub used: i64,
    pub extra: i64,
    pub available: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalances {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub emails: BalanceLine,
    pub sms: BalanceLine,
    pub leads: BalanceLine,
    pub grants: Vec<ExtraCreditGrant>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
}

/// Point-in-time view of an account's counters and live grants
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub user_id: String,
    pub email: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub total: CreditAmounts,
    pub used: CreditAmounts,
    /// Live grants in consumption order
    pub grants: Vec<ExtraCreditGrant>,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    /// Day of month every billing period starts on
    pub anchor_day: u8,
}

impl AccountSnapshot {
    /// Remaining extra credits of one type
    pub fn extra(&self, credit_type: CreditType) -> i64 {
        self.grants
            .iter()
            .filter(|g| g.credit_type == credit_type)
            .fold(0i64, |acc, g| acc.saturating_add(g.quantity))
    }

    /// What is left of the subscription allowance
    pub fn base_remaining(&self, credit_type: CreditType) -> i64 {
        self.total
            .get(credit_type)
            .saturating_sub(self.used.get(credit_type))
            .max(0)
    }

    /// `total - used + extra`, never below zero
    pub fn available(&self, credit_type: CreditType) -> i64 {
        self.total
            .get(credit_type)
            .saturating_sub(self.used.get(credit_type))
            .saturating_add(self.extra(credit_type))
            .max(0)
    }

    pub fn available_all(&self) -> CreditAmounts {
        let mut amounts = CreditAmounts::zero();
        for credit_type in CreditType::ALL {
            amounts.set(credit_type, self.available(credit_type));
        }
        amounts
    }

    pub fn check(&self, required: &CreditAmounts) -> BillingResult<SufficiencyReport> {
        reject_negative(required)?;
        let available = self.available_all();
        let sufficient = CreditFlags {
            emails: required.emails <= available.emails,
            sms: required.sms <= available.sms,
            leads: required.leads <= available.leads,
        };
        Ok(SufficiencyReport {
            required: *required,
            available,
            all_sufficient: sufficient.emails && sufficient.sms && sufficient.leads,
            sufficient,
        })
    }

    /// Decide how to cover `request`
    ///
    /// The subscription allowance is used first, then grants in consumption
    /// order. Fails without a partial plan if any type is short.
    pub fn plan_consumption(&self, request: &CreditAmounts) -> BillingResult<ConsumptionPlan> {
        reject_negative(request)?;

        for (credit_type, requested) in request.non_zero() {
            let available = self.available(credit_type);
            if requested > available {
                return Err(BillingError::InsufficientCredits {
                    credit_type,
                    requested,
                    available,
                });
            }
        }

        let mut plan = ConsumptionPlan::default();
        for (credit_type, requested) in request.non_zero() {
            let from_base = requested.min(self.base_remaining(credit_type));
            plan.base.set(credit_type, from_base);

            let mut outstanding = requested - from_base;
            for grant in self.grants.iter().filter(|g| g.credit_type == credit_type) {
                if outstanding == 0 {
                    break;
                }
                let take = outstanding.min(grant.quantity);
                plan.draws.push(GrantDraw {
                    grant_id: grant.id,
                    credit_type,
                    amount: take,
                    expires_at: grant.expires_at,
                });
                outstanding -= take;
            }

            if outstanding > 0 {
                return Err(BillingError::InsufficientCredits {
                    credit_type,
                    requested,
                    available: requested - outstanding,
                });
            }
        }

        Ok(plan)
    }

    pub fn balances(&self) -> CreditBalances {
        let line = |credit_type: CreditType| BalanceLine {
            total: self.total.get(credit_type),
            used: self.used.get(credit_type),
            extra: self.extra(credit_type),
            available: self.available(credit_type),
        };
        CreditBalances {
            user_id: self.user_id.clone(),
            tier: self.tier,
            status: self.status,
            emails: line(CreditType::Emails),
            sms: line(CreditType::Sms),
            leads: line(CreditType::Leads),
            grants: self.grants.clone(),
            period_end: self.period_end,
        }
    }
}

fn reject_negative(amounts: &CreditAmounts) -> BillingResult<()> {
    match amounts.first_negative() {
        Some(credit_type) => Err(BillingError::InvalidAmount {
            credit_type,
            amount: amounts.get(credit_type),
        }),
        None => Ok(()),
    }
}

/// Grants must add something, never subtract and stay below
/// [`MAX_GRANT_PER_TYPE`] per type
pub fn validate_grant(amounts: &CreditAmounts) -> BillingResult<()> {
    reject_negative(amounts)?;
    if amounts.is_zero() {
        return Err(BillingError::InvalidInput(
            "grant must include at least one credit".to_string(),
        ));
    }
    if let Some((credit_type, amount)) = amounts
        .non_zero()
        .find(|(_, amount)| *amount > MAX_GRANT_PER_TYPE)
    {
        return Err(BillingError::InvalidAmount {
            credit_type,
            amount,
        });
    }
    Ok(())
}

/// `anchor_day` of the month after `at`, clamped to that month's length
pub fn next_anchor(at: OffsetDateTime, anchor_day: u8) -> OffsetDateTime {
    let date = at.date();
    let (year, month) = match date.month() {
        time::Month::December => (date.year() + 1, time::Month::January),
        m => (date.year(), m.next()),
    };
    let day = anchor_day
        .max(1)
        .min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(next) => at.replace_date(next),
        Err(_) => at + Duration::days(30),
    }
}

/// Same day of the next month, clamped to the month's length
pub fn add_one_month(at: OffsetDateTime) -> OffsetDateTime {
    next_anchor(at, at.day())
}

/// Billing period following one that ended at `period_end`
///
/// Period boundaries fall on `anchor_day`, or the month's last day when it
/// is shorter. Skips whole periods if the account lapsed for several months
/// so the returned period always contains `now`.
pub fn next_period(
    period_end: OffsetDateTime,
    now: OffsetDateTime,
    anchor_day: u8,
) -> (OffsetDateTime, OffsetDateTime) {
    let mut start = period_end;
    let mut end = next_anchor(start, anchor_day);
    while end <= now {
        start = end;
        end = next_anchor(start, anchor_day);
    }
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-05-10 12:00:00 UTC);

    fn snapshot(total: CreditAmounts, used: CreditAmounts, entries: &[LedgerEntry]) -> AccountSnapshot {
        AccountSnapshot {
            user_id: "user-1".to_string(),
            email: "owner@example.com".to_string(),
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Active,
            total,
            used,
            grants: live_grants(entries, NOW),
            period_start: NOW - Duration::days(10),
            period_end: NOW + Duration::days(20),
            anchor_day: 30,
        }
    }

    fn grant_at(credit_type: CreditType, quantity: i64, granted_at: OffsetDateTime) -> LedgerEntry {
        LedgerEntry::grant(credit_type, quantity, CreditSource::Payment, None, granted_at)
    }

    #[test]
    fn test_available_combines_base_and_extra() {
        let entries = vec![grant_at(CreditType::Emails, 100, NOW - Duration::days(1))];
        let snap = snapshot(
            CreditAmounts::single(CreditType::Emails, 250),
            CreditAmounts::single(CreditType::Emails, 100),
            &entries,
        );
        assert_eq!(snap.available(CreditType::Emails), 250);
        assert_eq!(snap.extra(CreditType::Emails), 100);
        assert_eq!(snap.available(CreditType::Sms), 0);
    }

    #[test]
    fn test_expired_grant_is_not_counted() {
        let entries = vec![grant_at(CreditType::Leads, 40, NOW - Duration::days(31))];
        assert!(live_grants(&entries, NOW).is_empty());
    }

    #[test]
    fn test_grant_expiring_exactly_now_is_not_counted() {
        let entries = vec![grant_at(CreditType::Leads, 40, NOW - EXTRA_CREDIT_TTL)];
        assert!(live_grants(&entries, NOW).is_empty());
    }

    #[test]
    fn test_available_never_negative() {
        let snap = snapshot(
            CreditAmounts::single(CreditType::Emails, 250),
            CreditAmounts::single(CreditType::Emails, 400),
            &[],
        );
        assert_eq!(snap.available(CreditType::Emails), 0);
        assert_eq!(snap.base_remaining(CreditType::Emails), 0);
    }

    #[test]
    fn test_draws_reduce_grant_and_fully_drawn_grant_disappears() {
        let grant = grant_at(CreditType::Sms, 50, NOW - Duration::days(2));
        let partial = LedgerEntry::draw(
            &GrantDraw {
                grant_id: grant.id,
                credit_type: CreditType::Sms,
                amount: 20,
                expires_at: grant.expires_at,
            },
            NOW,
        );
        let live = live_grants(&[grant.clone(), partial.clone()], NOW);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].quantity, 30);
        assert_eq!(live[0].granted, 50);

        let rest = LedgerEntry::draw(
            &GrantDraw {
                grant_id: grant.id,
                credit_type: CreditType::Sms,
                amount: 30,
                expires_at: grant.expires_at,
            },
            NOW,
        );
        assert!(live_grants(&[grant, partial, rest], NOW).is_empty());
    }

    #[test]
    fn test_plan_uses_base_before_grants() {
        let entries = vec![grant_at(CreditType::Emails, 100, NOW - Duration::days(1))];
        let snap = snapshot(
            CreditAmounts::single(CreditType::Emails, 250),
            CreditAmounts::single(CreditType::Emails, 200),
            &entries,
        );

        let plan = snap
            .plan_consumption(&CreditAmounts::single(CreditType::Emails, 80))
            .unwrap();
        assert_eq!(plan.base.emails, 50);
        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0].amount, 30);
        assert_eq!(plan.total().emails, 80);
    }

    #[test]
    fn test_plan_draws_soonest_expiring_grant_first() {
        let older = grant_at(CreditType::Emails, 10, NOW - Duration::days(20));
        let newer = grant_at(CreditType::Emails, 10, NOW - Duration::days(2));
        let snap = snapshot(CreditAmounts::zero(), CreditAmounts::zero(), &[newer.clone(), older.clone()]);

        let plan = snap
            .plan_consumption(&CreditAmounts::single(CreditType::Emails, 15))
            .unwrap();
        assert_eq!(plan.base, CreditAmounts::zero());
        assert_eq!(plan.draws[0].grant_id, older.id);
        assert_eq!(plan.draws[0].amount, 10);
        assert_eq!(plan.draws[1].grant_id, newer.id);
        assert_eq!(plan.draws[1].amount, 5);
    }

    #[test]
    fn test_plan_rejects_shortfall_in_any_type() {
        let snap = snapshot(
            CreditAmounts {
                emails: 100,
                sms: 5,
                leads: 0,
            },
            CreditAmounts::zero(),
            &[],
        );
        let err = snap
            .plan_consumption(&CreditAmounts {
                emails: 10,
                sms: 6,
                leads: 0,
            })
            .unwrap_err();
        match err {
            BillingError::InsufficientCredits {
                credit_type,
                requested,
                available,
            } => {
                assert_eq!(credit_type, CreditType::Sms);
                assert_eq!(requested, 6);
                assert_eq!(available, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_plan_rejects_negative_request() {
        let snap = snapshot(CreditAmounts::single(CreditType::Emails, 100), CreditAmounts::zero(), &[]);
        let err = snap
            .plan_consumption(&CreditAmounts::single(CreditType::Emails, -5))
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount { .. }));
    }

    #[test]
    fn test_zero_request_is_empty_plan() {
        let snap = snapshot(CreditAmounts::zero(), CreditAmounts::zero(), &[]);
        let plan = snap.plan_consumption(&CreditAmounts::zero()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_check_reports_each_type() {
        let snap = snapshot(
            CreditAmounts {
                emails: 250,
                sms: 0,
                leads: 50,
            },
            CreditAmounts::single(CreditType::Emails, 100),
            &[],
        );
        let report = snap
            .check(&CreditAmounts {
                emails: 200,
                sms: 0,
                leads: 50,
            })
            .unwrap();
        assert!(!report.sufficient.emails);
        assert!(report.sufficient.sms);
        assert!(report.sufficient.leads);
        assert!(!report.all_sufficient);
        assert_eq!(report.available.emails, 150);
    }

    #[test]
    fn test_validate_grant() {
        assert!(validate_grant(&CreditAmounts::single(CreditType::Sms, 10)).is_ok());
        assert!(validate_grant(&CreditAmounts::zero()).is_err());
        assert!(validate_grant(&CreditAmounts::single(CreditType::Sms, -10)).is_err());
    }

    #[test]
    fn test_add_one_month_clamps_day() {
        assert_eq!(
            add_one_month(datetime!(2026-01-31 08:00:00 UTC)),
            datetime!(2026-02-28 08:00:00 UTC)
        );
        assert_eq!(
            add_one_month(datetime!(2026-12-15 00:00:00 UTC)),
            datetime!(2027-01-15 00:00:00 UTC)
        );
    }

    #[test]
    fn test_next_period_skips_lapsed_months() {
        let (start, end) = next_period(datetime!(2026-01-10 00:00:00 UTC), NOW, 10);
        assert_eq!(start, datetime!(2026-05-10 00:00:00 UTC));
        assert_eq!(end, datetime!(2026-06-10 00:00:00 UTC));
    }

    #[test]
    fn test_month_end_anchor_does_not_drift() {
        // Opened on Jan 31: Feb clamps to the 28th, March goes back to the 31st
        let feb = add_one_month(datetime!(2026-01-31 08:00:00 UTC));
        let (start, end) = next_period(feb, feb, 31);
        assert_eq!(start, datetime!(2026-02-28 08:00:00 UTC));
        assert_eq!(end, datetime!(2026-03-31 08:00:00 UTC));

        let (start, end) = next_period(end, end, 31);
        assert_eq!(start, datetime!(2026-03-31 08:00:00 UTC));
        assert_eq!(end, datetime!(2026-04-30 08:00:00 UTC));

        let (_, end) = next_period(end, end, 31);
        assert_eq!(end, datetime!(2026-05-31 08:00:00 UTC));
    }

    #[test]
    fn test_grant_above_cap_rejected() {
        assert!(validate_grant(&CreditAmounts::single(CreditType::Emails, MAX_GRANT_PER_TYPE)).is_ok());
        assert!(matches!(
            validate_grant(&CreditAmounts::single(CreditType::Emails, MAX_GRANT_PER_TYPE + 1)),
            Err(BillingError::InvalidAmount { credit_type: CreditType::Emails, .. })
        ));
        assert!(validate_grant(&CreditAmounts::single(CreditType::Leads, i64::MAX)).is_err());
    }

    #[test]
    fn test_balances_saturate_instead_of_overflowing() {
        // Rows written before the cap existed, or by hand, must not panic reads
        let entries = vec![
            grant_at(CreditType::Emails, i64::MAX, NOW - Duration::days(2)),
            grant_at(CreditType::Emails, i64::MAX, NOW - Duration::days(1)),
        ];
        let snap = snapshot(
            CreditAmounts::single(CreditType::Emails, 250),
            CreditAmounts::zero(),
            &entries,
        );
        assert_eq!(snap.extra(CreditType::Emails), i64::MAX);
        assert_eq!(snap.available(CreditType::Emails), i64::MAX);
        assert_eq!(snap.balances().emails.available, i64::MAX);
    }
}

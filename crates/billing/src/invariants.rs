//! Ledger invariants
//!
//! Read-only consistency checks over the credit tables. The worker runs them
//! periodically; they can also be run after replaying webhooks or repairing
//! data by hand.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<String>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits were granted or spent that should not have been
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn count_at(&self, severity: ViolationSeverity) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == severity)
            .count()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OverUsageRow {
    user_id: String,
    credit_type: String,
    total: i64,
    used: i64,
    extra: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OverdrawnGrantRow {
    grant_id: Uuid,
    user_id: String,
    credit_type: String,
    granted: i64,
    remaining: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MismatchedDrawRow {
    draw_id: Uuid,
    user_id: String,
    grant_user_id: String,
    credit_type: String,
    grant_credit_type: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UngrantedTransactionRow {
    user_id: String,
    transaction_id: String,
    payment_method: String,
    plan_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckWebhookRow {
    provider: String,
    event_id: String,
    processing_started_at: Option<OffsetDateTime>,
}

const CHECKS: [&str; 5] = [
    "usage_within_allowance",
    "grants_not_overdrawn",
    "draws_match_grant",
    "transactions_granted",
    "webhooks_not_stuck",
];

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        for check in CHECKS {
            violations.extend(self.run_check(check).await?);
        }
        Ok(InvariantCheckSummary::from_violations(now, CHECKS.len(), violations))
    }

    /// One named check, summarized like a full run
    pub async fn run_named_check(&self, name: &str) -> BillingResult<InvariantCheckSummary> {
        if !CHECKS.contains(&name) {
            return Err(BillingError::InvalidInput(format!("unknown check: {}", name)));
        }
        let now = OffsetDateTime::now_utc();
        let violations = self.run_check(name).await?;
        Ok(InvariantCheckSummary::from_violations(now, 1, violations))
    }

    /// Run a single check by name; unknown names find nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "usage_within_allowance" => self.check_usage_within_allowance().await,
            "grants_not_overdrawn" => self.check_grants_not_overdrawn().await,
            "draws_match_grant" => self.check_draws_match_grant().await,
            "transactions_granted" => self.check_transactions_granted().await,
            "webhooks_not_stuck" => self.check_webhooks_not_stuck().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// `used <= total + live extra` for every credit type
    ///
    /// The consume path never breaks this; a tier downgrade mid-period can.
    async fn check_usage_within_allowance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverUsageRow> = sqlx::query_as(
            r#"
            WITH live AS (
                SELECT g.user_id, g.credit_type,
                       SUM(g.delta + COALESCE(d.drawn, 0))::BIGINT AS extra
                FROM credit_entries g
                LEFT JOIN (
                    SELECT grant_id, SUM(delta) AS drawn
                    FROM credit_entries
                    WHERE grant_id IS NOT NULL
                    GROUP BY grant_id
                ) d ON d.grant_id = g.id
                WHERE g.grant_id IS NULL AND g.expires_at > NOW()
                GROUP BY g.user_id, g.credit_type
            ),
            usage AS (
                SELECT id AS user_id, 'emails' AS credit_type, total_emails AS total, used_emails AS used FROM users
                UNION ALL
                SELECT id, 'sms', total_sms, used_sms FROM users
                UNION ALL
                SELECT id, 'leads', total_leads, used_leads FROM users
            )
            SELECT u.user_id, u.credit_type, u.total, u.used,
                   COALESCE(l.extra, 0)::BIGINT AS extra
            FROM usage u
            LEFT JOIN live l ON l.user_id = u.user_id AND l.credit_type = u.credit_type
            WHERE u.used > u.total + COALESCE(l.extra, 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_within_allowance".to_string(),
                description: format!(
                    "{} usage {} exceeds allowance {} plus extra {}",
                    row.credit_type, row.used, row.total, row.extra
                ),
                context: serde_json::json!({
                    "credit_type": row.credit_type,
                    "total": row.total,
                    "used": row.used,
                    "extra": row.extra,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// No grant has more drawn from it than it held
    async fn check_grants_not_overdrawn(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdrawnGrantRow> = sqlx::query_as(
            r#"
            SELECT g.id AS grant_id, g.user_id, g.credit_type, g.delta AS granted,
                   (g.delta + COALESCE(SUM(d.delta), 0))::BIGINT AS remaining
            FROM credit_entries g
            LEFT JOIN credit_entries d ON d.grant_id = g.id
            WHERE g.grant_id IS NULL
            GROUP BY g.id
            HAVING g.delta + COALESCE(SUM(d.delta), 0) < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grants_not_overdrawn".to_string(),
                description: format!(
                    "Grant {} of {} {} credits is overdrawn to {}",
                    row.grant_id, row.granted, row.credit_type, row.remaining
                ),
                context: serde_json::json!({
                    "grant_id": row.grant_id,
                    "credit_type": row.credit_type,
                    "granted": row.granted,
                    "remaining": row.remaining,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Draws belong to a grant of the same user and credit type
    async fn check_draws_match_grant(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MismatchedDrawRow> = sqlx::query_as(
            r#"
            SELECT d.id AS draw_id, d.user_id, g.user_id AS grant_user_id,
                   d.credit_type, g.credit_type AS grant_credit_type
            FROM credit_entries d
            JOIN credit_entries g ON g.id = d.grant_id
            WHERE d.user_id <> g.user_id
               OR d.credit_type <> g.credit_type
               OR d.expires_at <> g.expires_at
               OR g.grant_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "draws_match_grant".to_string(),
                description: format!("Draw {} does not match its grant", row.draw_id),
                context: serde_json::json!({
                    "draw_id": row.draw_id,
                    "credit_type": row.credit_type,
                    "grant_credit_type": row.grant_credit_type,
                }),
                user_ids: if row.user_id == row.grant_user_id {
                    vec![row.user_id]
                } else {
                    vec![row.user_id, row.grant_user_id]
                },
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Every recorded transaction granted its credits
    async fn check_transactions_granted(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UngrantedTransactionRow> = sqlx::query_as(
            r#"
            SELECT t.user_id, t.transaction_id, t.payment_method, t.plan_id
            FROM transactions t
            WHERE (t.email_credits + t.sms_credits + t.lead_credits) > 0
              AND NOT EXISTS (
                  SELECT 1 FROM credit_entries e
                  WHERE e.user_id = t.user_id
                    AND e.grant_id IS NULL
                    AND e.source = 'payment'
                    AND e.reference = t.transaction_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transactions_granted".to_string(),
                description: format!(
                    "{} transaction {} for plan {} has no grant",
                    row.payment_method, row.transaction_id, row.plan_id
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "payment_method": row.payment_method,
                    "plan_id": row.plan_id,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Webhook events left in processing for over an hour
    async fn check_webhooks_not_stuck(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckWebhookRow> = sqlx::query_as(
            r#"
            SELECT provider, event_id, processing_started_at
            FROM payment_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "webhooks_not_stuck".to_string(),
                description: format!(
                    "{} webhook {} stuck in processing",
                    row.provider, row.event_id
                ),
                context: serde_json::json!({
                    "provider": row.provider,
                    "event_id": row.event_id,
                    "processing_started_at": row.processing_started_at.map(|t| t.unix_timestamp()),
                }),
                user_ids: vec![],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec!["user-1".to_string()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"grants_not_overdrawn"));
        assert!(checks.contains(&"transactions_granted"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::UNIX_EPOCH,
            5,
            vec![
                violation("grants_not_overdrawn", ViolationSeverity::Critical),
                violation("grants_not_overdrawn", ViolationSeverity::Critical),
                violation("webhooks_not_stuck", ViolationSeverity::Medium),
            ],
        );
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 3);
        assert!(!summary.healthy);
        assert_eq!(summary.count_at(ViolationSeverity::Critical), 2);
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::UNIX_EPOCH, 5, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 5);
    }
}

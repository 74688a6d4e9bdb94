//! Postgres ledger store
//!
//! Mutations take a `FOR NO KEY UPDATE` lock on the user row first, so
//! concurrent consumers of one account queue up behind each other while other
//! accounts proceed in parallel. The lock doesn't conflict with foreign-key
//! checks, so a caller may consume credits while its own open transaction
//! inserts rows that reference the user.

use async_trait::async_trait;
use shipmail_shared::{CreditAmounts, SubscriptionStatus, SubscriptionTier};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::account::{
    add_one_month, next_period, AccountSnapshot, ConsumptionPlan, CreditSource,
    ExtraCreditGrant, LedgerEntry,
};
use super::store::{
    GrantRequest, LedgerStore, PaymentSettlement, Settlement, WebhookEventStore, WebhookOutcome,
};
use crate::error::{BillingError, BillingResult};
use crate::events::{CreditLogEntry, CreditLogKind};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    subscription_tier: String,
    subscription_status: String,
    total_emails: i64,
    total_sms: i64,
    total_leads: i64,
    used_emails: i64,
    used_sms: i64,
    used_leads: i64,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    billing_anchor_day: i16,
}

#[derive(sqlx::FromRow)]
struct GrantRow {
    id: Uuid,
    credit_type: String,
    granted: i64,
    remaining: i64,
    source: String,
    expires_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct CreditLogRow {
    id: Uuid,
    user_id: String,
    kind: String,
    credits: Json<CreditAmounts>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
}

const SELECT_USER: &str = r#"
    SELECT id, email, subscription_tier, subscription_status,
           total_emails, total_sms, total_leads,
           used_emails, used_sms, used_leads,
           current_period_start, current_period_end, billing_anchor_day
    FROM users
    WHERE id = $1
"#;

const ROW_LOCK: &str = "FOR NO KEY UPDATE";

fn corrupt(what: &str, e: impl std::fmt::Display) -> BillingError {
    BillingError::Database(format!("invalid {} in database: {}", what, e))
}

/// Load the account and its live grants, locking the user row when `lock` is set
async fn load_snapshot(
    conn: &mut PgConnection,
    user_id: &str,
    now: OffsetDateTime,
    lock: bool,
) -> BillingResult<AccountSnapshot> {
    let query = if lock {
        format!("{} {}", SELECT_USER, ROW_LOCK)
    } else {
        SELECT_USER.to_string()
    };
    let user: UserRow = sqlx::query_as(&query)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

    // Draws copy their grant's expiry, so filtering grants by expiry also
    // drops the draws of expired grants.
    let rows: Vec<GrantRow> = sqlx::query_as(
        r#"
        SELECT g.id, g.credit_type, g.delta AS granted,
               (g.delta + COALESCE(SUM(d.delta), 0))::BIGINT AS remaining,
               g.source, g.expires_at, g.created_at
        FROM credit_entries g
        LEFT JOIN credit_entries d ON d.grant_id = g.id
        WHERE g.user_id = $1 AND g.grant_id IS NULL AND g.expires_at > $2
        GROUP BY g.id
        HAVING g.delta + COALESCE(SUM(d.delta), 0) > 0
        ORDER BY g.expires_at ASC, g.created_at ASC, g.id ASC
        "#,
    )
    .bind(user_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    let mut grants = Vec::with_capacity(rows.len());
    for row in rows {
        grants.push(ExtraCreditGrant {
            id: row.id,
            credit_type: row
                .credit_type
                .parse()
                .map_err(|e| corrupt("credit type", e))?,
            quantity: row.remaining,
            granted: row.granted,
            source: row.source.parse()?,
            purchased_at: row.created_at,
            expires_at: row.expires_at,
        });
    }

    Ok(AccountSnapshot {
        user_id: user.id,
        email: user.email,
        tier: user
            .subscription_tier
            .parse()
            .map_err(|e| corrupt("subscription tier", e))?,
        status: user
            .subscription_status
            .parse()
            .map_err(|e| corrupt("subscription status", e))?,
        total: CreditAmounts {
            emails: user.total_emails,
            sms: user.total_sms,
            leads: user.total_leads,
        },
        used: CreditAmounts {
            emails: user.used_emails,
            sms: user.used_sms,
            leads: user.used_leads,
        },
        grants,
        period_start: user.current_period_start,
        period_end: user.current_period_end,
        anchor_day: u8::try_from(user.billing_anchor_day)
            .map_err(|e| corrupt("billing anchor day", e))?,
    })
}

async fn insert_entry(
    conn: &mut PgConnection,
    user_id: &str,
    entry: &LedgerEntry,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_entries
            (id, user_id, credit_type, delta, grant_id, source, reference, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id)
    .bind(user_id)
    .bind(entry.credit_type.as_str())
    .bind(entry.delta)
    .bind(entry.grant_id)
    .bind(entry.source.as_str())
    .bind(&entry.reference)
    .bind(entry.expires_at)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_log(conn: &mut PgConnection, log: &CreditLogEntry) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_logs (id, user_id, kind, credits, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(log.id)
    .bind(&log.user_id)
    .bind(log.kind.as_str())
    .bind(Json(log.credits))
    .bind(&log.metadata)
    .bind(log.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_grants(
    conn: &mut PgConnection,
    user_id: &str,
    request: &GrantRequest,
    now: OffsetDateTime,
) -> BillingResult<Vec<ExtraCreditGrant>> {
    let mut granted = Vec::new();
    for (credit_type, quantity) in request.amounts.non_zero() {
        let entry = LedgerEntry::grant(
            credit_type,
            quantity,
            request.source,
            request.reference.clone(),
            now,
        );
        insert_entry(conn, user_id, &entry).await?;
        granted.push(ExtraCreditGrant {
            id: entry.id,
            credit_type,
            quantity,
            granted: quantity,
            source: entry.source,
            purchased_at: entry.created_at,
            expires_at: entry.expires_at,
        });
    }
    let log = CreditLogEntry::new(
        user_id,
        CreditLogKind::Add,
        request.amounts,
        request.metadata.clone(),
        now,
    );
    insert_log(conn, &log).await?;
    Ok(granted)
}

async fn lock_user(conn: &mut PgConnection, user_id: &str) -> BillingResult<()> {
    let found: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR NO KEY UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    found
        .map(|_| ())
        .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
}

/// Lock the user row on `conn`, plan the consumption and write it
///
/// Nothing is committed here. Run it inside a transaction; the row lock and
/// the writes last until that transaction ends.
pub(crate) async fn consume_on(
    conn: &mut PgConnection,
    user_id: &str,
    amounts: &CreditAmounts,
    metadata: serde_json::Value,
    now: OffsetDateTime,
) -> BillingResult<ConsumptionPlan> {
    let snapshot = load_snapshot(conn, user_id, now, true).await?;
    let plan = snapshot.plan_consumption(amounts)?;
    if plan.is_empty() {
        return Ok(plan);
    }

    if !plan.base.is_zero() {
        sqlx::query(
            r#"
            UPDATE users SET
                used_emails = used_emails + $2,
                used_sms = used_sms + $3,
                used_leads = used_leads + $4,
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(plan.base.emails)
        .bind(plan.base.sms)
        .bind(plan.base.leads)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    for draw in &plan.draws {
        insert_entry(conn, user_id, &LedgerEntry::draw(draw, now)).await?;
    }

    let log = CreditLogEntry::new(user_id, CreditLogKind::Use, plan.total(), metadata, now);
    insert_log(conn, &log).await?;
    Ok(plan)
}

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(
        &self,
        user_id: &str,
        email: &str,
        tier: SubscriptionTier,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let allowance = tier.allowance();
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (
                id, email, subscription_tier, subscription_status,
                total_emails, total_sms, total_leads,
                current_period_start, current_period_end, billing_anchor_day,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $8, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(tier.as_str())
        .bind(SubscriptionStatus::Trial.as_str())
        .bind(allowance.emails)
        .bind(allowance.sms)
        .bind(allowance.leads)
        .bind(now)
        .bind(add_one_month(now))
        .bind(i16::from(now.day()))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!(user_id = %user_id, tier = %tier, "Created account");
        }

        let mut conn = self.pool.acquire().await?;
        load_snapshot(&mut conn, user_id, now, false).await
    }

    async fn load_account(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let mut conn = self.pool.acquire().await?;
        load_snapshot(&mut conn, user_id, now, false).await
    }

    async fn consume(
        &self,
        user_id: &str,
        amounts: &CreditAmounts,
        metadata: serde_json::Value,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumptionPlan> {
        let mut tx = self.pool.begin().await?;
        // Dropping `tx` on error rolls back and releases the lock
        let plan = consume_on(&mut tx, user_id, amounts, metadata, now).await?;
        tx.commit().await?;
        Ok(plan)
    }

    async fn grant(
        &self,
        user_id: &str,
        request: &GrantRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ExtraCreditGrant>> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, user_id).await?;
        let granted = insert_grants(&mut tx, user_id, request, now).await?;
        tx.commit().await?;
        Ok(granted)
    }

    async fn settle_payment(
        &self,
        settlement: &PaymentSettlement,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut tx = self.pool.begin().await?;
        lock_user(&mut tx, &settlement.user_id).await?;

        // The unique (payment_method, transaction_id) pair is the
        // idempotency key: a second delivery inserts nothing.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO transactions (
                id, user_id, transaction_id, payment_method, plan_id,
                email_credits, sms_credits, lead_credits, amount_cents, currency, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (payment_method, transaction_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&settlement.user_id)
        .bind(&settlement.transaction_id)
        .bind(settlement.method.as_str())
        .bind(&settlement.plan_id)
        .bind(settlement.credits.emails)
        .bind(settlement.credits.sms)
        .bind(settlement.credits.leads)
        .bind(settlement.amount_cents)
        .bind(&settlement.currency)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.commit().await?;
            return Ok(Settlement::AlreadySettled);
        }

        let granted = if settlement.credits.is_zero() {
            Vec::new()
        } else {
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
            insert_grants(&mut tx, &settlement.user_id, &request, now).await?
        };

        tx.commit().await?;
        Ok(Settlement::Granted(granted))
    }

    async fn reset_usage(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let mut tx = self.pool.begin().await?;
        let mut snapshot = load_snapshot(&mut tx, user_id, now, true).await?;
        let (start, end) = next_period(snapshot.period_end, now, snapshot.anchor_day);

        sqlx::query(
            r#"
            UPDATE users SET
                used_emails = 0,
                used_sms = 0,
                used_leads = 0,
                current_period_start = $2,
                current_period_end = $3,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let log = CreditLogEntry::new(
            user_id,
            CreditLogKind::Reset,
            snapshot.used,
            serde_json::json!({ "periodEnd": end.unix_timestamp() }),
            now,
        );
        insert_log(&mut tx, &log).await?;
        tx.commit().await?;

        snapshot.used = CreditAmounts::zero();
        snapshot.period_start = start;
        snapshot.period_end = end;
        Ok(snapshot)
    }

    async fn accounts_due_for_renewal(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM users
            WHERE current_period_end <= $1
              AND subscription_status IN ('trial', 'active')
            ORDER BY current_period_end ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn set_tier(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<AccountSnapshot> {
        let allowance = tier.allowance();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE users SET
                subscription_tier = $2,
                subscription_status = $3,
                total_emails = $4,
                total_sms = $5,
                total_leads = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(status.as_str())
        .bind(allowance.emails)
        .bind(allowance.sms)
        .bind(allowance.leads)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }

        let snapshot = load_snapshot(&mut tx, user_id, now, false).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn credit_logs(&self, user_id: &str, limit: i64) -> BillingResult<Vec<CreditLogEntry>> {
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(BillingError::UserNotFound(user_id.to_string()));
        }

        let rows: Vec<CreditLogRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, kind, credits, metadata, created_at
            FROM credit_logs
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> BillingResult<CreditLogEntry> {
                Ok(CreditLogEntry {
                    id: row.id,
                    user_id: row.user_id,
                    kind: row.kind.parse()?,
                    credits: row.credits.0,
                    metadata: row.metadata,
                    created_at: row.created_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WebhookEventStore for PgLedgerStore {
    async fn claim_event(
        &self,
        provider: &str,
        event_id: &str,
        event_type: &str,
        stuck_after_minutes: i32,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Claim by inserting; on conflict only take over events that failed
        // or have been processing for longer than the stuck threshold.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_webhook_events
                (id, provider, event_id, event_type, processing_result, processing_started_at, created_at)
            VALUES ($1, $2, $3, $4, 'processing', $5, $5)
            ON CONFLICT (provider, event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $5,
                error_message = NULL
            WHERE payment_webhook_events.processing_result = 'error'
               OR (payment_webhook_events.processing_result = 'processing'
                   AND payment_webhook_events.processing_started_at < $5 - make_interval(mins => $6))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(provider)
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(stuck_after_minutes)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        provider: &str,
        event_id: &str,
        outcome: WebhookOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_webhook_events
            SET processing_result = $3, error_message = $4
            WHERE provider = $1 AND event_id = $2
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_crypto_payment(
        &self,
        payment_id: &str,
        user_id: &str,
        plan_id: &str,
        status: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO crypto_payments (payment_id, user_id, plan_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (payment_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(payment_id)
        .bind(user_id)
        .bind(plan_id)
        .bind(status)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_value_maps_to_database_error() {
        let err = corrupt("credit type", "bogus");
        assert!(matches!(err, BillingError::Database(msg) if msg.contains("credit type")));
    }
}

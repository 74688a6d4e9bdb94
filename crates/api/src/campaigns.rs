//! Campaign lifecycle
//!
//! Status changes follow [`CampaignStatus::successors`]. Starting delivery
//! (`draft|scheduled -> active`) is the only transition that spends credits:
//! one credit of the campaign's channel per recipient, charged through the
//! ledger while the campaign row is locked.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shipmail_billing::CreditLedger;
use shipmail_shared::{CampaignChannel, CampaignStatus, CreditAmounts};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

const CAMPAIGN_COLUMNS: &str = r#"
    id, user_id, name, channel, subject, template_id, status, recipient_count,
    sent_count, open_count, click_count, bounce_count, scheduled_at,
    failure_reason, created_at, updated_at
"#;

const MAX_NAME_LEN: usize = 200;

#[derive(Debug, FromRow)]
struct CampaignRow {
    id: Uuid,
    user_id: String,
    name: String,
    channel: String,
    subject: Option<String>,
    template_id: Option<Uuid>,
    status: String,
    recipient_count: i64,
    sent_count: i64,
    open_count: i64,
    click_count: i64,
    bounce_count: i64,
    scheduled_at: Option<OffsetDateTime>,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub channel: CampaignChannel,
    pub subject: Option<String>,
    pub template_id: Option<Uuid>,
    pub status: CampaignStatus,
    pub recipient_count: i64,
    pub sent_count: i64,
    pub open_count: i64,
    pub click_count: i64,
    pub bounce_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = ApiError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        let corrupt = |e: shipmail_shared::ParseEnumError| {
            ApiError::Database(format!("campaign {}: {}", row.id, e))
        };
        Ok(Self {
            channel: row.channel.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            subject: row.subject,
            template_id: row.template_id,
            recipient_count: row.recipient_count,
            sent_count: row.sent_count,
            open_count: row.open_count,
            click_count: row.click_count,
            bounce_count: row.bounce_count,
            scheduled_at: row.scheduled_at,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignRequest {
    pub name: String,
    #[serde(default)]
    pub channel: Option<CampaignChannel>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub recipient_count: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_at: Option<OffsetDateTime>,
}

impl CreateCampaignRequest {
    pub fn validate(&self) -> ApiResult<()> {
        let name = self.name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ApiError::Validation(format!(
                "Campaign name must be 1-{} characters",
                MAX_NAME_LEN
            )));
        }
        if self.recipient_count < 0 {
            return Err(ApiError::Validation(
                "recipientCount cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    fn initial_status(&self) -> CampaignStatus {
        if self.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        }
    }
}

/// Check a status change requested through the status route
pub fn validate_transition(from: CampaignStatus, to: CampaignStatus) -> ApiResult<()> {
    if !from.can_transition_to(to) {
        return Err(ApiError::Conflict(format!(
            "Cannot move campaign from {} to {}",
            from, to
        )));
    }
    if to == CampaignStatus::Active && matches!(from, CampaignStatus::Draft | CampaignStatus::Scheduled) {
        return Err(ApiError::Conflict(
            "Campaigns are started through the send endpoint".to_string(),
        ));
    }
    Ok(())
}

fn ensure_owner(campaign: &Campaign, user_id: &str) -> ApiResult<()> {
    if campaign.user_id != user_id {
        return Err(ApiError::Forbidden("Not your campaign".to_string()));
    }
    Ok(())
}

async fn fetch(pool: &PgPool, id: Uuid) -> ApiResult<Campaign> {
    let row: CampaignRow = sqlx::query_as(&format!(
        "SELECT {} FROM campaigns WHERE id = $1",
        CAMPAIGN_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("Campaign {}", id)))?;
    row.try_into()
}

pub async fn list(pool: &PgPool, user_id: &str) -> ApiResult<Vec<Campaign>> {
    let rows: Vec<CampaignRow> = sqlx::query_as(&format!(
        "SELECT {} FROM campaigns WHERE user_id = $1 ORDER BY created_at DESC",
        CAMPAIGN_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Campaign::try_from).collect()
}

pub async fn get(pool: &PgPool, user_id: &str, id: Uuid) -> ApiResult<Campaign> {
    let campaign = fetch(pool, id).await?;
    ensure_owner(&campaign, user_id)?;
    Ok(campaign)
}

pub async fn create(
    pool: &PgPool,
    user_id: &str,
    request: &CreateCampaignRequest,
) -> ApiResult<Campaign> {
    request.validate()?;

    if let Some(template_id) = request.template_id {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM templates WHERE id = $1")
                .bind(template_id)
                .fetch_optional(pool)
                .await?;
        match owner {
            None => return Err(ApiError::NotFound(format!("Template {}", template_id))),
            Some(owner) if owner != user_id => {
                return Err(ApiError::Forbidden("Not your template".to_string()))
            }
            Some(_) => {}
        }
    }

    let channel = request.channel.unwrap_or(CampaignChannel::Email);
    let row: CampaignRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO campaigns (id, user_id, name, channel, subject, template_id, status,
                               recipient_count, scheduled_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {}
        "#,
        CAMPAIGN_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(request.name.trim())
    .bind(channel.as_str())
    .bind(&request.subject)
    .bind(request.template_id)
    .bind(request.initial_status().as_str())
    .bind(request.recipient_count)
    .bind(request.scheduled_at)
    .fetch_one(pool)
    .await?;

    let campaign = Campaign::try_from(row)?;
    tracing::info!(user_id = %user_id, campaign_id = %campaign.id, status = %campaign.status, "Campaign created");
    Ok(campaign)
}

pub async fn delete(pool: &PgPool, user_id: &str, id: Uuid) -> ApiResult<()> {
    let campaign = get(pool, user_id, id).await?;
    if campaign.status == CampaignStatus::Sending {
        return Err(ApiError::Conflict(
            "Campaign is being sent and cannot be deleted".to_string(),
        ));
    }
    sqlx::query("DELETE FROM campaigns WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    tracing::info!(user_id = %user_id, campaign_id = %id, "Campaign deleted");
    Ok(())
}

/// Apply a status change that doesn't spend credits
pub async fn transition(
    pool: &PgPool,
    user_id: &str,
    id: Uuid,
    next: CampaignStatus,
    scheduled_at: Option<OffsetDateTime>,
) -> ApiResult<Campaign> {
    let mut tx = pool.begin().await?;
    let row: CampaignRow = sqlx::query_as(&format!(
        "SELECT {} FROM campaigns WHERE id = $1 FOR UPDATE",
        CAMPAIGN_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("Campaign {}", id)))?;
    let campaign = Campaign::try_from(row)?;
    ensure_owner(&campaign, user_id)?;
    validate_transition(campaign.status, next)?;

    let scheduled_at = scheduled_at.or(campaign.scheduled_at);
    if next == CampaignStatus::Scheduled && scheduled_at.is_none() {
        return Err(ApiError::Validation(
            "scheduledAt is required to schedule a campaign".to_string(),
        ));
    }

    let row: CampaignRow = sqlx::query_as(&format!(
        r#"
        UPDATE campaigns
        SET status = $2, scheduled_at = $3, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        CAMPAIGN_COLUMNS
    ))
    .bind(id)
    .bind(next.as_str())
    .bind(scheduled_at)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(campaign_id = %id, from = %campaign.status, to = %next, "Campaign status changed");
    row.try_into()
}

/// Start delivery: charge credits for every recipient and mark the campaign
/// active, both in one transaction. `owner` is checked when the caller is a
/// user.
///
/// Locks the campaign row first and the owner's user row second.
async fn start(
    pool: &PgPool,
    ledger: &CreditLedger,
    id: Uuid,
    owner: Option<&str>,
    origin: &str,
) -> ApiResult<Campaign> {
    let mut tx = pool.begin().await?;
    let row: CampaignRow = sqlx::query_as(&format!(
        "SELECT {} FROM campaigns WHERE id = $1 FOR UPDATE",
        CAMPAIGN_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("Campaign {}", id)))?;
    let campaign = Campaign::try_from(row)?;

    if let Some(owner) = owner {
        ensure_owner(&campaign, owner)?;
    }
    if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled) {
        return Err(ApiError::Conflict(format!(
            "Campaign is {} and cannot be started",
            campaign.status
        )));
    }
    if campaign.recipient_count <= 0 {
        return Err(ApiError::Validation("Campaign has no recipients".to_string()));
    }

    let credits = CreditAmounts::single(campaign.channel.credit_type(), campaign.recipient_count);
    ledger
        .consume_in(
            &mut tx,
            &campaign.user_id,
            &credits,
            json!({ "campaignId": id, "origin": origin }),
        )
        .await?;

    let row: CampaignRow = sqlx::query_as(&format!(
        r#"
        UPDATE campaigns
        SET status = 'active', failure_reason = NULL, updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        CAMPAIGN_COLUMNS
    ))
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        campaign_id = %id,
        user_id = %campaign.user_id,
        recipients = campaign.recipient_count,
        origin = %origin,
        "Campaign started"
    );
    row.try_into()
}

/// User-initiated send
pub async fn send(
    pool: &PgPool,
    ledger: &CreditLedger,
    user_id: &str,
    id: Uuid,
) -> ApiResult<Campaign> {
    start(pool, ledger, id, Some(user_id), "user").await
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub started: usize,
    /// Marked failed for lack of credits
    pub failed: usize,
    pub errors: usize,
}

/// Start every scheduled campaign whose time has come
pub async fn dispatch_due(
    pool: &PgPool,
    ledger: &CreditLedger,
    now: OffsetDateTime,
    limit: i64,
) -> ApiResult<DispatchSummary> {
    let due: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM campaigns
        WHERE status = 'scheduled' AND scheduled_at <= $1
        ORDER BY scheduled_at
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut summary = DispatchSummary::default();
    for id in due {
        match start(pool, ledger, id, None, "schedule").await {
            Ok(_) => summary.started += 1,
            Err(ApiError::InsufficientCredits(reason)) => {
                summary.failed += 1;
                mark_failed(pool, id, &reason).await?;
            }
            // Picked up by a concurrent dispatcher or edited since the query
            Err(ApiError::Conflict(_)) => {}
            Err(e) => {
                summary.errors += 1;
                tracing::error!(campaign_id = %id, error = %e, "Failed to start scheduled campaign");
            }
        }
    }

    tracing::info!(
        started = summary.started,
        failed = summary.failed,
        errors = summary.errors,
        "Scheduled campaign dispatch complete"
    );
    Ok(summary)
}

async fn mark_failed(pool: &PgPool, id: Uuid, reason: &str) -> ApiResult<()> {
    sqlx::query(
        r#"
        UPDATE campaigns
        SET status = 'failed', failure_reason = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'scheduled'
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await?;
    tracing::warn!(campaign_id = %id, reason = %reason, "Scheduled campaign failed");
    Ok(())
}

// =============================================================================
// Delivery events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
}

impl DeliveryEventKind {
    /// Accepts bare names and the provider's `email.` prefixed ones
    pub fn parse(event_type: &str) -> Option<Self> {
        let name = event_type.trim().to_ascii_lowercase();
        match name.strip_prefix("email.").unwrap_or(&name) {
            "sent" | "delivered" => Some(Self::Delivered),
            "opened" | "open" => Some(Self::Opened),
            "clicked" | "click" => Some(Self::Clicked),
            "bounced" | "bounce" => Some(Self::Bounced),
            _ => None,
        }
    }

    fn counter_column(&self) -> &'static str {
        match self {
            Self::Delivered => "sent_count",
            Self::Opened => "open_count",
            Self::Clicked => "click_count",
            Self::Bounced => "bounce_count",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub event_id: String,
    pub campaign_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
}

/// Count a delivery event once per provider event id; returns false for a
/// duplicate delivery
pub async fn apply_delivery_event(pool: &PgPool, event: &DeliveryEvent) -> ApiResult<bool> {
    if event.event_id.trim().is_empty() {
        return Err(ApiError::Validation("eventId is required".to_string()));
    }
    let kind = DeliveryEventKind::parse(&event.event_type).ok_or_else(|| {
        ApiError::Validation(format!("Unknown event type: {}", event.event_type))
    })?;

    let mut tx = pool.begin().await?;

    let column = kind.counter_column();
    let updated = sqlx::query(&format!(
        "UPDATE campaigns SET {col} = {col} + 1, updated_at = NOW() WHERE id = $1",
        col = column
    ))
    .bind(event.campaign_id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::NotFound(format!("Campaign {}", event.campaign_id)));
    }

    let inserted: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO campaign_events (event_id, campaign_id, event_type)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_id) DO NOTHING
        RETURNING event_id
        "#,
    )
    .bind(&event.event_id)
    .bind(event.campaign_id)
    .bind(&event.event_type)
    .fetch_optional(&mut *tx)
    .await?;

    if inserted.is_none() {
        tx.rollback().await?;
        tracing::debug!(event_id = %event.event_id, "Duplicate delivery event ignored");
        return Ok(false);
    }

    tx.commit().await?;
    Ok(true)
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub sent: i64,
    pub opens: i64,
    pub clicks: i64,
    pub bounces: i64,
    /// Opens per delivered message, in percent
    pub response_rate: f64,
}

/// Percentage with one decimal; zero when nothing was sent
pub fn response_rate(sent: i64, opens: i64) -> f64 {
    if sent <= 0 {
        return 0.0;
    }
    (opens as f64 / sent as f64 * 1000.0).round() / 10.0
}

#[derive(Debug, FromRow)]
struct StatusTotalsRow {
    status: String,
    campaigns: i64,
    sent: i64,
    opens: i64,
    clicks: i64,
    bounces: i64,
}

pub async fn stats_for_user(pool: &PgPool, user_id: &str) -> ApiResult<CampaignStats> {
    let rows: Vec<StatusTotalsRow> = sqlx::query_as(
        r#"
        SELECT status,
               COUNT(*)::BIGINT AS campaigns,
               COALESCE(SUM(sent_count), 0)::BIGINT AS sent,
               COALESCE(SUM(open_count), 0)::BIGINT AS opens,
               COALESCE(SUM(click_count), 0)::BIGINT AS clicks,
               COALESCE(SUM(bounce_count), 0)::BIGINT AS bounces
        FROM campaigns
        WHERE user_id = $1
        GROUP BY status
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut stats = CampaignStats::default();
    for row in rows {
        stats.total += row.campaigns;
        stats.sent += row.sent;
        stats.opens += row.opens;
        stats.clicks += row.clicks;
        stats.bounces += row.bounces;
        stats.by_status.insert(row.status, row.campaigns);
    }
    stats.response_rate = response_rate(stats.sent, stats.opens);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use CampaignStatus::*;

    #[test]
    fn test_send_only_path_to_active_from_draft() {
        assert!(matches!(
            validate_transition(Draft, Active),
            Err(ApiError::Conflict(_))
        ));
        assert!(matches!(
            validate_transition(Scheduled, Active),
            Err(ApiError::Conflict(_))
        ));
        assert!(validate_transition(Paused, Active).is_ok());
    }

    #[test]
    fn test_transition_table() {
        assert!(validate_transition(Draft, Scheduled).is_ok());
        assert!(validate_transition(Scheduled, Draft).is_ok());
        assert!(validate_transition(Active, Paused).is_ok());
        assert!(validate_transition(Sending, Sent).is_ok());
        assert!(validate_transition(Sent, Completed).is_ok());

        assert!(validate_transition(Draft, Sent).is_err());
        assert!(validate_transition(Completed, Active).is_err());
        assert!(validate_transition(Failed, Draft).is_err());
        assert!(validate_transition(Paused, Sending).is_err());
    }

    #[test]
    fn test_delivery_event_parsing() {
        assert_eq!(DeliveryEventKind::parse("email.opened"), Some(DeliveryEventKind::Opened));
        assert_eq!(DeliveryEventKind::parse("Delivered"), Some(DeliveryEventKind::Delivered));
        assert_eq!(DeliveryEventKind::parse("email.bounced"), Some(DeliveryEventKind::Bounced));
        assert_eq!(DeliveryEventKind::parse("click"), Some(DeliveryEventKind::Clicked));
        assert_eq!(DeliveryEventKind::parse("email.complained"), None);
    }

    #[test]
    fn test_response_rate() {
        assert_eq!(response_rate(0, 5), 0.0);
        assert_eq!(response_rate(200, 50), 25.0);
        assert_eq!(response_rate(3, 1), 33.3);
    }

    #[test]
    fn test_create_request_validation() {
        let mut request: CreateCampaignRequest =
            serde_json::from_value(json!({ "name": "Spring sale", "recipientCount": 120 })).unwrap();
        assert!(request.validate().is_ok());
        assert_eq!(request.initial_status(), Draft);

        request.scheduled_at = Some(OffsetDateTime::now_utc());
        assert_eq!(request.initial_status(), Scheduled);

        request.name = "   ".to_string();
        assert!(request.validate().is_err());

        request.name = "ok".to_string();
        request.recipient_count = -1;
        assert!(request.validate().is_err());
    }
}

//! Dashboard stats

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;
use shipmail_billing::CreditBalances;
use shipmail_shared::TierFeatures;

use crate::{
    auth::AuthUser,
    campaigns::{self, CampaignStats},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatsResponse {
    pub credits: CreditBalances,
    pub features: TierFeatures,
    pub campaigns: CampaignStats,
    pub total_leads: i64,
}

pub async fn user_stats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UserStatsResponse>> {
    let credits = state.billing.ledger.balances(&auth_user.user_id).await?;
    let campaigns = campaigns::stats_for_user(&state.pool, &auth_user.user_id).await?;
    let total_leads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE user_id = $1")
        .bind(&auth_user.user_id)
        .fetch_one(&state.pool)
        .await?;

    Ok(Json(UserStatsResponse {
        features: credits.tier.limits().features,
        credits,
        campaigns,
        total_leads,
    }))
}

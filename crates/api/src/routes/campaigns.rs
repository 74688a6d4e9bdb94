//! Campaign routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use shipmail_shared::CampaignStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    campaigns::{self, Campaign, CreateCampaignRequest},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct CampaignListResponse {
    pub campaigns: Vec<Campaign>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: CampaignStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_at: Option<OffsetDateTime>,
}

pub async fn list_campaigns(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CampaignListResponse>> {
    let campaigns = campaigns::list(&state.pool, &auth_user.user_id).await?;
    Ok(Json(CampaignListResponse { campaigns }))
}

pub async fn get_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Campaign>> {
    let campaign = campaigns::get(&state.pool, &auth_user.user_id, id).await?;
    Ok(Json(campaign))
}

pub async fn create_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CreateCampaignRequest>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = campaigns::create(&state.pool, &auth_user.user_id, &request).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

pub async fn delete_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    campaigns::delete(&state.pool, &auth_user.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_campaign_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Campaign>> {
    let campaign = campaigns::transition(
        &state.pool,
        &auth_user.user_id,
        id,
        request.status,
        request.scheduled_at,
    )
    .await?;
    Ok(Json(campaign))
}

/// Charge the campaign's credits and start delivery
pub async fn send_campaign(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Campaign>> {
    let campaign =
        campaigns::send(&state.pool, &state.billing.ledger, &auth_user.user_id, id).await?;
    Ok(Json(campaign))
}

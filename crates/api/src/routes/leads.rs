//! Leads API and saved search routes

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    leads::{self, Contact, MAX_LEADS_PER_REQUEST},
    state::AppState,
};

const DEFAULT_SEARCH_LIMIT: i64 = 25;

// =============================================================================
// Leads API (API key)
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchLeadsQuery {
    pub q: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LeadsResponse {
    pub leads: Vec<Contact>,
    pub count: usize,
}

/// Search contacts; one lead credit per returned contact
pub async fn search_leads(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<SearchLeadsQuery>,
) -> ApiResult<Json<LeadsResponse>> {
    let q = query.q.as_deref().map(str::trim).unwrap_or_default();
    if q.is_empty() {
        return Err(ApiError::Validation("Query parameter q is required".to_string()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    if !(1..=MAX_LEADS_PER_REQUEST).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LEADS_PER_REQUEST
        )));
    }

    let client = state.lead_client()?;
    let contacts = leads::search_for_user(
        &state.pool,
        &state.billing.ledger,
        client,
        &auth_user.user_id,
        q,
        limit,
        "api",
    )
    .await?;

    tracing::info!(user_id = %auth_user.user_id, returned = contacts.len(), "Leads API search");
    Ok(Json(LeadsResponse {
        count: contacts.len(),
        leads: contacts,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateLeadsRequest {
    pub contacts: Vec<Contact>,
}

/// Import contacts; only new ones are charged
pub async fn create_leads(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CreateLeadsRequest>,
) -> ApiResult<(StatusCode, Json<LeadsResponse>)> {
    if request.contacts.len() > MAX_LEADS_PER_REQUEST as usize {
        return Err(ApiError::Validation(format!(
            "At most {} contacts per request",
            MAX_LEADS_PER_REQUEST
        )));
    }

    let created = leads::create_for_user(
        &state.pool,
        &state.billing.ledger,
        &auth_user.user_id,
        request.contacts,
    )
    .await?;

    tracing::info!(user_id = %auth_user.user_id, created = created.len(), "Leads API import");
    Ok((
        StatusCode::CREATED,
        Json(LeadsResponse {
            count: created.len(),
            leads: created,
        }),
    ))
}

// =============================================================================
// Saved search (bearer)
// =============================================================================

#[derive(Debug, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SavedSearch {
    pub query: String,
    pub daily_limit: i64,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSearchResponse {
    pub search: Option<SavedSearch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSearchRequest {
    pub query: String,
    #[serde(default)]
    pub daily_limit: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub async fn get_saved_search(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SavedSearchResponse>> {
    let search: Option<SavedSearch> = sqlx::query_as(
        "SELECT query, daily_limit, enabled, last_run_at FROM lead_searches WHERE user_id = $1",
    )
    .bind(&auth_user.user_id)
    .fetch_optional(&state.pool)
    .await?;

    Ok(Json(SavedSearchResponse { search }))
}

pub async fn save_search(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<SaveSearchRequest>,
) -> ApiResult<Json<SavedSearchResponse>> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(ApiError::Validation("query is required".to_string()));
    }
    let daily_limit = request.daily_limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    if !(1..=MAX_LEADS_PER_REQUEST).contains(&daily_limit) {
        return Err(ApiError::Validation(format!(
            "dailyLimit must be between 1 and {}",
            MAX_LEADS_PER_REQUEST
        )));
    }

    let search: SavedSearch = sqlx::query_as(
        r#"
        INSERT INTO lead_searches (user_id, query, daily_limit, enabled)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id) DO UPDATE
        SET query = EXCLUDED.query,
            daily_limit = EXCLUDED.daily_limit,
            enabled = EXCLUDED.enabled
        RETURNING query, daily_limit, enabled, last_run_at
        "#,
    )
    .bind(&auth_user.user_id)
    .bind(query)
    .bind(daily_limit)
    .bind(request.enabled.unwrap_or(true))
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %auth_user.user_id, daily_limit, "Saved lead search updated");
    Ok(Json(SavedSearchResponse {
        search: Some(search),
    }))
}

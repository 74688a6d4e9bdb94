//! Leads API key management

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{ApiKeyManager, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_ACTIVE_KEYS: i64 = 10;

#[derive(Debug, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyListResponse {
    pub api_keys: Vec<ApiKeySummary>,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
}

/// The plaintext key is only ever returned here
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key: String,
    pub key_prefix: String,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ApiKeyListResponse>> {
    let api_keys: Vec<ApiKeySummary> = sqlx::query_as(
        r#"
        SELECT id, name, last_used_at, created_at
        FROM api_keys
        WHERE user_id = $1 AND revoked_at IS NULL
        ORDER BY created_at DESC
        "#,
    )
    .bind(&auth_user.user_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(ApiKeyListResponse { api_keys }))
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CreateApiKeyRequest>,
) -> ApiResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    let name = request.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::Validation(
            "Key name must be 1-100 characters".to_string(),
        ));
    }

    let account = state.billing.ledger.account(&auth_user.user_id).await?;
    if !account.tier.limits().features.api_access {
        return Err(ApiError::Forbidden(format!(
            "API access is not included in the {} plan",
            account.tier
        )));
    }

    let active: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM api_keys WHERE user_id = $1 AND revoked_at IS NULL",
    )
    .bind(&auth_user.user_id)
    .fetch_one(&state.pool)
    .await?;
    if active >= MAX_ACTIVE_KEYS {
        return Err(ApiError::Conflict(format!(
            "At most {} active API keys are allowed",
            MAX_ACTIVE_KEYS
        )));
    }

    let key = state.api_key_manager.generate_key();
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO api_keys (id, user_id, name, key_hash) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(&auth_user.user_id)
        .bind(name)
        .bind(state.api_key_manager.hash_key(&key))
        .execute(&state.pool)
        .await?;

    let key_prefix = ApiKeyManager::display_prefix(&key).to_string();
    tracing::info!(user_id = %auth_user.user_id, key_id = %id, key_prefix = %key_prefix, "API key created");

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id,
            name: name.to_string(),
            key,
            key_prefix,
        }),
    ))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let result = sqlx::query(
        r#"
        UPDATE api_keys SET revoked_at = NOW()
        WHERE id = $1 AND user_id = $2 AND revoked_at IS NULL
        "#,
    )
    .bind(id)
    .bind(&auth_user.user_id)
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound(format!("API key {}", id)));
    }

    tracing::info!(user_id = %auth_user.user_id, key_id = %id, "API key revoked");
    Ok(StatusCode::NO_CONTENT)
}

//! Email template routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_BLOCKS: usize = 200;
const TEMPLATE_STATUSES: [&str; 2] = ["draft", "published"];

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: Uuid,
    #[serde(skip)]
    pub user_id: String,
    pub name: String,
    pub blocks: Value,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct TemplateListResponse {
    pub templates: Vec<Template>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub blocks: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    pub name: Option<String>,
    pub blocks: Option<Value>,
    pub status: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Blocks are a JSON array of objects, each with a string `type`
pub fn validate_blocks(blocks: &Value) -> ApiResult<()> {
    let Some(items) = blocks.as_array() else {
        return Err(ApiError::Validation("blocks must be an array".to_string()));
    };
    if items.len() > MAX_BLOCKS {
        return Err(ApiError::Validation(format!(
            "A template holds at most {} blocks",
            MAX_BLOCKS
        )));
    }
    for (i, block) in items.iter().enumerate() {
        let has_type = block
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| !t.is_empty());
        if !has_type {
            return Err(ApiError::Validation(format!(
                "Block {} is missing a type",
                i
            )));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> ApiResult<&str> {
    let name = name.trim();
    if name.is_empty() || name.len() > 200 {
        return Err(ApiError::Validation(
            "Template name must be 1-200 characters".to_string(),
        ));
    }
    Ok(name)
}

async fn owned_template(pool: &PgPool, user_id: &str, id: Uuid) -> ApiResult<Template> {
    let template: Template = sqlx::query_as(
        r#"
        SELECT id, user_id, name, blocks, status, last_modified, created_at
        FROM templates WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("Template {}", id)))?;

    if template.user_id != user_id {
        return Err(ApiError::Forbidden("Not your template".to_string()));
    }
    Ok(template)
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn list_templates(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<TemplateListResponse>> {
    let templates: Vec<Template> = sqlx::query_as(
        r#"
        SELECT id, user_id, name, blocks, status, last_modified, created_at
        FROM templates
        WHERE user_id = $1
        ORDER BY last_modified DESC
        "#,
    )
    .bind(&auth_user.user_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(TemplateListResponse { templates }))
}

pub async fn get_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Template>> {
    let template = owned_template(&state.pool, &auth_user.user_id, id).await?;
    Ok(Json(template))
}

pub async fn create_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CreateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let name = validate_name(&request.name)?;
    let blocks = request.blocks.unwrap_or_else(|| Value::Array(Vec::new()));
    validate_blocks(&blocks)?;

    let template: Template = sqlx::query_as(
        r#"
        INSERT INTO templates (id, user_id, name, blocks)
        VALUES ($1, $2, $3, $4)
        RETURNING id, user_id, name, blocks, status, last_modified, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&auth_user.user_id)
    .bind(name)
    .bind(&blocks)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %auth_user.user_id, template_id = %template.id, "Template created");
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn update_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateTemplateRequest>,
) -> ApiResult<Json<Template>> {
    let existing = owned_template(&state.pool, &auth_user.user_id, id).await?;

    let name = match &request.name {
        Some(name) => validate_name(name)?.to_string(),
        None => existing.name,
    };
    let blocks = match request.blocks {
        Some(blocks) => {
            validate_blocks(&blocks)?;
            blocks
        }
        None => existing.blocks,
    };
    let status = match request.status {
        Some(status) if TEMPLATE_STATUSES.contains(&status.as_str()) => status,
        Some(status) => {
            return Err(ApiError::Validation(format!(
                "Unknown template status: {}",
                status
            )))
        }
        None => existing.status,
    };

    let template: Template = sqlx::query_as(
        r#"
        UPDATE templates
        SET name = $2, blocks = $3, status = $4, last_modified = NOW()
        WHERE id = $1
        RETURNING id, user_id, name, blocks, status, last_modified, created_at
        "#,
    )
    .bind(id)
    .bind(&name)
    .bind(&blocks)
    .bind(&status)
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(template))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    owned_template(&state.pool, &auth_user.user_id, id).await?;

    sqlx::query("DELETE FROM templates WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?;

    tracing::info!(user_id = %auth_user.user_id, template_id = %id, "Template deleted");
    Ok(StatusCode::NO_CONTENT)
}

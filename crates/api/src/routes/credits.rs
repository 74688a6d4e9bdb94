//! Credit balance, log and admin grant routes

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shipmail_billing::{CreditBalances, CreditLogEntry, CreditSource, ExtraCreditGrant};
use shipmail_shared::{CreditAmounts, CreditType};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_LOG_LIMIT: i64 = 50;

pub async fn get_balances(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<CreditBalances>> {
    let balances = state.billing.ledger.balances(&auth_user.user_id).await?;
    Ok(Json(balances))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreditLogsResponse {
    pub logs: Vec<CreditLogEntry>,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<CreditLogsResponse>> {
    let logs = state
        .billing
        .ledger
        .credit_logs(&auth_user.user_id, query.limit.unwrap_or(DEFAULT_LOG_LIMIT))
        .await?;
    Ok(Json(CreditLogsResponse { logs }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreditsRequest {
    pub user_id: String,
    pub credit_type: String,
    pub amount: i64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreditsResponse {
    pub grants: Vec<ExtraCreditGrant>,
    pub balances: CreditBalances,
}

/// Admin-only: add extra credits to any account
pub async fn grant_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<GrantCreditsRequest>,
) -> ApiResult<Json<GrantCreditsResponse>> {
    auth_user.require_admin()?;

    let credit_type: CreditType = request
        .credit_type
        .parse()
        .map_err(|e: shipmail_shared::ParseEnumError| ApiError::Validation(e.to_string()))?;
    let source = match request.source.as_deref() {
        Some(source) => source.parse::<CreditSource>()?,
        None => CreditSource::Admin,
    };

    let ledger = &state.billing.ledger;
    let grants = ledger
        .grant(
            &request.user_id,
            &CreditAmounts::single(credit_type, request.amount),
            source,
            request.reference.clone(),
            json!({ "grantedBy": auth_user.user_id }),
        )
        .await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        user_id = %request.user_id,
        credit_type = %credit_type,
        amount = request.amount,
        "Admin granted credits"
    );

    let balances = ledger.balances(&request.user_id).await?;
    Ok(Json(GrantCreditsResponse { grants, balances }))
}

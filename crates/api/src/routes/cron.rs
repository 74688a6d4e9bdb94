//! Scheduler hooks
//!
//! The same jobs the worker runs, exposed for external schedulers.

use axum::{extract::State, Json};
use time::OffsetDateTime;

use crate::{
    campaigns::{self, DispatchSummary},
    error::ApiResult,
    leads::{self, DailyFetchSummary},
    state::AppState,
};

const DISPATCH_BATCH: i64 = 100;

pub async fn fetch_leads(State(state): State<AppState>) -> ApiResult<Json<DailyFetchSummary>> {
    let client = state.lead_client()?;
    let summary = leads::run_daily_fetch(&state.pool, &state.billing.ledger, client).await?;
    Ok(Json(summary))
}

pub async fn process_campaigns(
    State(state): State<AppState>,
) -> ApiResult<Json<DispatchSummary>> {
    let summary = campaigns::dispatch_due(
        &state.pool,
        &state.billing.ledger,
        OffsetDateTime::now_utc(),
        DISPATCH_BATCH,
    )
    .await?;
    Ok(Json(summary))
}

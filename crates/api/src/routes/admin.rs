//! Admin routes
//!
//! Guarded by the `admin` role claim on the caller's token.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use shipmail_billing::{CreditBalances, InvariantCheckSummary, InvariantChecker};
use shipmail_shared::{SubscriptionStatus, SubscriptionTier};

use crate::{
    auth::AuthUser,
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SetTierRequest {
    pub tier: SubscriptionTier,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
}

pub async fn set_user_tier(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(user_id): Path<String>,
    Json(request): Json<SetTierRequest>,
) -> ApiResult<Json<CreditBalances>> {
    auth_user.require_admin()?;

    let status = request.status.unwrap_or(SubscriptionStatus::Active);
    let snapshot = state
        .billing
        .ledger
        .set_tier(&user_id, request.tier, status)
        .await?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        user_id = %user_id,
        tier = %request.tier,
        status = %status,
        "Admin changed subscription tier"
    );
    Ok(Json(snapshot.balances()))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Run one named check instead of all of them
    pub check: Option<String>,
}

pub async fn check_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    auth_user.require_admin()?;

    let checker = InvariantChecker::new(state.pool.clone());
    let summary = match query.check.as_deref() {
        Some(name) => checker.run_named_check(name).await?,
        None => checker.run_all_checks().await?,
    };

    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Invariant check found violations"
        );
    }
    Ok(Json(summary))
}

//! Payment verification routes

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::{Deserialize, Serialize};
use shipmail_billing::{
    CreditBalances, CreditPlan, CryptoInvoice, PaymentMethod, PaymentOutcome, Settlement, PLANS,
};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub transaction_id: String,
    pub payment_method: String,
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentResponse {
    /// `granted`, `already_settled` or `pending`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<String>,
    pub balances: CreditBalances,
}

/// Verify a client-reported payment with its provider and grant the plan's
/// credits once
pub async fn verify_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<VerifyPaymentRequest>,
) -> ApiResult<Json<VerifyPaymentResponse>> {
    let transaction_id = request.transaction_id.trim();
    if transaction_id.is_empty() {
        return Err(ApiError::Validation("transactionId is required".to_string()));
    }
    let method: PaymentMethod = request.payment_method.parse()?;

    let outcome = state
        .billing
        .payments
        .verify_and_settle(&auth_user.user_id, method, transaction_id, &request.plan_id)
        .await?;

    let (status, provider_status) = match outcome {
        PaymentOutcome::Settled(Settlement::Granted(_)) => ("granted", None),
        PaymentOutcome::Settled(Settlement::AlreadySettled) => ("already_settled", None),
        PaymentOutcome::Pending { provider_status } => ("pending", Some(provider_status)),
    };

    tracing::info!(
        user_id = %auth_user.user_id,
        payment_method = %method,
        transaction_id = %transaction_id,
        plan_id = %request.plan_id,
        status,
        "Payment verification handled"
    );

    let balances = state.billing.ledger.balances(&auth_user.user_id).await?;
    Ok(Json(VerifyPaymentResponse {
        status,
        provider_status,
        balances,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoInvoiceRequest {
    pub plan_id: String,
}

pub async fn create_crypto_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<CryptoInvoiceRequest>,
) -> ApiResult<Json<CryptoInvoice>> {
    let invoice = state
        .billing
        .create_crypto_invoice(&auth_user.user_id, &request.plan_id)
        .await?;
    tracing::info!(
        user_id = %auth_user.user_id,
        plan_id = %request.plan_id,
        invoice_id = %invoice.invoice_id,
        "Crypto invoice created"
    );
    Ok(Json(invoice))
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: &'static [CreditPlan],
}

pub async fn list_plans() -> Json<PlansResponse> {
    Json(PlansResponse { plans: &PLANS })
}

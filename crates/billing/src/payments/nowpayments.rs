//! Crypto payments through NOWPayments
//!
//! Payments are looked up by id with `GET /v1/payment/{id}`; checkout starts
//! from an invoice whose `order_id` ties the payment to a user and plan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    order_reference, provider_http_client, provider_status_error, with_retry, CreditPlan,
    PaymentMethod, PaymentState, PaymentVerifier, VerifiedPayment, PLAN_CURRENCY,
};
use crate::error::BillingResult;

pub const NOWPAYMENTS_API_BASE: &str = "https://api.nowpayments.io";

#[derive(Debug, Clone)]
pub struct NowPaymentsConfig {
    pub api_key: String,
    pub api_base: String,
    /// Where NOWPayments posts IPN callbacks
    pub ipn_callback_url: Option<String>,
}

/// Map a NOWPayments `payment_status`
pub fn payment_state(status: &str) -> PaymentState {
    match status {
        "finished" | "confirmed" => PaymentState::Verified,
        "failed" | "expired" | "refunded" => PaymentState::Failed,
        // waiting, confirming, sending, partially_paid
        _ => PaymentState::Pending,
    }
}

/// NOWPayments ids arrive as numbers in some payloads and strings in others
pub fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
struct PaymentStatusResponse {
    payment_id: serde_json::Value,
    payment_status: String,
    price_amount: f64,
    price_currency: String,
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceRequest {
    pub price_amount: f64,
    pub price_currency: String,
    pub order_id: String,
    pub order_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipn_callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
}

impl InvoiceRequest {
    pub fn for_plan(user_id: &str, plan: &CreditPlan) -> Self {
        Self {
            price_amount: plan.price_cents as f64 / 100.0,
            price_currency: PLAN_CURRENCY.to_string(),
            order_id: order_reference(user_id, plan.id),
            order_description: plan.name.to_string(),
            ipn_callback_url: None,
            success_url: None,
            cancel_url: None,
        }
    }
}

#[derive(Deserialize)]
struct InvoiceResponse {
    id: serde_json::Value,
    invoice_url: String,
    order_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoInvoice {
    pub invoice_id: String,
    pub invoice_url: String,
    pub order_id: String,
}

pub struct NowPaymentsClient {
    http: reqwest::Client,
    config: NowPaymentsConfig,
}

impl NowPaymentsClient {
    pub fn new(config: NowPaymentsConfig) -> BillingResult<Self> {
        Ok(Self {
            http: provider_http_client()?,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn fetch_payment(&self, payment_id: &str) -> BillingResult<PaymentStatusResponse> {
        let response = self
            .http
            .get(self.url(&format!("/v1/payment/{}", payment_id)))
            .header("x-api-key", &self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_status_error("nowpayments", status, &body));
        }
        Ok(response.json().await?)
    }

    /// Create a hosted invoice for `plan` on behalf of `user_id`
    pub async fn create_invoice(&self, user_id: &str, plan: &CreditPlan) -> BillingResult<CryptoInvoice> {
        let mut request = InvoiceRequest::for_plan(user_id, plan);
        request.ipn_callback_url = self.config.ipn_callback_url.clone();

        let response = self
            .http
            .post(self.url("/v1/invoice"))
            .header("x-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_status_error("nowpayments", status, &body));
        }
        let invoice: InvoiceResponse = response.json().await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            order_id = %invoice.order_id,
            "Created crypto invoice"
        );

        Ok(CryptoInvoice {
            invoice_id: id_string(&invoice.id).unwrap_or_default(),
            invoice_url: invoice.invoice_url,
            order_id: invoice.order_id,
        })
    }
}

#[async_trait]
impl PaymentVerifier for NowPaymentsClient {
    async fn verify(&self, transaction_id: &str) -> BillingResult<VerifiedPayment> {
        let payment = with_retry(|| self.fetch_payment(transaction_id)).await?;

        Ok(VerifiedPayment {
            method: PaymentMethod::Crypto,
            transaction_id: id_string(&payment.payment_id)
                .unwrap_or_else(|| transaction_id.to_string()),
            state: payment_state(&payment.payment_status),
            provider_status: payment.payment_status,
            amount_cents: (payment.price_amount * 100.0).round() as i64,
            currency: payment.price_currency.to_ascii_lowercase(),
            order_id: payment.order_id,
        })
    }
}

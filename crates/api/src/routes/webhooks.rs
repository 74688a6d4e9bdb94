//! Provider callbacks
//!
//! None of these routes use bearer auth. Payment callbacks are verified by
//! signature inside the billing crate; delivery events carry a shared secret.

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use shipmail_billing::{Settlement, WebhookDisposition};

use crate::{
    auth::middleware::secret_matches,
    campaigns::{self, DeliveryEvent},
    error::{ApiError, ApiResult},
    state::AppState,
};

const CARD_SIGNATURE_HEADER: &str = "stripe-signature";
const CRYPTO_SIGNATURE_HEADER: &str = "x-nowpayments-sig";
const EMAIL_WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub result: &'static str,
}

impl From<&WebhookDisposition> for WebhookAck {
    fn from(disposition: &WebhookDisposition) -> Self {
        let result = match disposition {
            WebhookDisposition::Duplicate => "duplicate",
            WebhookDisposition::Ignored => "ignored",
            WebhookDisposition::Recorded => "recorded",
            WebhookDisposition::Settled(Settlement::Granted(_)) => "granted",
            WebhookDisposition::Settled(Settlement::AlreadySettled) => "already_settled",
        };
        Self {
            received: true,
            result,
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> ApiResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation(format!("Missing {} header", name)))
}

pub async fn card_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = header(&headers, CARD_SIGNATURE_HEADER)?;
    let disposition = state
        .billing
        .webhooks
        .handle_card_event(&body, signature)
        .await?;
    tracing::info!(disposition = ?disposition, "Card webhook processed");
    Ok(Json(WebhookAck::from(&disposition)))
}

pub async fn crypto_ipn(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let signature = header(&headers, CRYPTO_SIGNATURE_HEADER)?;
    let disposition = state
        .billing
        .webhooks
        .handle_crypto_ipn(&body, signature)
        .await?;
    tracing::info!(disposition = ?disposition, "Crypto IPN processed");
    Ok(Json(WebhookAck::from(&disposition)))
}

/// One delivery event or a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DeliveryEvents {
    Batch(Vec<DeliveryEvent>),
    Single(DeliveryEvent),
}

#[derive(Debug, Serialize)]
pub struct DeliveryEventsAck {
    pub applied: usize,
    pub duplicates: usize,
}

pub async fn email_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DeliveryEvents>,
) -> ApiResult<Json<DeliveryEventsAck>> {
    let provided = headers
        .get(EMAIL_WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    let authorized = match provided {
        Some(provided) => secret_matches(provided, state.config.email_webhook_secret.as_deref()),
        None => false,
    };
    if !authorized {
        tracing::warn!("Rejected delivery webhook with bad secret");
        return Err(ApiError::Unauthorized);
    }

    let events = match payload {
        DeliveryEvents::Batch(events) => events,
        DeliveryEvents::Single(event) => vec![event],
    };

    let mut ack = DeliveryEventsAck {
        applied: 0,
        duplicates: 0,
    };
    for event in &events {
        if campaigns::apply_delivery_event(&state.pool, event).await? {
            ack.applied += 1;
        } else {
            ack.duplicates += 1;
        }
    }

    tracing::debug!(
        applied = ack.applied,
        duplicates = ack.duplicates,
        "Delivery events processed"
    );
    Ok(Json(ack))
}

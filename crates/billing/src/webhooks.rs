//! Payment provider webhooks
//!
//! Card events arrive Stripe-signed (`t=...,v1=...`, HMAC-SHA256 over
//! `"{t}.{payload}"`); crypto IPN callbacks carry `x-nowpayments-sig`, an
//! HMAC-SHA512 of the body re-serialized with sorted keys.
//!
//! Each event is claimed in the webhook event store before processing, so a
//! provider redelivering the same event never settles it twice.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{Settlement, WebhookEventStore, WebhookOutcome};
use crate::payments::nowpayments::{id_string, payment_state};
use crate::payments::{
    find_plan, order_reference, parse_order_reference, PaymentMethod, PaymentService, PaymentState,
    VerifiedPayment,
};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Maximum age of a signed card webhook
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in processing this long may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

pub const CARD_PROVIDER: &str = "stripe";
pub const CRYPTO_PROVIDER: &str = "nowpayments";

/// Verify a Stripe-style signature header against `payload`
pub fn verify_card_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(computed.as_bytes().ct_eq(sig.as_bytes())));
    if !matched {
        tracing::warn!("Card webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Sign `payload` the way a Stripe-style sender does
pub fn sign_card_payload(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| BillingError::Config(format!("invalid webhook secret: {}", e)))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Copy of `value` with every object's keys in sorted order, at any depth
fn sorted_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sorted_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sorted_keys).collect())
        }
        other => other.clone(),
    }
}

/// HMAC-SHA512 of the IPN body with object keys sorted
pub fn crypto_signature(body: &serde_json::Value, secret: &str) -> BillingResult<String> {
    let canonical = serde_json::to_string(&sorted_keys(body))
        .map_err(|e| BillingError::InvalidInput(format!("unserializable IPN body: {}", e)))?;
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("invalid IPN secret: {}", e)))?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_crypto_signature(
    body: &serde_json::Value,
    signature: &str,
    secret: &str,
) -> BillingResult<()> {
    let computed = crypto_signature(body, secret)?;
    let received = signature.trim().to_ascii_lowercase();
    if bool::from(computed.as_bytes().ct_eq(received.as_bytes())) {
        Ok(())
    } else {
        tracing::warn!("Crypto IPN signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

#[derive(Debug, Deserialize)]
struct CardEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: CardEventData,
}

#[derive(Debug, Deserialize)]
struct CardEventData {
    object: PaymentIntentObject,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    #[serde(default)]
    id: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CryptoIpn {
    payment_id: serde_json::Value,
    payment_status: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    price_amount: f64,
    #[serde(default)]
    price_currency: String,
}

/// What happened to a delivered webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// Already claimed by an earlier delivery
    Duplicate,
    /// Valid event with nothing to do
    Ignored,
    /// Status recorded, no credits granted yet
    Recorded,
    Settled(Settlement),
}

#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub card: Option<String>,
    pub crypto: Option<String>,
}

/// Verifies, de-duplicates and applies provider webhooks
#[derive(Clone)]
pub struct WebhookHandler {
    payments: PaymentService,
    events: Arc<dyn WebhookEventStore>,
    secrets: WebhookSecrets,
}

impl WebhookHandler {
    pub fn new(
        payments: PaymentService,
        events: Arc<dyn WebhookEventStore>,
        secrets: WebhookSecrets,
    ) -> Self {
        Self {
            payments,
            events,
            secrets,
        }
    }

    /// Handle a card processor event
    pub async fn handle_card_event(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let secret = self
            .secrets
            .card
            .as_deref()
            .ok_or(BillingError::ProviderNotConfigured("card webhook"))?;
        verify_card_signature(payload, signature, secret, OffsetDateTime::now_utc().unix_timestamp())?;

        let event: CardEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("malformed card event: {}", e)))?;

        if !self
            .claim(CARD_PROVIDER, &event.id, &event.event_type)
            .await?
        {
            return Ok(WebhookDisposition::Duplicate);
        }

        let result = self.process_card_event(&event).await;
        self.finish(CARD_PROVIDER, &event.id, &result).await;
        result
    }

    async fn process_card_event(&self, event: &CardEvent) -> BillingResult<WebhookDisposition> {
        if event.event_type != "payment_intent.succeeded" {
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Ignoring card event");
            return Ok(WebhookDisposition::Ignored);
        }

        let intent = &event.data.object;
        let (Some(user_id), Some(plan_id)) =
            (intent.metadata.get("user_id"), intent.metadata.get("plan_id"))
        else {
            tracing::warn!(
                event_id = %event.id,
                payment_intent = %intent.id,
                "Succeeded payment without user_id/plan_id metadata"
            );
            return Ok(WebhookDisposition::Ignored);
        };

        let plan = find_plan(plan_id)?;
        let payment = VerifiedPayment {
            method: PaymentMethod::Card,
            transaction_id: intent.id.clone(),
            state: PaymentState::Verified,
            provider_status: "succeeded".to_string(),
            amount_cents: intent.amount,
            currency: intent.currency.clone(),
            order_id: Some(order_reference(user_id, plan_id)),
        };
        let settlement = self.payments.settle(user_id, plan, &payment).await?;
        Ok(WebhookDisposition::Settled(settlement))
    }

    /// Handle a crypto processor IPN callback
    pub async fn handle_crypto_ipn(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let secret = self
            .secrets
            .crypto
            .as_deref()
            .ok_or(BillingError::ProviderNotConfigured("crypto webhook"))?;

        let body: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("malformed IPN body: {}", e)))?;
        verify_crypto_signature(&body, signature, secret)?;

        let ipn: CryptoIpn = serde_json::from_value(body)
            .map_err(|e| BillingError::InvalidInput(format!("malformed IPN body: {}", e)))?;
        let payment_id = id_string(&ipn.payment_id)
            .ok_or_else(|| BillingError::InvalidInput("IPN without payment_id".to_string()))?;

        // A payment reports several statuses over its life; each one is its
        // own event.
        let event_id = format!("{}:{}", payment_id, ipn.payment_status);
        if !self
            .claim(CRYPTO_PROVIDER, &event_id, &ipn.payment_status)
            .await?
        {
            return Ok(WebhookDisposition::Duplicate);
        }

        let result = self.process_crypto_ipn(&payment_id, &ipn).await;
        self.finish(CRYPTO_PROVIDER, &event_id, &result).await;
        result
    }

    async fn process_crypto_ipn(
        &self,
        payment_id: &str,
        ipn: &CryptoIpn,
    ) -> BillingResult<WebhookDisposition> {
        let order_id = ipn
            .order_id
            .as_deref()
            .ok_or_else(|| BillingError::InvalidInput("IPN without order_id".to_string()))?;
        let (user_id, plan_id) = parse_order_reference(order_id)?;

        self.events
            .record_crypto_payment(
                payment_id,
                user_id,
                plan_id,
                &ipn.payment_status,
                OffsetDateTime::now_utc(),
            )
            .await?;

        // `confirmed` and `finished` both settle; the second one finds the
        // transaction already recorded.
        if payment_state(&ipn.payment_status) != PaymentState::Verified {
            tracing::info!(
                payment_id = %payment_id,
                payment_status = %ipn.payment_status,
                state = ?payment_state(&ipn.payment_status),
                "Recorded crypto payment status"
            );
            return Ok(WebhookDisposition::Recorded);
        }

        let plan = find_plan(plan_id)?;
        let payment = VerifiedPayment {
            method: PaymentMethod::Crypto,
            transaction_id: payment_id.to_string(),
            state: PaymentState::Verified,
            provider_status: ipn.payment_status.clone(),
            amount_cents: (ipn.price_amount * 100.0).round() as i64,
            currency: ipn.price_currency.clone(),
            order_id: Some(order_id.to_string()),
        };
        let settlement = self.payments.settle(user_id, plan, &payment).await?;
        Ok(WebhookDisposition::Settled(settlement))
    }

    async fn claim(&self, provider: &str, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed = self
            .events
            .claim_event(
                provider,
                event_id,
                event_type,
                PROCESSING_TIMEOUT_MINUTES,
                OffsetDateTime::now_utc(),
            )
            .await
            .inspect_err(|e| {
                tracing::error!(
                    provider = %provider,
                    event_id = %event_id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
            })?;

        if claimed {
            tracing::info!(provider = %provider, event_id = %event_id, event_type = %event_type, "Processing webhook event");
        } else {
            tracing::info!(provider = %provider, event_id = %event_id, "Duplicate webhook event");
        }
        Ok(claimed)
    }

    /// Write the processing result back, retrying once
    async fn finish(
        &self,
        provider: &str,
        event_id: &str,
        result: &BillingResult<WebhookDisposition>,
    ) {
        let (outcome, error_message) = match result {
            Ok(WebhookDisposition::Ignored) => (WebhookOutcome::Ignored, None),
            Ok(_) => (WebhookOutcome::Success, None),
            Err(e) => (WebhookOutcome::Error, Some(e.to_string())),
        };

        for attempt in 1..=2 {
            match self
                .events
                .finish_event(provider, event_id, outcome, error_message.as_deref())
                .await
            {
                Ok(()) => return,
                Err(e) if attempt == 1 => {
                    tracing::warn!(event_id = %event_id, error = %e, "Failed to record webhook result, retrying");
                }
                Err(e) => {
                    tracing::error!(
                        provider = %provider,
                        event_id = %event_id,
                        outcome = outcome.as_str(),
                        error = %e,
                        "Failed to record webhook result after retry; event stays in processing"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CreditLedger, MemoryLedgerStore};
    use crate::payments::PaymentGateway;
    use serde_json::json;
    use shipmail_shared::SubscriptionTier;

    const CARD_SECRET: &str = "whsec_test_secret";
    const IPN_SECRET: &str = "ipn-secret";

    async fn handler() -> (WebhookHandler, Arc<MemoryLedgerStore>, CreditLedger) {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = CreditLedger::new(store.clone());
        ledger
            .create_account("user-1", "owner@example.com", SubscriptionTier::Free)
            .await
            .unwrap();
        let payments = PaymentService::new(PaymentGateway::new(), ledger.clone());
        let handler = WebhookHandler::new(
            payments,
            store.clone(),
            WebhookSecrets {
                card: Some(CARD_SECRET.to_string()),
                crypto: Some(IPN_SECRET.to_string()),
            },
        );
        (handler, store, ledger)
    }

    fn succeeded_event(event_id: &str, amount: i64) -> String {
        json!({
            "id": event_id,
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_3Nabc",
                    "object": "payment_intent",
                    "amount": amount,
                    "currency": "usd",
                    "metadata": { "user_id": "user-1", "plan_id": "emails-5k" }
                }
            }
        })
        .to_string()
    }

    fn sign_now(payload: &str) -> String {
        sign_card_payload(payload, CARD_SECRET, OffsetDateTime::now_utc().unix_timestamp()).unwrap()
    }

    // =========================================================================
    // Signature verification
    // =========================================================================

    #[test]
    fn test_card_signature_round_trip() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_card_payload(payload, CARD_SECRET, 1_700_000_000).unwrap();
        assert!(verify_card_signature(payload, &header, CARD_SECRET, 1_700_000_100).is_ok());
    }

    #[test]
    fn test_card_signature_rejects_tampered_payload() {
        let header = sign_card_payload(r#"{"id":"evt_1"}"#, CARD_SECRET, 1_700_000_000).unwrap();
        let result = verify_card_signature(r#"{"id":"evt_2"}"#, &header, CARD_SECRET, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_card_signature_rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_card_payload(payload, CARD_SECRET, 1_700_000_000).unwrap();
        let result = verify_card_signature(payload, &header, CARD_SECRET, 1_700_000_301);
        assert!(result.is_err());
    }

    #[test]
    fn test_card_signature_rejects_malformed_header() {
        assert!(verify_card_signature("{}", "garbage", CARD_SECRET, 0).is_err());
        assert!(verify_card_signature("{}", "t=0", CARD_SECRET, 0).is_err());
    }

    #[test]
    fn test_crypto_signature_ignores_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"payment_status":"finished","payment_id":1}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"payment_id":1,"payment_status":"finished"}"#).unwrap();
        assert_eq!(
            crypto_signature(&a, IPN_SECRET).unwrap(),
            crypto_signature(&b, IPN_SECRET).unwrap()
        );
    }

    #[test]
    fn test_crypto_signature_sorts_nested_objects() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{"payment_id":1,"fee":{"withdrawalFee":0,"depositFee":2,"currency":"btc"}}"#,
        )
        .unwrap();
        let canonical = serde_json::to_string(&sorted_keys(&body)).unwrap();
        assert_eq!(
            canonical,
            r#"{"fee":{"currency":"btc","depositFee":2,"withdrawalFee":0},"payment_id":1}"#
        );

        let mut mac = HmacSha512::new_from_slice(IPN_SECRET.as_bytes()).unwrap();
        mac.update(canonical.as_bytes());
        assert_eq!(
            crypto_signature(&body, IPN_SECRET).unwrap(),
            hex::encode(mac.finalize().into_bytes())
        );
    }

    #[test]
    fn test_crypto_signature_mismatch() {
        let body = json!({ "payment_id": 1 });
        assert!(verify_crypto_signature(&body, "deadbeef", IPN_SECRET).is_err());
    }

    // =========================================================================
    // Card events
    // =========================================================================

    #[tokio::test]
    async fn test_succeeded_card_event_settles_once() {
        let (handler, store, ledger) = handler().await;
        let payload = succeeded_event("evt_1", 1900);

        let first = handler
            .handle_card_event(&payload, &sign_now(&payload))
            .await
            .unwrap();
        assert!(matches!(first, WebhookDisposition::Settled(Settlement::Granted(_))));

        let second = handler
            .handle_card_event(&payload, &sign_now(&payload))
            .await
            .unwrap();
        assert_eq!(second, WebhookDisposition::Duplicate);

        assert_eq!(ledger.balances("user-1").await.unwrap().emails.extra, 5000);
        assert_eq!(store.transaction_count().await, 1);
        assert_eq!(
            store.webhook_result(CARD_PROVIDER, "evt_1").await.as_deref(),
            Some("success")
        );
    }

    #[tokio::test]
    async fn test_distinct_events_for_same_intent_grant_once() {
        let (handler, _store, ledger) = handler().await;
        for event_id in ["evt_a", "evt_b"] {
            let payload = succeeded_event(event_id, 1900);
            handler
                .handle_card_event(&payload, &sign_now(&payload))
                .await
                .unwrap();
        }
        assert_eq!(ledger.balances("user-1").await.unwrap().emails.extra, 5000);
    }

    #[tokio::test]
    async fn test_other_card_events_are_ignored() {
        let (handler, store, _ledger) = handler().await;
        let payload = json!({
            "id": "evt_9",
            "type": "charge.refunded",
            "data": { "object": { "id": "ch_1" } }
        })
        .to_string();

        let result = handler
            .handle_card_event(&payload, &sign_now(&payload))
            .await
            .unwrap();
        assert_eq!(result, WebhookDisposition::Ignored);
        assert_eq!(
            store.webhook_result(CARD_PROVIDER, "evt_9").await.as_deref(),
            Some("ignored")
        );
    }

    #[tokio::test]
    async fn test_underpaid_card_event_records_error() {
        let (handler, store, ledger) = handler().await;
        let payload = succeeded_event("evt_low", 100);

        let result = handler
            .handle_card_event(&payload, &sign_now(&payload))
            .await;
        assert!(matches!(result, Err(BillingError::AmountMismatch { .. })));
        assert_eq!(ledger.balances("user-1").await.unwrap().emails.extra, 0);
        assert_eq!(
            store.webhook_result(CARD_PROVIDER, "evt_low").await.as_deref(),
            Some("error")
        );
    }

    #[tokio::test]
    async fn test_bad_signature_writes_nothing() {
        let (handler, store, _ledger) = handler().await;
        let payload = succeeded_event("evt_1", 1900);
        let result = handler.handle_card_event(&payload, "t=1,v1=00").await;
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
        assert!(store.webhook_result(CARD_PROVIDER, "evt_1").await.is_none());
    }

    // =========================================================================
    // Crypto IPN
    // =========================================================================

    fn ipn(status: &str) -> (String, String) {
        let body = json!({
            "payment_id": 5077125051u64,
            "payment_status": status,
            "order_id": "user-1:leads-500",
            "price_amount": 25,
            "price_currency": "usd",
            "pay_currency": "btc"
        });
        let signature = crypto_signature(&body, IPN_SECRET).unwrap();
        (body.to_string(), signature)
    }

    #[tokio::test]
    async fn test_finished_ipn_settles_once() {
        let (handler, store, ledger) = handler().await;
        let (payload, signature) = ipn("finished");

        let first = handler.handle_crypto_ipn(&payload, &signature).await.unwrap();
        assert!(matches!(first, WebhookDisposition::Settled(Settlement::Granted(_))));
        let second = handler.handle_crypto_ipn(&payload, &signature).await.unwrap();
        assert_eq!(second, WebhookDisposition::Duplicate);

        assert_eq!(ledger.balances("user-1").await.unwrap().leads.extra, 500);
        assert_eq!(
            store.crypto_payment_status("5077125051").await.as_deref(),
            Some("finished")
        );
    }

    #[tokio::test]
    async fn test_confirmed_ipn_settles_and_finished_grants_nothing_more() {
        let (handler, store, ledger) = handler().await;
        let (confirmed, confirmed_sig) = ipn("confirmed");
        let (finished, finished_sig) = ipn("finished");

        let first = handler.handle_crypto_ipn(&confirmed, &confirmed_sig).await.unwrap();
        assert!(matches!(first, WebhookDisposition::Settled(Settlement::Granted(_))));
        let second = handler.handle_crypto_ipn(&finished, &finished_sig).await.unwrap();
        assert_eq!(second, WebhookDisposition::Settled(Settlement::AlreadySettled));

        assert_eq!(ledger.balances("user-1").await.unwrap().leads.extra, 500);
        assert_eq!(
            store.crypto_payment_status("5077125051").await.as_deref(),
            Some("finished")
        );
    }

    #[tokio::test]
    async fn test_intermediate_ipn_only_records_status() {
        let (handler, store, ledger) = handler().await;
        let (payload, signature) = ipn("confirming");

        let result = handler.handle_crypto_ipn(&payload, &signature).await.unwrap();
        assert_eq!(result, WebhookDisposition::Recorded);
        assert_eq!(ledger.balances("user-1").await.unwrap().leads.extra, 0);
        assert_eq!(
            store.crypto_payment_status("5077125051").await.as_deref(),
            Some("confirming")
        );
    }

    #[tokio::test]
    async fn test_ipn_with_bad_signature_is_rejected() {
        let (handler, _store, _ledger) = handler().await;
        let (payload, _) = ipn("finished");
        let result = handler.handle_crypto_ipn(&payload, "00ff").await;
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_unconfigured_secret() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = CreditLedger::new(store.clone());
        let handler = WebhookHandler::new(
            PaymentService::new(PaymentGateway::new(), ledger),
            store,
            WebhookSecrets::default(),
        );
        let result = handler.handle_card_event("{}", "t=1,v1=00").await;
        assert!(matches!(result, Err(BillingError::ProviderNotConfigured(_))));
    }
}

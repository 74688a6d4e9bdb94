//! PayPal Orders API verification

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    decimal_to_cents, parse_order_reference, provider_http_client, provider_status_error,
    with_retry, PaymentMethod, PaymentState, PaymentVerifier, VerifiedPayment,
};
use crate::error::{BillingError, BillingResult};

pub const PAYPAL_LIVE_API_BASE: &str = "https://api-m.paypal.com";

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Deserialize)]
struct Order {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Deserialize)]
struct PurchaseUnit {
    amount: Money,
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    reference_id: Option<String>,
}

impl PurchaseUnit {
    /// `custom_id` carries the order reference; `reference_id` is used only when it
    /// is itself a well-formed reference, since PayPal defaults it to "default"
    fn order_reference(&self) -> Option<String> {
        self.custom_id
            .iter()
            .chain(self.reference_id.iter())
            .find(|r| parse_order_reference(r).is_ok())
            .cloned()
    }
}

#[derive(Deserialize)]
struct Money {
    currency_code: String,
    value: String,
}

fn order_state(status: &str) -> PaymentState {
    match status {
        "COMPLETED" => PaymentState::Verified,
        "VOIDED" => PaymentState::Failed,
        _ => PaymentState::Pending,
    }
}

pub struct PaypalVerifier {
    http: reqwest::Client,
    config: PaypalConfig,
}

impl PaypalVerifier {
    pub fn new(config: PaypalConfig) -> BillingResult<Self> {
        Ok(Self {
            http: provider_http_client()?,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> BillingResult<String> {
        let response = self
            .http
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_status_error("paypal", status, &body));
        }
        let token: AccessToken = response.json().await?;
        Ok(token.access_token)
    }

    async fn fetch_order(&self, order_id: &str) -> BillingResult<Order> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.url(&format!("/v2/checkout/orders/{}", order_id)))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_status_error("paypal", status, &body));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentVerifier for PaypalVerifier {
    async fn verify(&self, transaction_id: &str) -> BillingResult<VerifiedPayment> {
        let order = with_retry(|| self.fetch_order(transaction_id)).await?;

        let unit = order.purchase_units.first().ok_or_else(|| {
            BillingError::UpstreamProvider(format!("PayPal order {} has no amount", order.id))
        })?;
        let amount = &unit.amount;

        Ok(VerifiedPayment {
            method: PaymentMethod::Paypal,
            transaction_id: order.id.clone(),
            state: order_state(&order.status),
            provider_status: order.status.clone(),
            amount_cents: decimal_to_cents(&amount.value)?,
            currency: amount.currency_code.to_ascii_lowercase(),
            order_id: unit.order_reference(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::{CreditLedger, Settlement};
    use crate::payments::{PaymentGateway, PaymentOutcome, PaymentService};
    use shipmail_shared::SubscriptionTier;

    async fn verifier(server: &mockito::Server) -> PaypalVerifier {
        PaypalVerifier::new(PaypalConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            api_base: server.url(),
        })
        .unwrap()
    }

    async fn mock_token(server: &mut mockito::Server) -> mockito::Mock {
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"A21AA-token","token_type":"Bearer","expires_in":32400}"#)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_completed_order_is_verified() {
        let mut server = mockito::Server::new_async().await;
        let token = mock_token(&mut server).await;
        let order = server
            .mock("GET", "/v2/checkout/orders/5O190127TN364715T")
            .match_header("authorization", "Bearer A21AA-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "id": "5O190127TN364715T",
                    "status": "COMPLETED",
                    "purchase_units": [{
                        "reference_id": "default",
                        "custom_id": "user-1:sms-1k",
                        "amount": {"currency_code": "USD", "value": "29.00"}
                    }]
                }"#,
            )
            .create_async()
            .await;

        let payment = verifier(&server).await.verify("5O190127TN364715T").await.unwrap();
        assert_eq!(payment.state, PaymentState::Verified);
        assert_eq!(payment.amount_cents, 2900);
        assert_eq!(payment.currency, "usd");
        assert_eq!(payment.order_id.as_deref(), Some("user-1:sms-1k"));

        token.assert_async().await;
        order.assert_async().await;
    }

    #[tokio::test]
    async fn test_approved_order_is_pending() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _order = server
            .mock("GET", "/v2/checkout/orders/ORDER-2")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": "ORDER-2", "status": "APPROVED",
                    "purchase_units": [{"amount": {"currency_code": "USD", "value": "29.00"}}]}"#,
            )
            .create_async()
            .await;

        let payment = verifier(&server).await.verify("ORDER-2").await.unwrap();
        assert_eq!(payment.state, PaymentState::Pending);
    }

    #[tokio::test]
    async fn test_missing_order_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let order = server
            .mock("GET", "/v2/checkout/orders/MISSING")
            .with_status(404)
            .with_body(r#"{"name":"RESOURCE_NOT_FOUND"}"#)
            .expect(1)
            .create_async()
            .await;

        let result = verifier(&server).await.verify("MISSING").await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
        order.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let order = server
            .mock("GET", "/v2/checkout/orders/FLAKY")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let result = verifier(&server).await.verify("FLAKY").await;
        assert!(matches!(result, Err(BillingError::UpstreamProvider(_))));
        order.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_a_config_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1/oauth2/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let result = verifier(&server).await.verify("ORDER-3").await;
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    async fn settle_against(server: &mockito::Server, user_id: &str) -> BillingResult<PaymentOutcome> {
        let ledger = CreditLedger::in_memory();
        ledger
            .create_account(user_id, "owner@example.com", SubscriptionTier::Free)
            .await
            .unwrap();
        let gateway = PaymentGateway::new().with_paypal(Arc::new(verifier(server).await));
        let service = PaymentService::new(gateway, ledger.clone());
        let outcome = service
            .verify_and_settle(user_id, PaymentMethod::Paypal, "ORDER-9", "sms-1k")
            .await;
        if outcome.is_err() {
            assert_eq!(ledger.balances(user_id).await.unwrap().sms.extra, 0);
        }
        outcome
    }

    async fn mock_completed_order(server: &mut mockito::Server, unit: &str) -> mockito::Mock {
        server
            .mock("GET", "/v2/checkout/orders/ORDER-9")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(
                r#"{{"id": "ORDER-9", "status": "COMPLETED", "purchase_units": [{}]}}"#,
                unit
            ))
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_order_paid_by_another_user_is_refused() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _order = mock_completed_order(
            &mut server,
            r#"{"custom_id": "user-2:sms-1k", "amount": {"currency_code": "USD", "value": "29.00"}}"#,
        )
        .await;

        let result = settle_against(&server, "user-1").await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_order_without_reference_is_refused() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _order = mock_completed_order(
            &mut server,
            r#"{"reference_id": "default", "amount": {"currency_code": "USD", "value": "29.00"}}"#,
        )
        .await;

        let result = settle_against(&server, "user-1").await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_reference_id_binds_order_when_custom_id_absent() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _order = mock_completed_order(
            &mut server,
            r#"{"reference_id": "user-1:sms-1k", "amount": {"currency_code": "USD", "value": "29.00"}}"#,
        )
        .await;

        let outcome = settle_against(&server, "user-1").await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Settled(Settlement::Granted(_))));
    }
}

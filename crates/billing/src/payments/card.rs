//! Card payments through Stripe PaymentIntents

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{Client, PaymentIntent, PaymentIntentId, PaymentIntentStatus};

use super::{order_reference, PaymentMethod, PaymentState, PaymentVerifier, VerifiedPayment};
use crate::error::{BillingError, BillingResult};

/// Map a PaymentIntent status onto the settlement state machine
pub fn intent_state(status: &PaymentIntentStatus) -> PaymentState {
    match status {
        PaymentIntentStatus::Succeeded => PaymentState::Verified,
        PaymentIntentStatus::Canceled => PaymentState::Failed,
        PaymentIntentStatus::Processing
        | PaymentIntentStatus::RequiresAction
        | PaymentIntentStatus::RequiresCapture
        | PaymentIntentStatus::RequiresConfirmation
        | PaymentIntentStatus::RequiresPaymentMethod => PaymentState::Pending,
    }
}

/// Order reference from the `user_id` and `plan_id` metadata set at checkout
pub fn intent_order_reference(metadata: &HashMap<String, String>) -> Option<String> {
    let user_id = metadata.get("user_id").filter(|v| !v.is_empty())?;
    let plan_id = metadata.get("plan_id").filter(|v| !v.is_empty())?;
    Some(order_reference(user_id, plan_id))
}

pub struct StripeCardVerifier {
    client: Client,
}

impl StripeCardVerifier {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
        }
    }
}

#[async_trait]
impl PaymentVerifier for StripeCardVerifier {
    async fn verify(&self, transaction_id: &str) -> BillingResult<VerifiedPayment> {
        let intent_id: PaymentIntentId = transaction_id.parse().map_err(|_| {
            BillingError::InvalidInput(format!("not a PaymentIntent id: {}", transaction_id))
        })?;

        let intent = PaymentIntent::retrieve(&self.client, &intent_id, &[]).await?;

        Ok(VerifiedPayment {
            method: PaymentMethod::Card,
            transaction_id: intent.id.to_string(),
            state: intent_state(&intent.status),
            provider_status: intent.status.as_str().to_string(),
            amount_cents: intent.amount,
            currency: intent.currency.to_string(),
            order_id: intent_order_reference(&intent.metadata),
        })
    }
}

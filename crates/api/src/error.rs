//! API error type with a single status mapping for every route

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use shipmail_billing::BillingError;
use shipmail_shared::RateLimitError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    InsufficientCredits(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_seconds: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::InsufficientCredits(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Storage details stay in the logs
        let message = match &self {
            ApiError::Database(detail) => {
                tracing::error!(error = %detail, "Database error");
                "Internal server error".to_string()
            }
            ApiError::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        let mut response = (status, body).into_response();
        if let ApiError::RateLimitExceeded {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::UserNotFound(_) | BillingError::NotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            BillingError::InsufficientCredits { .. } => ApiError::InsufficientCredits(e.to_string()),
            BillingError::InvalidAmount { .. }
            | BillingError::UnknownPlan(_)
            | BillingError::AmountMismatch { .. }
            | BillingError::PaymentNotCompleted(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::InvalidInput(_) => ApiError::Validation(e.to_string()),
            BillingError::ProviderNotConfigured(provider) => {
                ApiError::NotConfigured(format!("Payment provider {}", provider))
            }
            BillingError::UpstreamProvider(msg) => ApiError::Upstream(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) => {
                tracing::error!(error = %msg, "Billing configuration error");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        tracing::error!(error = %e, "Rate limit backend failure");
        ApiError::Internal
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipmail_shared::CreditType;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_insufficient_credits_is_forbidden() {
        let err: ApiError = BillingError::InsufficientCredits {
            credit_type: CreditType::Emails,
            requested: 300,
            available: 250,
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert_eq!(body["code"], 403);
        assert!(body["error"].as_str().unwrap().contains("requested 300"));
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let response = ApiError::RateLimitExceeded {
            retry_after_seconds: 120,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");
    }

    #[tokio::test]
    async fn test_database_details_are_hidden() {
        let response = ApiError::Database("relation \"users\" does not exist".to_string())
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_billing_error_mapping() {
        let cases = [
            (BillingError::UserNotFound("u".into()), StatusCode::NOT_FOUND),
            (BillingError::UnknownPlan("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (BillingError::UpstreamProvider("down".into()), StatusCode::BAD_GATEWAY),
            (BillingError::ProviderNotConfigured("paypal"), StatusCode::SERVICE_UNAVAILABLE),
            (BillingError::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_row_not_found_maps_to_404() {
        assert_eq!(
            ApiError::from(sqlx::Error::RowNotFound).status(),
            StatusCode::NOT_FOUND
        );
    }
}

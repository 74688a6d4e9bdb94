//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use shipmail_billing::CreditLedger;
use shipmail_shared::{RateLimiter, SubscriptionTier};
use sqlx::{FromRow, PgPool};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::{
    api_key::ApiKeyManager,
    jwt::{JwtManager, ADMIN_ROLE},
};
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";
const AUTH_COOKIE: &str = "shipmail_auth_token";

/// Authenticated caller, inserted into request extensions
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub role: String,
    pub auth_method: AuthMethod,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Admin role required".to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMethod {
    Jwt,
    ApiKey { key_id: Uuid, tier: SubscriptionTier },
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub api_key_manager: ApiKeyManager,
    pub pool: PgPool,
    pub ledger: CreditLedger,
    pub rate_limiter: RateLimiter,
    pub cron_api_key: Option<String>,
    pub cron_secret: Option<String>,
}

#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: Uuid,
    user_id: String,
    email: String,
    role: String,
    subscription_tier: String,
}

fn extract_token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(AUTH_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(String::from)
            })
        })
}

/// Bearer token from the Authorization header, falling back to the auth cookie
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }
    extract_token_from_cookie(headers)
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|h| h.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("ApiKey "))
        .map(|k| k.trim().to_string())
}

/// Constant-time comparison against an optional configured secret
pub(crate) fn secret_matches(provided: &str, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => {
            provided.as_bytes().ct_eq(expected.as_bytes()).into()
        }
        _ => false,
    }
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(request.headers()) else {
        tracing::debug!(path = %path, "require_auth: no bearer token");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate_jwt(&auth_state, &token).await {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate(token)
        .map_err(|_| AuthError::InvalidToken)?;

    if claims.sub.trim().is_empty() {
        return Err(AuthError::InvalidToken);
    }

    // First request from a new identity opens its account on the free tier
    auth_state
        .ledger
        .create_account(
            &claims.sub,
            claims.email.as_deref().unwrap_or_default(),
            SubscriptionTier::Free,
        )
        .await
        .map_err(|e| {
            tracing::error!(user_id = %claims.sub, error = %e, "Failed to ensure account");
            AuthError::DatabaseError
        })?;

    Ok(AuthUser {
        role: claims.role().to_string(),
        user_id: claims.sub,
        email: claims.email,
        auth_method: AuthMethod::Jwt,
    })
}

/// Middleware for the public leads API: key lookup, tier check and the
/// per-tier daily request limit
pub async fn require_api_key(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = extract_api_key(request.headers()) else {
        return AuthError::MissingAuth.into_response();
    };

    let auth_user = match authenticate_api_key(&auth_state, &key).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(
                key_prefix = %ApiKeyManager::display_prefix(&key),
                error = ?err,
                "API key authentication failed"
            );
            return err.into_response();
        }
    };

    let AuthMethod::ApiKey { key_id, tier } = auth_user.auth_method else {
        return AuthError::InvalidApiKey.into_response();
    };

    let limits = tier.limits();
    if !limits.features.api_access {
        return ApiError::Forbidden(format!("API access is not included in the {} plan", tier))
            .into_response();
    }

    let rate_key = leads_api_rate_key(&key_id);
    match auth_state
        .rate_limiter
        .check_daily(&rate_key, limits.lead_api_requests_per_day)
        .await
    {
        Ok(result) if result.allowed => {}
        Ok(result) => {
            tracing::info!(
                user_id = %auth_user.user_id,
                key_id = %key_id,
                limit = result.limit,
                "Leads API daily limit reached"
            );
            return ApiError::RateLimitExceeded {
                retry_after_seconds: result.retry_after_seconds.unwrap_or(60),
            }
            .into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    }

    request.extensions_mut().insert(auth_user);
    next.run(request).await
}

/// Daily leads API counter, one per API key
fn leads_api_rate_key(key_id: &Uuid) -> String {
    format!("leads-api:{}", key_id)
}

async fn authenticate_api_key(auth_state: &AuthState, key: &str) -> Result<AuthUser, AuthError> {
    if !auth_state.api_key_manager.is_well_formed(key) {
        return Err(AuthError::InvalidApiKey);
    }
    let key_hash = auth_state.api_key_manager.hash_key(key);

    let row: ApiKeyRow = sqlx::query_as(
        r#"
        SELECT k.id, k.user_id, u.email, u.role, u.subscription_tier
        FROM api_keys k
        JOIN users u ON u.id = k.user_id
        WHERE k.key_hash = $1 AND k.revoked_at IS NULL
        "#,
    )
    .bind(&key_hash)
    .fetch_optional(&auth_state.pool)
    .await
    .map_err(|_| AuthError::DatabaseError)?
    .ok_or(AuthError::InvalidApiKey)?;

    let tier: SubscriptionTier = row
        .subscription_tier
        .parse()
        .map_err(|e| AuthError::Internal(format!("{}", e)))?;

    // Update last used timestamp (fire and forget)
    let pool = auth_state.pool.clone();
    let key_id = row.id;
    tokio::spawn(async move {
        let _ = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&pool)
            .await;
    });

    Ok(AuthUser {
        user_id: row.user_id,
        email: Some(row.email),
        role: row.role,
        auth_method: AuthMethod::ApiKey {
            key_id: row.id,
            tier,
        },
    })
}

/// Middleware for scheduler hooks: `x-api-key: $CRON_API_KEY` or
/// `Authorization: Bearer $CRON_SECRET`
pub async fn require_cron(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();

    let by_key = headers
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|key| secret_matches(key, auth_state.cron_api_key.as_deref()))
        .unwrap_or(false);

    let by_secret = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|token| secret_matches(token, auth_state.cron_secret.as_deref()))
        .unwrap_or(false);

    if by_key || by_secret {
        next.run(request).await
    } else {
        tracing::warn!(path = %request.uri().path(), "Rejected cron request");
        AuthError::InvalidCronCredentials.into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Invalid cron credentials")]
    InvalidCronCredentials,
    #[error("Database error")]
    DatabaseError,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "Invalid API key"),
            AuthError::InvalidCronCredentials => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            AuthError::DatabaseError | AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_api_key_has_its_own_daily_counter() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_ne!(leads_api_rate_key(&first), leads_api_rate_key(&second));
        assert_eq!(leads_api_rate_key(&first), format!("leads-api:{}", first));
    }
}

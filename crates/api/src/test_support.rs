//! Shared fixtures for router and middleware tests
//!
//! Builds an `AppState` over the in-memory ledger, an in-process rate-limit
//! counter and a lazily connected pool, so requests that never reach SQL run
//! without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response, Router};
use shipmail_billing::{BillingService, MemoryLedgerStore};
use shipmail_shared::{CounterStore, RateLimitError, RateLimiter};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tower::ServiceExt;

use crate::{
    auth::{jwt::ADMIN_ROLE, Claims},
    config::Config,
    routes::create_router,
    state::AppState,
};

pub const CRON_API_KEY: &str = "cron-key-for-tests";
pub const CRON_SECRET: &str = "cron-secret-for-tests";
pub const EMAIL_WEBHOOK_SECRET: &str = "email-hook-secret";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";

#[derive(Default)]
pub struct MapCounterStore {
    counts: Mutex<HashMap<(String, i64), i64>>,
}

#[async_trait]
impl CounterStore for MapCounterStore {
    async fn increment(
        &self,
        key: &str,
        window_start: OffsetDateTime,
        _window: Duration,
    ) -> Result<i64, RateLimitError> {
        let mut counts = self.counts.lock().await;
        let count = counts
            .entry((key.to_string(), window_start.unix_timestamp()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

pub fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("DATABASE_URL", "postgres://localhost/shipmail_test"),
        ("JWT_SECRET", "test-jwt-secret-key-for-testing-only"),
        ("API_KEY_HMAC_SECRET", "test-api-key-secret-for-testing"),
        ("CRON_API_KEY", CRON_API_KEY),
        ("CRON_SECRET", CRON_SECRET),
        ("EMAIL_WEBHOOK_SECRET", EMAIL_WEBHOOK_SECRET),
        ("STRIPE_WEBHOOK_SECRET", STRIPE_WEBHOOK_SECRET),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(move |name| vars.get(name).cloned()).expect("test config")
}

/// App state over the in-memory ledger; the returned store allows seeding
pub fn test_state(config: Config) -> (AppState, Arc<MemoryLedgerStore>) {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_lazy(&config.database_url)
        .expect("lazy pool");
    let (billing, store) =
        BillingService::in_memory(config.billing_config()).expect("in-memory billing");
    let rate_limiter = RateLimiter::new(Arc::new(MapCounterStore::default()));
    let state = AppState::from_parts(pool, config, billing, rate_limiter, None);
    (state, store)
}

pub fn bearer_token(state: &AppState, user_id: &str, role: Option<&str>) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        email: Some(format!("{}@store.example", user_id)),
        role: role.map(str::to_string),
        exp: (OffsetDateTime::now_utc() + time::Duration::hours(1)).unix_timestamp(),
        iat: Some(OffsetDateTime::now_utc().unix_timestamp()),
    };
    state.jwt_manager.issue(&claims).expect("token")
}

pub fn admin_token(state: &AppState, user_id: &str) -> String {
    bearer_token(state, user_id, Some(ADMIN_ROLE))
}

pub async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.expect("infallible")
}

pub fn app(state: &AppState) -> Router {
    create_router(state.clone())
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

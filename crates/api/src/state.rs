//! Application state

use std::sync::Arc;

use shipmail_billing::BillingService;
use shipmail_shared::RateLimiter;
use sqlx::PgPool;

use crate::{
    auth::{ApiKeyManager, AuthState, JwtManager},
    config::Config,
    error::{ApiError, ApiResult},
    leads::LeadSearchClient,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub api_key_manager: ApiKeyManager,
    pub billing: BillingService,
    /// Counters for the leads API daily limit (Redis or `api_usage`)
    pub rate_limiter: RateLimiter,
    /// Contact search provider; `None` when `LEADS_API_KEY` is unset
    pub leads: Option<Arc<LeadSearchClient>>,
}

impl AppState {
    /// Wire up Postgres-backed billing, the rate limiter and provider clients
    pub async fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::new(pool.clone(), config.billing_config())?;

        let rate_limiter = match &config.redis_url {
            Some(url) => {
                let limiter = RateLimiter::redis(url).await?;
                tracing::info!("Rate limiter using Redis");
                limiter
            }
            None => {
                tracing::info!("Rate limiter using api_usage table (REDIS_URL not set)");
                RateLimiter::postgres(pool.clone())
            }
        };

        let leads = match &config.leads_api_key {
            Some(key) => Some(Arc::new(LeadSearchClient::new(
                key.clone(),
                config.leads_api_base.clone(),
            )?)),
            None => {
                tracing::warn!("Lead search disabled (missing LEADS_API_KEY)");
                None
            }
        };

        if config.cron_api_key.is_none() && config.cron_secret.is_none() {
            tracing::warn!("Cron routes disabled (missing CRON_API_KEY and CRON_SECRET)");
        }

        Ok(Self::from_parts(pool, config, billing, rate_limiter, leads))
    }

    pub fn from_parts(
        pool: PgPool,
        config: Config,
        billing: BillingService,
        rate_limiter: RateLimiter,
        leads: Option<Arc<LeadSearchClient>>,
    ) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret),
            api_key_manager: ApiKeyManager::new(&config.api_key_hmac_secret),
            pool,
            config,
            billing,
            rate_limiter,
            leads,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            api_key_manager: self.api_key_manager.clone(),
            pool: self.pool.clone(),
            ledger: self.billing.ledger.clone(),
            rate_limiter: self.rate_limiter.clone(),
            cron_api_key: self.config.cron_api_key.clone(),
            cron_secret: self.config.cron_secret.clone(),
        }
    }

    pub fn lead_client(&self) -> ApiResult<&LeadSearchClient> {
        self.leads
            .as_deref()
            .ok_or_else(|| ApiError::NotConfigured("Lead search".to_string()))
    }
}

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shipmail shared library
//!
//! Domain types, database helpers and the shared-store rate limiter used by
//! the API server, the billing crate and the background worker.

pub mod db;
pub mod rate_limit;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use rate_limit::{
    CounterStore, PgCounterStore, RateLimitError, RateLimitResult, RateLimiter, RedisCounterStore,
};
pub use types::{
    CampaignChannel, CampaignStatus, CreditAmounts, CreditType, ParseEnumError,
    SubscriptionStatus, SubscriptionTier, TierFeatures, TierLimits,
};

//! Shipmail Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription renewal resets (every 15 minutes)
//! - Scheduled campaign dispatch (every minute)
//! - Daily lead fetch for saved searches (06:00 UTC)
//! - Ledger invariant sweep (hourly)
//! - Rate-limit counter cleanup (daily at 3:00 AM UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shipmail_api::leads::{LeadSearchClient, DEFAULT_LEADS_API_BASE};
use shipmail_billing::CreditLedger;
use shipmail_shared::{create_pool, PgCounterStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Shipmail Worker");

    let database_url = optional_env("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let ledger = CreditLedger::postgres(pool.clone());

    let lead_client = match optional_env("LEADS_API_KEY") {
        Some(key) => {
            let base = optional_env("LEADS_API_BASE")
                .unwrap_or_else(|| DEFAULT_LEADS_API_BASE.to_string());
            Some(Arc::new(LeadSearchClient::new(key, base)?))
        }
        None => {
            warn!("LEADS_API_KEY not set - daily lead fetch disabled");
            None
        }
    };

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Subscription renewals (every 15 minutes)
    let renewal_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let ledger = renewal_ledger.clone();
            Box::pin(async move {
                jobs::renew_subscriptions(&ledger).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Subscription renewals (every 15 minutes)");

    // Job 2: Start scheduled campaigns (every minute)
    let dispatch_pool = pool.clone();
    let dispatch_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let pool = dispatch_pool.clone();
            let ledger = dispatch_ledger.clone();
            Box::pin(async move {
                jobs::dispatch_campaigns(&pool, &ledger).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Campaign dispatch (every minute)");

    // Job 3: Daily lead fetch (06:00 UTC)
    if let Some(client) = lead_client {
        let fetch_pool = pool.clone();
        let fetch_ledger = ledger.clone();
        scheduler
            .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
                let pool = fetch_pool.clone();
                let ledger = fetch_ledger.clone();
                let client = client.clone();
                Box::pin(async move {
                    info!("Running daily lead fetch");
                    jobs::fetch_leads(&pool, &ledger, &client).await;
                })
            })?)
            .await?;
        job_count += 1;
        info!("Scheduled: Daily lead fetch (06:00 UTC)");
    }

    // Job 4: Ledger invariant sweep (hourly)
    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let pool = invariant_pool.clone();
            Box::pin(async move {
                jobs::sweep_invariants(&pool).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Invariant sweep (hourly)");

    // Job 5: Rate-limit counter cleanup (daily at 3:00 AM UTC)
    let counter_store = Arc::new(PgCounterStore::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let store = counter_store.clone();
            Box::pin(async move {
                jobs::purge_usage_counters(&store).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Rate-limit counter cleanup (daily at 3:00 AM UTC)");

    // Job 6: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    job_count += 1;

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Shipmail Worker started successfully with {} scheduled jobs",
        job_count
    );

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

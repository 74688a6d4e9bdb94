//! HTTP routes

pub mod admin;
pub mod api_keys;
pub mod campaigns;
pub mod credits;
pub mod cron;
pub mod leads;
pub mod payments;
pub mod stats;
pub mod templates;
pub mod webhooks;


use axum::{
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_api_key, require_auth, require_cron},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Bearer-token routes
    let user_routes = Router::new()
        .route("/api/user/stats", get(stats::user_stats))
        .route("/api/credits", get(credits::get_balances))
        .route("/api/credits/logs", get(credits::get_logs))
        .route("/api/credits/purchase", post(credits::grant_credits))
        .route("/api/payments/verify", post(payments::verify_payment))
        .route(
            "/api/payments/crypto/invoice",
            post(payments::create_crypto_invoice),
        )
        .route("/api/payments/plans", get(payments::list_plans))
        .route(
            "/api/templates",
            get(templates::list_templates).post(templates::create_template),
        )
        .route(
            "/api/templates/{id}",
            get(templates::get_template)
                .put(templates::update_template)
                .delete(templates::delete_template),
        )
        .route(
            "/api/campaigns",
            get(campaigns::list_campaigns).post(campaigns::create_campaign),
        )
        .route(
            "/api/campaigns/{id}",
            get(campaigns::get_campaign).delete(campaigns::delete_campaign),
        )
        .route(
            "/api/campaigns/{id}/status",
            post(campaigns::update_campaign_status),
        )
        .route("/api/campaigns/{id}/send", post(campaigns::send_campaign))
        .route(
            "/api/api-keys",
            get(api_keys::list_api_keys).post(api_keys::create_api_key),
        )
        .route(
            "/api/api-keys/{id}",
            axum::routing::delete(api_keys::revoke_api_key),
        )
        .route(
            "/api/lead-search",
            get(leads::get_saved_search).put(leads::save_search),
        )
        .route("/api/admin/users/{id}/tier", put(admin::set_user_tier))
        .route("/api/admin/invariants", get(admin::check_invariants))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    // Public leads API
    let api_key_routes = Router::new()
        .route(
            "/api/v1/leads",
            get(leads::search_leads).post(leads::create_leads),
        )
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_api_key,
        ));

    // Scheduler hooks
    let cron_routes = Router::new()
        .route("/api/cron/fetchLeads", get(cron::fetch_leads))
        .route("/api/cron/daily-lead-fetch", get(cron::fetch_leads))
        .route("/api/cron/process-campaigns", post(cron::process_campaigns))
        .layer(middleware::from_fn_with_state(auth_state, require_cron));

    // Signed or secret-authenticated callbacks
    let webhook_routes = Router::new()
        .route("/api/payment-webhook", post(webhooks::card_webhook))
        .route("/api/webhooks/crypto-payment", post(webhooks::crypto_ipn))
        .route("/api/webhooks/email-events", post(webhooks::email_events));

    Router::new()
        .route("/health", get(health))
        .merge(user_routes)
        .merge(api_key_routes)
        .merge(cron_routes)
        .merge(webhook_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

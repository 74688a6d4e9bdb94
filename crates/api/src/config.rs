//! Configuration loaded from the environment

use shipmail_billing::{BillingConfig, NowPaymentsConfig, PaypalConfig};

use crate::leads::DEFAULT_LEADS_API_BASE;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct connection for migrations when the main URL goes through a pooler
    pub database_direct_url: Option<String>,
    pub run_migrations: bool,
    pub bind_address: String,
    pub jwt_secret: String,
    pub api_key_hmac_secret: String,
    pub redis_url: Option<String>,
    pub cron_api_key: Option<String>,
    pub cron_secret: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    pub paypal_api_base: String,
    pub nowpayments_api_key: Option<String>,
    pub nowpayments_ipn_secret: Option<String>,
    pub nowpayments_api_base: String,
    pub nowpayments_ipn_callback_url: Option<String>,
    pub leads_api_key: Option<String>,
    pub leads_api_base: String,
    pub email_webhook_secret: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Read so deployments sharing one env file start cleanly; not used here
    pub resend_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let optional = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| optional(name).ok_or(ConfigError::Missing(name));

        let run_migrations = match optional("RUN_MIGRATIONS") {
            Some(v) => v.parse::<bool>().map_err(|e| ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                reason: e.to_string(),
            })?,
            None => true,
        };

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: optional("DATABASE_DIRECT_URL"),
            run_migrations,
            bind_address: optional("BIND_ADDRESS")
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            jwt_secret: required("JWT_SECRET")?,
            api_key_hmac_secret: required("API_KEY_HMAC_SECRET")?,
            redis_url: optional("REDIS_URL"),
            cron_api_key: optional("CRON_API_KEY"),
            cron_secret: optional("CRON_SECRET"),
            stripe_secret_key: optional("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: optional("STRIPE_WEBHOOK_SECRET"),
            paypal_client_id: optional("PAYPAL_CLIENT_ID"),
            paypal_client_secret: optional("PAYPAL_CLIENT_SECRET"),
            paypal_api_base: optional("PAYPAL_API_BASE")
                .unwrap_or_else(|| shipmail_billing::payments::paypal::PAYPAL_LIVE_API_BASE.to_string()),
            nowpayments_api_key: optional("NOWPAYMENTS_API_KEY"),
            nowpayments_ipn_secret: optional("NOWPAYMENTS_IPN_SECRET"),
            nowpayments_api_base: optional("NOWPAYMENTS_API_BASE").unwrap_or_else(|| {
                shipmail_billing::payments::nowpayments::NOWPAYMENTS_API_BASE.to_string()
            }),
            nowpayments_ipn_callback_url: optional("NOWPAYMENTS_IPN_CALLBACK_URL"),
            leads_api_key: optional("LEADS_API_KEY"),
            leads_api_base: optional("LEADS_API_BASE")
                .unwrap_or_else(|| DEFAULT_LEADS_API_BASE.to_string()),
            email_webhook_secret: optional("EMAIL_WEBHOOK_SECRET"),
            allowed_origins,
            resend_api_key: optional("RESEND_API_KEY"),
            openai_api_key: optional("OPENAI_API_KEY"),
        })
    }

    /// Provider settings for the billing crate
    pub fn billing_config(&self) -> BillingConfig {
        let paypal = match (&self.paypal_client_id, &self.paypal_client_secret) {
            (Some(client_id), Some(client_secret)) => Some(PaypalConfig {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                api_base: self.paypal_api_base.clone(),
            }),
            _ => None,
        };

        let nowpayments = self.nowpayments_api_key.as_ref().map(|api_key| NowPaymentsConfig {
            api_key: api_key.clone(),
            api_base: self.nowpayments_api_base.clone(),
            ipn_callback_url: self.nowpayments_ipn_callback_url.clone(),
        });

        BillingConfig {
            stripe_secret_key: self.stripe_secret_key.clone(),
            stripe_webhook_secret: self.stripe_webhook_secret.clone(),
            paypal,
            nowpayments,
            nowpayments_ipn_secret: self.nowpayments_ipn_secret.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("DATABASE_URL", "postgres://localhost/shipmail"),
        ("JWT_SECRET", "jwt-secret"),
        ("API_KEY_HMAC_SECRET", "hmac-secret"),
    ];

    #[test]
    fn test_missing_required_value_fails_fast() {
        let err = Config::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("API_KEY_HMAC_SECRET")));
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.run_migrations);
        assert_eq!(config.allowed_origins.len(), 2);
        assert!(config.redis_url.is_none());

        let billing = config.billing_config();
        assert!(billing.paypal.is_none());
        assert!(billing.nowpayments.is_none());
    }

    #[test]
    fn test_blank_values_are_unset() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("REDIS_URL", "  "));
        vars.push(("CRON_SECRET", ""));
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert!(config.redis_url.is_none());
        assert!(config.cron_secret.is_none());
    }

    #[test]
    fn test_paypal_needs_both_credentials() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("PAYPAL_CLIENT_ID", "client"));
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        assert!(config.billing_config().paypal.is_none());

        vars.push(("PAYPAL_CLIENT_SECRET", "secret"));
        vars.push(("PAYPAL_API_BASE", "https://api-m.sandbox.paypal.com"));
        let config = Config::from_lookup(lookup(&vars)).unwrap();
        let paypal = config.billing_config().paypal.unwrap();
        assert_eq!(paypal.api_base, "https://api-m.sandbox.paypal.com");
    }

    #[test]
    fn test_invalid_bool_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RUN_MIGRATIONS", "sometimes"));
        let err = Config::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RUN_MIGRATIONS", .. }));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        for (k, v) in REQUIRED {
            std::env::set_var(k, v);
        }
        std::env::set_var("ALLOWED_ORIGINS", "https://app.shipmail.io, https://shipmail.io");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://app.shipmail.io", "https://shipmail.io"]
        );

        std::env::remove_var("ALLOWED_ORIGINS");
        for (k, _) in REQUIRED {
            std::env::remove_var(k);
        }
    }
}

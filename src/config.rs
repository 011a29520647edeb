use std::time::Duration;

use secrecy::Secret;
use serde::Deserialize;

use crate::services::certificate::CompanyInfo;
use crate::services::notifier::{DispatcherLimits, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // Printed on certificates and email footers
    pub company_name: String,
    pub company_address: Option<String>,
    pub company_phone: Option<String>,
    pub company_email: Option<String>,
    pub company_website: Option<String>,
    pub currency_symbol: String,
    pub company_logo_path: Option<String>,

    // Mail API; emails are only logged when unset
    pub mail_api_url: Option<String>,
    pub mail_api_token: Option<Secret<String>>,
    pub mail_from: String,

    // Notification worker
    pub notification_queue_capacity: usize,
    pub notification_max_in_flight: usize,
    pub notification_delivered_history: usize,
    pub notification_failed_history: usize,
    pub notification_max_attempts: u32,
    pub notification_initial_backoff_ms: u64,
    pub notification_max_backoff_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Self::from_source(&config)
    }

    fn from_source(config: &config::Config) -> Result<Self, config::ConfigError> {
        let mail_api_url: Option<String> = config.get("mail_api_url").ok();
        if let Some(url) = &mail_api_url {
            url::Url::parse(url).map_err(|e| {
                config::ConfigError::Message(format!("mail_api_url is not a valid URL: {}", e))
            })?;
        }

        Ok(Self {
            database_url: config.get("database_url")?,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port")?,

            company_name: config.get("company_name")?,
            company_address: config.get("company_address").ok(),
            company_phone: config.get("company_phone").ok(),
            company_email: config.get("company_email").ok(),
            company_website: config.get("company_website").ok(),
            currency_symbol: config
                .get("currency_symbol")
                .unwrap_or_else(|_| "$".to_string()),
            company_logo_path: config.get("company_logo_path").ok(),

            mail_api_url,
            mail_api_token: config
                .get::<String>("mail_api_token")
                .ok()
                .map(Secret::new),
            mail_from: config
                .get("mail_from")
                .unwrap_or_else(|_| "no-reply@localhost".to_string()),

            notification_queue_capacity: config.get("notification_queue_capacity").unwrap_or(256),
            notification_max_in_flight: config.get("notification_max_in_flight").unwrap_or(16),
            notification_delivered_history: config
                .get("notification_delivered_history")
                .unwrap_or(10_000),
            notification_failed_history: config
                .get("notification_failed_history")
                .unwrap_or(1_000),
            notification_max_attempts: config.get("notification_max_attempts").unwrap_or(5),
            notification_initial_backoff_ms: config
                .get("notification_initial_backoff_ms")
                .unwrap_or(500),
            notification_max_backoff_ms: config
                .get("notification_max_backoff_ms")
                .unwrap_or(30_000),
        })
    }

    /// Company details for certificates and emails. The logo is read by the
    /// caller so a missing file can be reported at startup.
    pub fn company_info(&self, logo_png: Option<Vec<u8>>) -> CompanyInfo {
        CompanyInfo {
            name: self.company_name.clone(),
            address: self.company_address.clone(),
            phone: self.company_phone.clone(),
            email: self.company_email.clone(),
            website: self.company_website.clone(),
            currency_symbol: self.currency_symbol.clone(),
            logo_png,
        }
    }

    pub fn dispatcher_limits(&self) -> DispatcherLimits {
        DispatcherLimits {
            queue_capacity: self.notification_queue_capacity,
            max_in_flight: self.notification_max_in_flight,
            delivered_history: self.notification_delivered_history,
            failed_history: self.notification_failed_history,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notification_max_attempts,
            initial_backoff: Duration::from_millis(self.notification_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.notification_max_backoff_ms),
        }
    }
}

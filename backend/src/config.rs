use anyhow::anyhow;
use chrono_tz::Tz;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::chat::ChatConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiration_hours: u64,
    pub bind_addr: String,
    pub billing_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub free_trial_enabled: bool,
    pub free_trial_secs: u64,
    pub disconnect_grace_secs: u64,
    pub time_zone: Tz,
    pub financial_year_start_month: u32,
    pub billing_starts_on_join: bool,
    pub push_webhook_url: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set"))?;

        let jwt_secret = env::var("JWT_SECRET")
            .unwrap_or_else(|_| "your-secret-key-change-this-in-production".to_string());

        let time_zone_name = env::var("APP_TIMEZONE").unwrap_or_else(|_| "Asia/Kolkata".to_string());
        let time_zone: Tz = time_zone_name
            .parse()
            .map_err(|_| anyhow!("Invalid APP_TIMEZONE value: {}", time_zone_name))?;

        let financial_year_start_month = env_or("FINANCIAL_YEAR_START_MONTH", 4u32);
        if !(1..=12).contains(&financial_year_start_month) {
            return Err(anyhow!(
                "FINANCIAL_YEAR_START_MONTH must be 1-12, got {}",
                financial_year_start_month
            ));
        }

        let billing_interval_secs = env_or("BILLING_INTERVAL_SECS", 60u64);
        if billing_interval_secs == 0 {
            return Err(anyhow!("BILLING_INTERVAL_SECS must be positive"));
        }

        let push_webhook_url = env::var("PUSH_WEBHOOK_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        Ok(Config {
            database_url,
            jwt_secret,
            jwt_expiration_hours: env_or("JWT_EXPIRATION_HOURS", 12),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            billing_interval_secs,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", 30),
            free_trial_enabled: env_or("FREE_TRIAL_ENABLED", true),
            free_trial_secs: env_or("FREE_TRIAL_SECS", 300),
            disconnect_grace_secs: env_or("DISCONNECT_GRACE_SECS", 60),
            time_zone,
            financial_year_start_month,
            billing_starts_on_join: env_or("BILLING_STARTS_ON_JOIN", false),
            push_webhook_url,
        })
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            billing_interval: Duration::from_secs(self.billing_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            free_trial_enabled: self.free_trial_enabled,
            free_trial_duration: Duration::from_secs(self.free_trial_secs),
            disconnect_grace: Duration::from_secs(self.disconnect_grace_secs),
            time_zone: self.time_zone,
            financial_year_start_month: self.financial_year_start_month,
            billing_starts_on_join: self.billing_starts_on_join,
        }
    }
}

//! Business settings lookup with defaults.

use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};

use crate::models::settings::BillingSettings;

#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Current settings. Missing or unreadable values fall back to defaults,
    /// so this never fails.
    async fn current(&self) -> BillingSettings;
}

/// Reads the `app_settings` key/value table on every call.
#[derive(Clone)]
pub struct PgSettingsProvider {
    pool: PgPool,
}

impl PgSettingsProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsProvider for PgSettingsProvider {
    async fn current(&self) -> BillingSettings {
        let mut settings = BillingSettings::default();
        let rows = match sqlx::query("SELECT key, value FROM app_settings")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load app settings, using defaults");
                return settings;
            }
        };
        for row in rows {
            let (Ok(key), Ok(value)) = (row.try_get::<String, _>("key"), row.try_get::<String, _>("value"))
            else {
                continue;
            };
            apply_setting(&mut settings, &key, &value);
        }
        settings
    }
}

/// In-process settings, adjustable at runtime.
#[derive(Default)]
pub struct FixedSettings {
    inner: RwLock<BillingSettings>,
}

impl FixedSettings {
    pub fn new(settings: BillingSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn set(&self, settings: BillingSettings) {
        *self.inner.write() = settings;
    }
}

#[async_trait]
impl SettingsProvider for FixedSettings {
    async fn current(&self) -> BillingSettings {
        self.inner.read().clone()
    }
}

/// Applies one stored key/value pair. Unknown keys are ignored; negative or
/// unparsable values keep the default.
pub fn apply_setting(settings: &mut BillingSettings, key: &str, value: &str) {
    let slot = match key {
        "bonus_usage_percent" => &mut settings.bonus_usage_percent,
        "commission_percent" => &mut settings.commission_percent,
        "tax_threshold" => &mut settings.tax_threshold,
        "tax_rate_percent" => &mut settings.tax_rate_percent,
        "min_balance_to_maintain" => &mut settings.min_balance_to_maintain,
        _ => return,
    };
    match Decimal::from_str(value.trim()) {
        Ok(parsed) if parsed >= Decimal::ZERO => *slot = parsed,
        _ => tracing::warn!(key, value, "Ignoring invalid app setting"),
    }
}

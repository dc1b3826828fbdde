//! Service configuration
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | HTTP_PORT | 8080 | HTTP listen port |
//! | STORE_BACKEND | redis | `redis` or `memory` |
//! | REDIS_URL | redis://127.0.0.1:6379 | Redis connection |
//! | GATEWAY_TIMEOUT_MS | 10000 | Bound on one storefront call |
//! | STOREFRONT_API_VERSION | 2024-01 | Storefront GraphQL version |
//! | REVENUE_ACCRUAL | redirect | `redirect` or `confirmed` |
//! | RESET_UTC_OFFSET_MINUTES | 0 | Timezone of the revenue day |
//! | DAILY_RESET_INTERVAL_SECS | 300 | Daily reset sweep period |
//! | RECONCILE_INTERVAL_SECS | 3600 | Reconciliation period, 0 disables |
//! | CAS_MAX_ATTEMPTS | 5 | Compare-and-swap attempts before failing |

use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use tracing::warn;

/// Which persistence adapter backs the repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// When revenue counts toward the daily cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevenueAccrual {
    /// Cart total counted as soon as a checkout is created
    OnRedirect,
    /// Counted when the order webhook confirms payment
    OnConfirmation,
}

impl FromStr for RevenueAccrual {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redirect" => Ok(RevenueAccrual::OnRedirect),
            "confirmed" | "confirmation" => Ok(RevenueAccrual::OnConfirmation),
            other => Err(format!("unknown revenue accrual '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub gateway_timeout_ms: u64,
    pub storefront_api_version: String,
    pub revenue_accrual: RevenueAccrual,
    pub reset_utc_offset_minutes: i32,
    pub daily_reset_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    pub cas_max_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables, defaults otherwise
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_port: env_parse("HTTP_PORT", defaults.http_port),
            store_backend: env_enum("STORE_BACKEND", defaults.store_backend),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            gateway_timeout_ms: env_parse("GATEWAY_TIMEOUT_MS", defaults.gateway_timeout_ms),
            storefront_api_version: std::env::var("STOREFRONT_API_VERSION")
                .unwrap_or(defaults.storefront_api_version),
            revenue_accrual: env_enum("REVENUE_ACCRUAL", defaults.revenue_accrual),
            reset_utc_offset_minutes: env_parse(
                "RESET_UTC_OFFSET_MINUTES",
                defaults.reset_utc_offset_minutes,
            ),
            daily_reset_interval_secs: env_parse(
                "DAILY_RESET_INTERVAL_SECS",
                defaults.daily_reset_interval_secs,
            ),
            reconcile_interval_secs: env_parse(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
            cas_max_attempts: env_parse("CAS_MAX_ATTEMPTS", defaults.cas_max_attempts).max(1),
        }
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    /// Reference timezone of the revenue day. Out-of-range offsets fall back to UTC.
    pub fn reset_timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.reset_utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            store_backend: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            gateway_timeout_ms: 10_000,
            storefront_api_version: "2024-01".to_string(),
            revenue_accrual: RevenueAccrual::OnRedirect,
            reset_utc_offset_minutes: 0,
            daily_reset_interval_secs: 300,
            reconcile_interval_secs: 3600,
            cas_max_attempts: 5,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_enum<T: FromStr<Err = String>>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|err: String| {
            warn!(key, error = %err, "Falling back to default");
            default
        }),
        Err(_) => default,
    }
}

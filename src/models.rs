//! Domain models and data structures
//!
//! This module contains all the core data types used throughout the application.
//! Apart from the small counter transitions on [`RevenueCounters`], these are
//! plain data structures without business logic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Target shop id recorded on a log when no target could be selected
pub const UNKNOWN_TARGET: &str = "unknown";

/// Access credential placeholder returned by the admin API
pub const MASKED_CREDENTIAL: &str = "***";

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

/// How the rotation engine picks a target among the eligible shops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RotationMode {
    #[default]
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "weighted")]
    Weighted,
    #[serde(rename = "manual")]
    Manual,
}

impl RotationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationMode::RoundRobin => "round-robin",
            RotationMode::Weighted => "weighted",
            RotationMode::Manual => "manual",
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(RotationMode::RoundRobin),
            "weighted" => Ok(RotationMode::Weighted),
            "manual" => Ok(RotationMode::Manual),
            other => Err(format!("unknown rotation mode '{}'", other)),
        }
    }
}

/// Singleton rotation record
///
/// `current_index` is an unbounded counter; the modulo is applied when a
/// selection is made so that the eligible set may change between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RotationState {
    pub mode: RotationMode,
    #[serde(rename = "currentIndex")]
    pub current_index: u64,
}

// ---------------------------------------------------------------------------
// Target shops
// ---------------------------------------------------------------------------

/// A storefront that can receive redirected checkouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetShop {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub access_token: String,
    pub active: bool,
    pub weight: u32,
    pub daily_revenue_limit: Option<Decimal>,
    pub current_revenue: Decimal,
    pub daily_revenue: Decimal,
    pub last_reset_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; compare-and-swap token
    pub revision: u64,
}

impl TargetShop {
    pub fn counters(&self) -> RevenueCounters {
        RevenueCounters {
            active: self.active,
            current_revenue: self.current_revenue,
            daily_revenue: self.daily_revenue,
            last_reset_date: self.last_reset_date,
        }
    }

    /// Copy of this shop carrying `counters`, one revision ahead
    pub fn with_counters(&self, counters: RevenueCounters, now: DateTime<Utc>) -> TargetShop {
        TargetShop {
            active: counters.active,
            current_revenue: counters.current_revenue,
            daily_revenue: counters.daily_revenue,
            last_reset_date: counters.last_reset_date,
            updated_at: now,
            revision: self.revision + 1,
            ..self.clone()
        }
    }

    /// Generic cart page used when no checkout could be created
    pub fn fallback_cart_url(&self) -> String {
        format!("https://{}/cart", self.domain)
    }
}

/// The mutable accounting slice of a [`TargetShop`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RevenueCounters {
    pub active: bool,
    pub current_revenue: Decimal,
    pub daily_revenue: Decimal,
    pub last_reset_date: DateTime<Utc>,
}

impl RevenueCounters {
    /// Zero the daily counter when `now` falls on a later calendar day than
    /// the last reset. Returns whether a reset happened.
    pub fn reset_if_new_day(&mut self, now: DateTime<Utc>, tz: FixedOffset) -> bool {
        if calendar_day(self.last_reset_date, tz) == calendar_day(now, tz) {
            return false;
        }
        self.daily_revenue = Decimal::ZERO;
        self.last_reset_date = now;
        true
    }

    pub fn accrue(&mut self, daily: Decimal, lifetime: Decimal) {
        self.daily_revenue = self.daily_revenue.saturating_add(daily);
        self.current_revenue = self.current_revenue.saturating_add(lifetime);
    }

    /// Give back a daily share reserved earlier, never below zero
    pub fn release(&mut self, daily: Decimal) {
        self.daily_revenue = self.daily_revenue.saturating_sub(daily).max(Decimal::ZERO);
    }

    /// Whether the shop may take another cart: active and still under `limit`
    pub fn admits(&self, limit: Option<Decimal>) -> bool {
        self.active && limit.is_none_or(|limit| self.daily_revenue < limit)
    }

    /// Deactivate when the daily revenue has reached `limit`.
    /// Returns true only when this call flipped the shop to inactive.
    pub fn enforce_limit(&mut self, limit: Option<Decimal>) -> bool {
        match limit {
            Some(limit) if self.active && self.daily_revenue >= limit => {
                self.active = false;
                true
            }
            _ => false,
        }
    }
}

/// Calendar day of `ts` in the reference timezone
pub fn calendar_day(ts: DateTime<Utc>, tz: FixedOffset) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// Admin payload for registering a target shop
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewTargetShop {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[serde(alias = "shopifyDomain")]
    #[validate(length(min = 1, message = "domain is required"))]
    pub domain: String,
    #[validate(length(min = 1, message = "accessToken is required"))]
    pub access_token: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default, alias = "revenueLimit")]
    pub daily_revenue_limit: Option<Decimal>,
}

fn default_weight() -> i64 {
    1
}

/// Partial update of a target shop. `dailyRevenueLimit: null` clears the limit.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetShopPatch {
    pub name: Option<String>,
    #[serde(alias = "shopifyDomain")]
    pub domain: Option<String>,
    pub access_token: Option<String>,
    #[serde(alias = "isActive")]
    pub active: Option<bool>,
    pub weight: Option<i64>,
    #[serde(default, alias = "revenueLimit", deserialize_with = "double_option")]
    pub daily_revenue_limit: Option<Option<Decimal>>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<Decimal>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Decimal>::deserialize(deserializer).map(Some)
}

/// Target shop as exposed by the admin API, credential masked
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetShopView {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub access_token: &'static str,
    pub active: bool,
    pub weight: u32,
    pub daily_revenue_limit: Option<Decimal>,
    pub current_revenue: Decimal,
    pub daily_revenue: Decimal,
    pub last_reset_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TargetShop> for TargetShopView {
    fn from(shop: TargetShop) -> Self {
        Self {
            id: shop.id,
            name: shop.name,
            domain: shop.domain,
            access_token: MASKED_CREDENTIAL,
            active: shop.active,
            weight: shop.weight,
            daily_revenue_limit: shop.daily_revenue_limit,
            current_revenue: shop.current_revenue,
            daily_revenue: shop.daily_revenue,
            last_reset_date: shop.last_reset_date,
            created_at: shop.created_at,
            updated_at: shop.updated_at,
        }
    }
}

/// Public summary of a selected target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub id: String,
    pub name: String,
    pub domain: String,
}

impl From<&TargetShop> for TargetSummary {
    fn from(shop: &TargetShop) -> Self {
        Self {
            id: shop.id.clone(),
            name: shop.name.clone(),
            domain: shop.domain.clone(),
        }
    }
}

/// Shop deactivated by a limit sweep
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitDeactivation {
    pub shop_id: String,
    pub shop_name: String,
    pub daily_revenue: Decimal,
    pub limit: Decimal,
}

// ---------------------------------------------------------------------------
// Source shops
// ---------------------------------------------------------------------------

/// A storefront whose checkout button is intercepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceShop {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub api_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewSourceShop {
    #[validate(length(min = 1, message = "name is required"))]
    pub name: String,
    #[serde(alias = "shopifyDomain")]
    #[validate(length(min = 1, message = "domain is required"))]
    pub domain: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceShopPatch {
    pub name: Option<String>,
    #[serde(alias = "isActive")]
    pub active: Option<bool>,
}

// ---------------------------------------------------------------------------
// Cart and redirect logs
// ---------------------------------------------------------------------------

/// One cart line as sent by the storefront script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    #[validate(length(min = 1, message = "variantId is required"))]
    pub variant_id: String,
    #[validate(range(min = 1, message = "quantity must be positive"))]
    pub quantity: i64,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl CartItem {
    /// `None` on overflow
    pub fn line_total(&self) -> Option<Decimal> {
        self.price.checked_mul(Decimal::from(self.quantity))
    }
}

/// Sum of price x quantity over the cart lines, `None` on overflow
pub fn cart_total(items: &[CartItem]) -> Option<Decimal> {
    items
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.line_total()?))
}

/// Redirect request from the storefront script
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectRequest {
    #[serde(alias = "shopId")]
    pub source_key: String,
    pub cart_items: Vec<CartItem>,
}

/// Successful gateway answer for a cart
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutReference {
    pub cart_id: String,
    pub checkout_url: String,
}

impl CheckoutReference {
    /// Cart token carried by later order webhooks (`cart_token`)
    pub fn cart_token(&self) -> String {
        let tail = self
            .cart_id
            .rsplit_once('/')
            .map(|(_, tail)| tail)
            .unwrap_or(&self.cart_id);
        tail.split('?').next().unwrap_or(tail).to_string()
    }
}

/// Log entry to append for a redirect attempt
#[derive(Debug, Clone)]
pub struct NewRedirectLog {
    pub source_shop_id: String,
    pub target_shop_id: String,
    pub cart_total: Decimal,
    pub cart_items: Vec<CartItem>,
    pub success: bool,
    pub checkout_url: Option<String>,
    pub cart_token: Option<String>,
    pub error_message: Option<String>,
}

/// One redirect attempt, finalized later by checkout confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectLog {
    pub id: String,
    pub source_shop_id: String,
    pub target_shop_id: String,
    pub cart_total: Decimal,
    pub cart_items: Vec<CartItem>,
    pub success: bool,
    pub completed: bool,
    pub checkout_url: Option<String>,
    pub cart_token: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub order_id: Option<String>,
    /// Revenue reserved, gateway answer not recorded yet
    #[serde(default)]
    pub in_flight: bool,
}

impl RedirectLog {
    pub fn from_new(id: String, log: NewRedirectLog, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            source_shop_id: log.source_shop_id,
            target_shop_id: log.target_shop_id,
            cart_total: log.cart_total,
            cart_items: log.cart_items,
            success: log.success,
            completed: false,
            checkout_url: log.checkout_url,
            cart_token: log.cart_token,
            error_message: log.error_message,
            created_at,
            completed_at: None,
            order_id: None,
            in_flight: false,
        }
    }

    /// Log opened when a target accepts a cart, before the gateway call.
    /// Counts as a successful redirect until settled otherwise.
    pub fn reserved(
        id: String,
        source_shop_id: &str,
        target_shop_id: &str,
        cart_total: Decimal,
        cart_items: Vec<CartItem>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut log = Self::from_new(
            id,
            NewRedirectLog {
                source_shop_id: source_shop_id.to_string(),
                target_shop_id: target_shop_id.to_string(),
                cart_total,
                cart_items,
                success: true,
                checkout_url: None,
                cart_token: None,
                error_message: None,
            },
            created_at,
        );
        log.in_flight = true;
        log
    }

    /// Awaiting an order confirmation
    pub fn is_pending(&self) -> bool {
        !self.completed && self.order_id.is_none() && !self.in_flight
    }
}

/// History status filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failed,
    Completed,
}

/// Filter for the history listing
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub target_shop_id: Option<String>,
    pub status: Option<LogStatus>,
    pub limit: usize,
}

impl LogFilter {
    pub fn matches(&self, log: &RedirectLog) -> bool {
        if let Some(target) = &self.target_shop_id {
            if &log.target_shop_id != target {
                return false;
            }
        }
        match self.status {
            Some(LogStatus::Success) => log.success,
            Some(LogStatus::Failed) => !log.success,
            Some(LogStatus::Completed) => log.completed,
            None => true,
        }
    }
}

/// Inclusive time window on log creation time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| ts >= start) && self.end.is_none_or(|end| ts <= end)
    }
}

/// Which logs count as revenue when summing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevenueBasis {
    /// Successful redirects, by creation time
    Redirected,
    /// Confirmed checkouts, by completion time
    Completed,
}

/// Per-target aggregate produced by the log store
#[derive(Debug, Clone, PartialEq)]
pub struct TargetAggregate {
    pub target_shop_id: String,
    pub total_redirections: u64,
    pub successful_redirections: u64,
    pub completed_checkouts: u64,
    pub total_revenue: Decimal,
}

/// Redirect counters shown on the dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectCounts {
    pub total_redirections: u64,
    pub successful_redirections: u64,
    pub failed_redirections: u64,
    pub completed_checkouts: u64,
    pub total_revenue: Decimal,
}

impl RedirectCounts {
    pub fn add(&mut self, other: &RedirectCounts) {
        self.total_redirections += other.total_redirections;
        self.successful_redirections += other.successful_redirections;
        self.failed_redirections += other.failed_redirections;
        self.completed_checkouts += other.completed_checkouts;
        self.total_revenue = self.total_revenue.saturating_add(other.total_revenue);
    }
}

impl From<&TargetAggregate> for RedirectCounts {
    fn from(agg: &TargetAggregate) -> Self {
        Self {
            total_redirections: agg.total_redirections,
            successful_redirections: agg.successful_redirections,
            failed_redirections: agg.total_redirections - agg.successful_redirections,
            completed_checkouts: agg.completed_checkouts,
            total_revenue: agg.total_revenue,
        }
    }
}

/// Dashboard row for one target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopBreakdown {
    pub shop_id: String,
    pub shop_name: String,
    pub shop_domain: String,
    #[serde(flatten)]
    pub counts: RedirectCounts,
    /// Completed checkouts per successful redirect, percent
    pub conversion_rate: f64,
}

/// `GET /api/stats` payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsOverview {
    pub by_shop: Vec<ShopBreakdown>,
    /// Every attempt in the window, unplaced ones included
    pub total: RedirectCounts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopStatsBlock {
    #[serde(flatten)]
    pub counts: RedirectCounts,
    /// Completed checkouts per redirect, percent with one decimal
    pub conversion_rate: f64,
}

/// Target shop configuration next to its all-time statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetShopStats {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub active: bool,
    pub weight: u32,
    pub daily_revenue_limit: Option<Decimal>,
    pub current_revenue: Decimal,
    pub daily_revenue: Decimal,
    pub stats: ShopStatsBlock,
}

/// Rotation statistics row
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStats {
    pub shop_id: String,
    pub shop_name: String,
    pub total_redirections: u64,
    pub completed_checkouts: u64,
    pub total_revenue: Decimal,
    pub conversion_rate: f64,
}

/// History row with shop names resolved
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub date: DateTime<Utc>,
    pub source_shop: String,
    pub target_shop: String,
    pub cart_total: Decimal,
    pub success: bool,
    pub completed: bool,
    pub checkout_url: Option<String>,
    pub error_message: Option<String>,
    pub cart_items: Vec<CartItem>,
}

/// Redirect response payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectResponse {
    pub checkout_url: String,
    pub target_shop_name: String,
    pub redirect_log_id: String,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `orders/create` webhook body, only the fields used for matching
#[derive(Debug, Clone, Deserialize)]
pub struct OrderWebhook {
    pub id: Option<serde_json::Value>,
    pub cart_token: Option<String>,
    pub checkout_token: Option<String>,
}

impl OrderWebhook {
    pub fn order_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn counters(daily: i64, last_reset: DateTime<Utc>) -> RevenueCounters {
        RevenueCounters {
            active: true,
            current_revenue: dec(100),
            daily_revenue: dec(daily),
            last_reset_date: last_reset,
        }
    }

    #[test]
    fn rotation_mode_parses_only_known_values() {
        assert_eq!("round-robin".parse::<RotationMode>(), Ok(RotationMode::RoundRobin));
        assert_eq!("weighted".parse::<RotationMode>(), Ok(RotationMode::Weighted));
        assert_eq!("manual".parse::<RotationMode>(), Ok(RotationMode::Manual));
        assert!("random".parse::<RotationMode>().is_err());
        assert!("".parse::<RotationMode>().is_err());
    }

    #[test]
    fn rotation_mode_serializes_as_kebab_name() {
        let json = serde_json::to_string(&RotationMode::RoundRobin).unwrap();
        assert_eq!(json, "\"round-robin\"");
    }

    #[test]
    fn reset_zeroes_daily_revenue_on_new_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let mut c = counters(45, now - Duration::days(1));

        assert!(c.reset_if_new_day(now, utc()));
        assert_eq!(c.daily_revenue, Decimal::ZERO);
        assert_eq!(c.last_reset_date, now);
        assert_eq!(c.current_revenue, dec(100));

        assert!(!c.reset_if_new_day(now + Duration::hours(3), utc()));
        assert_eq!(c.last_reset_date, now);
    }

    #[test]
    fn reset_follows_reference_timezone() {
        // 23:30 UTC on the 9th is already the 10th at UTC+1
        let last = Utc.with_ymd_and_hms(2026, 3, 9, 22, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 23, 30, 0).unwrap();
        let plus_one = FixedOffset::east_opt(3600).unwrap();

        let mut in_utc = counters(10, last);
        assert!(!in_utc.reset_if_new_day(now, utc()));

        let mut shifted = counters(10, last);
        assert!(shifted.reset_if_new_day(now, plus_one));
    }

    #[test]
    fn enforce_limit_is_idempotent() {
        let now = Utc::now();
        let mut c = counters(50, now);
        assert!(c.enforce_limit(Some(dec(50))));
        assert!(!c.active);
        assert!(!c.enforce_limit(Some(dec(50))));
        assert!(!c.active);
    }

    #[test]
    fn enforce_limit_ignores_unlimited_and_below_cap() {
        let now = Utc::now();
        let mut unlimited = counters(1_000_000, now);
        assert!(!unlimited.enforce_limit(None));
        assert!(unlimited.active);

        let mut below = counters(49, now);
        assert!(!below.enforce_limit(Some(dec(50))));
        assert!(below.active);
    }

    #[test]
    fn cart_total_sums_price_times_quantity() {
        let items = vec![
            CartItem {
                variant_id: "1".into(),
                quantity: 2,
                price: dec(10),
                title: None,
                image: None,
            },
            CartItem {
                variant_id: "2".into(),
                quantity: 3,
                price: Decimal::new(250, 2),
                title: None,
                image: None,
            },
        ];
        assert_eq!(cart_total(&items), Some(Decimal::new(2750, 2)));
    }

    #[test]
    fn cart_total_reports_overflow() {
        let huge = CartItem {
            variant_id: "1".into(),
            quantity: 1_000_000_000,
            price: Decimal::MAX,
            title: None,
            image: None,
        };
        assert_eq!(huge.line_total(), None);
        assert_eq!(cart_total(&[huge]), None);

        let max_line = CartItem {
            variant_id: "2".into(),
            quantity: 1,
            price: Decimal::MAX,
            title: None,
            image: None,
        };
        assert_eq!(cart_total(&[max_line.clone()]), Some(Decimal::MAX));
        assert_eq!(cart_total(&[max_line.clone(), max_line]), None);
    }

    #[test]
    fn admission_requires_headroom_under_the_limit() {
        let now = Utc::now();
        assert!(counters(49, now).admits(Some(dec(50))));
        assert!(!counters(50, now).admits(Some(dec(50))));
        assert!(counters(1_000, now).admits(None));

        let mut paused = counters(0, now);
        paused.active = false;
        assert!(!paused.admits(None));
    }

    #[test]
    fn release_never_goes_negative() {
        let mut c = counters(10, Utc::now());
        c.release(dec(4));
        assert_eq!(c.daily_revenue, dec(6));
        c.release(dec(50));
        assert_eq!(c.daily_revenue, Decimal::ZERO);
    }

    #[test]
    fn reserved_log_is_not_pending_until_settled() {
        let mut log = RedirectLog::reserved(
            "log-1".into(),
            "src",
            "t1",
            dec(20),
            Vec::new(),
            Utc::now(),
        );
        assert!(log.success);
        assert!(log.in_flight);
        assert!(!log.is_pending());
        log.in_flight = false;
        assert!(log.is_pending());
    }

    #[test]
    fn cart_token_strips_gid_prefix_and_key() {
        let reference = CheckoutReference {
            cart_id: "gid://shopify/Cart/c1-abc123?key=deadbeef".into(),
            checkout_url: "https://shop.example/cart/c/c1-abc123".into(),
        };
        assert_eq!(reference.cart_token(), "c1-abc123");
    }

    #[test]
    fn time_window_bounds_are_inclusive() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
        let window = TimeWindow {
            start: Some(start),
            end: Some(end),
        };
        assert!(window.contains(start));
        assert!(window.contains(end));
        assert!(!window.contains(end + Duration::seconds(1)));
        assert!(TimeWindow::default().contains(start));
    }

    #[test]
    fn patch_distinguishes_null_limit_from_absent() {
        let cleared: TargetShopPatch =
            serde_json::from_str(r#"{"dailyRevenueLimit": null}"#).unwrap();
        assert_eq!(cleared.daily_revenue_limit, Some(None));

        let absent: TargetShopPatch = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert_eq!(absent.daily_revenue_limit, None);
    }

    #[test]
    fn order_webhook_accepts_numeric_ids() {
        let hook: OrderWebhook =
            serde_json::from_str(r#"{"id": 820982911946154508, "cart_token": "tok"}"#).unwrap();
        assert_eq!(hook.order_id().as_deref(), Some("820982911946154508"));
    }
}

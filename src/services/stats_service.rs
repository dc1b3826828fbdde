//! Rotation and dashboard statistics

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{AppError, AppResult};
use crate::models::{
    RedirectCounts, RotationStats, ShopBreakdown, ShopStatsBlock, StatsOverview, TargetShop,
    TargetShopStats, TimeWindow, UNKNOWN_TARGET,
};
use crate::state::AppState;

/// Per-target redirections, completions, completed revenue and conversion
/// rate over `window`, busiest target first
pub async fn get_rotation_stats(
    app_state: &AppState,
    window: TimeWindow,
) -> AppResult<Vec<RotationStats>> {
    let aggregates = app_state.stores.logs.aggregate_by_target(window).await?;
    let names: HashMap<String, String> = app_state
        .stores
        .shops
        .list()
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    let mut stats: Vec<RotationStats> = aggregates
        .into_iter()
        .filter(|agg| agg.target_shop_id != UNKNOWN_TARGET)
        .map(|agg| {
            let conversion_rate = percent(agg.completed_checkouts, agg.total_redirections);
            RotationStats {
                shop_name: names
                    .get(&agg.target_shop_id)
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string()),
                shop_id: agg.target_shop_id,
                total_redirections: agg.total_redirections,
                completed_checkouts: agg.completed_checkouts,
                total_revenue: agg.total_revenue,
                conversion_rate: round_rate(conversion_rate),
            }
        })
        .collect();

    stats.sort_by(|a, b| b.total_redirections.cmp(&a.total_redirections));
    Ok(stats)
}

/// Dashboard summary over `window`: one row per target with success and
/// failure counts, plus totals across every attempt
pub async fn get_overview(app_state: &AppState, window: TimeWindow) -> AppResult<StatsOverview> {
    let aggregates = app_state.stores.logs.aggregate_by_target(window).await?;
    let shops: HashMap<String, TargetShop> = app_state
        .stores
        .shops
        .list()
        .await?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    let mut total = RedirectCounts::default();
    let mut by_shop = Vec::new();
    for agg in &aggregates {
        let counts = RedirectCounts::from(agg);
        total.add(&counts);
        if agg.target_shop_id == UNKNOWN_TARGET {
            continue;
        }
        let shop = shops.get(&agg.target_shop_id);
        by_shop.push(ShopBreakdown {
            shop_id: agg.target_shop_id.clone(),
            shop_name: shop.map_or_else(|| "Unknown".to_string(), |s| s.name.clone()),
            shop_domain: shop.map(|s| s.domain.clone()).unwrap_or_default(),
            conversion_rate: round_rate(percent(
                counts.completed_checkouts,
                counts.successful_redirections,
            )),
            counts,
        });
    }
    by_shop.sort_by(|a, b| b.counts.total_redirections.cmp(&a.counts.total_redirections));

    Ok(StatsOverview { by_shop, total })
}

/// Every target shop, creation order, with its configuration and all-time
/// redirect statistics. Shops without traffic get zeroed stats.
pub async fn get_target_shop_stats(app_state: &AppState) -> AppResult<Vec<TargetShopStats>> {
    let aggregates: HashMap<String, RedirectCounts> = app_state
        .stores
        .logs
        .aggregate_by_target(TimeWindow::default())
        .await?
        .iter()
        .map(|agg| (agg.target_shop_id.clone(), RedirectCounts::from(agg)))
        .collect();

    let stats = app_state
        .stores
        .shops
        .list()
        .await?
        .into_iter()
        .map(|shop| {
            let counts = aggregates.get(&shop.id).cloned().unwrap_or_default();
            let conversion_rate =
                (percent(counts.completed_checkouts, counts.total_redirections) * 10.0).round()
                    / 10.0;
            TargetShopStats {
                id: shop.id,
                name: shop.name,
                domain: shop.domain,
                active: shop.active,
                weight: shop.weight,
                daily_revenue_limit: shop.daily_revenue_limit,
                current_revenue: shop.current_revenue,
                daily_revenue: shop.daily_revenue,
                stats: ShopStatsBlock {
                    counts,
                    conversion_rate,
                },
            }
        })
        .collect();
    Ok(stats)
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Percent, two decimals
fn round_rate(rate: f64) -> f64 {
    (rate * 100.0).round() / 100.0
}

/// Build a window from optional `startDate` / `endDate` query values.
///
/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates; a plain end date
/// covers that whole day.
pub fn parse_window(start: Option<&str>, end: Option<&str>) -> AppResult<TimeWindow> {
    let start = start
        .filter(|s| !s.is_empty())
        .map(|s| parse_bound(s, false))
        .transpose()?;
    let end = end
        .filter(|s| !s.is_empty())
        .map(|s| parse_bound(s, true))
        .transpose()?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(AppError::InvalidInput(
                "startDate must not be after endDate".into(),
            ));
        }
    }
    Ok(TimeWindow { start, end })
}

fn parse_bound(raw: &str, end_of_day: bool) -> AppResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::InvalidInput(format!("invalid date '{}'", raw)))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| AppError::InvalidInput(format!("invalid date '{}'", raw)))
}

//! Shop administration
//!
//! Target and source shop CRUD plus the redirect history listing. Target
//! shop updates go through the same compare-and-swap loop as revenue
//! accounting so an admin edit never clobbers a concurrent accrual.

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{
    HistoryEntry, LogFilter, LogStatus, NewSourceShop, NewTargetShop, SourceShop,
    SourceShopPatch, TargetShop, TargetShopPatch, TargetShopView, UNKNOWN_TARGET,
};
use crate::services::shop_registry::update_with_retry;
use crate::state::AppState;

const API_KEY_LEN: usize = 32;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Weights below zero count as zero
fn clamp_weight(weight: i64) -> u32 {
    weight.clamp(0, i64::from(u32::MAX)) as u32
}

fn check_limit(limit: Option<Decimal>) -> AppResult<Option<Decimal>> {
    match limit {
        Some(limit) if limit < Decimal::ZERO => Err(AppError::InvalidInput(
            "dailyRevenueLimit must not be negative".into(),
        )),
        other => Ok(other),
    }
}

fn required(field: &str, value: String) -> AppResult<String> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(AppError::InvalidInput(format!("{} is required", field)));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Target shops
// ---------------------------------------------------------------------------

pub async fn create_target_shop(
    app_state: &AppState,
    input: NewTargetShop,
) -> AppResult<TargetShopView> {
    input.validate()?;
    let daily_revenue_limit = check_limit(input.daily_revenue_limit)?;
    let now = Utc::now();

    let shop = TargetShop {
        id: Uuid::new_v4().to_string(),
        name: required("name", input.name)?,
        domain: required("domain", input.domain)?,
        access_token: required("accessToken", input.access_token)?,
        active: true,
        weight: clamp_weight(input.weight),
        daily_revenue_limit,
        current_revenue: Decimal::ZERO,
        daily_revenue: Decimal::ZERO,
        last_reset_date: now,
        created_at: now,
        updated_at: now,
        revision: 0,
    };
    let shop = app_state.stores.shops.insert(shop).await?;
    info!(shop_id = %shop.id, domain = %shop.domain, "Target shop created");
    Ok(shop.into())
}

/// Newest first, credentials masked
pub async fn list_target_shops(app_state: &AppState) -> AppResult<Vec<TargetShopView>> {
    let shops = app_state.stores.shops.list().await?;
    Ok(shops.into_iter().rev().map(TargetShopView::from).collect())
}

pub async fn update_target_shop(
    app_state: &AppState,
    shop_id: &str,
    patch: TargetShopPatch,
) -> AppResult<TargetShopView> {
    let name = patch.name.map(|v| required("name", v)).transpose()?;
    let domain = patch.domain.map(|v| required("domain", v)).transpose()?;
    let access_token = patch
        .access_token
        .map(|v| required("accessToken", v))
        .transpose()?;
    let limit = match patch.daily_revenue_limit {
        Some(limit) => Some(check_limit(limit)?),
        None => None,
    };

    let shop = update_with_retry(app_state, shop_id, |current| {
        let mut next = current.clone();
        if let Some(name) = &name {
            next.name = name.clone();
        }
        if let Some(domain) = &domain {
            next.domain = domain.clone();
        }
        if let Some(token) = &access_token {
            next.access_token = token.clone();
        }
        if let Some(active) = patch.active {
            next.active = active;
        }
        if let Some(weight) = patch.weight {
            next.weight = clamp_weight(weight);
        }
        if let Some(limit) = limit {
            next.daily_revenue_limit = limit;
        }
        next.updated_at = Utc::now();
        Ok(Some(next))
    })
    .await?;

    info!(shop_id = %shop.id, active = shop.active, "Target shop updated");
    Ok(shop.into())
}

pub async fn delete_target_shop(app_state: &AppState, shop_id: &str) -> AppResult<()> {
    if !app_state.stores.shops.delete(shop_id).await? {
        return Err(AppError::NotFound(format!("target shop {}", shop_id)));
    }
    info!(shop_id, "Target shop deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Source shops
// ---------------------------------------------------------------------------

fn generate_api_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LEN)
        .map(char::from)
        .collect()
}

pub async fn create_source_shop(
    app_state: &AppState,
    input: NewSourceShop,
) -> AppResult<SourceShop> {
    input.validate()?;
    let shop = SourceShop {
        id: Uuid::new_v4().to_string(),
        name: required("name", input.name)?,
        domain: required("domain", input.domain)?,
        api_key: generate_api_key(),
        active: true,
        created_at: Utc::now(),
    };
    let shop = app_state.stores.sources.insert(shop).await?;
    info!(shop_id = %shop.id, domain = %shop.domain, "Source shop created");
    Ok(shop)
}

/// Newest first
pub async fn list_source_shops(app_state: &AppState) -> AppResult<Vec<SourceShop>> {
    let shops = app_state.stores.sources.list().await?;
    Ok(shops.into_iter().rev().collect())
}

pub async fn update_source_shop(
    app_state: &AppState,
    shop_id: &str,
    patch: SourceShopPatch,
) -> AppResult<SourceShop> {
    let mut shop = app_state
        .stores
        .sources
        .get(shop_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("source shop {}", shop_id)))?;
    if let Some(name) = patch.name {
        shop.name = required("name", name)?;
    }
    if let Some(active) = patch.active {
        shop.active = active;
    }
    let shop = app_state.stores.sources.update(shop).await?;
    info!(shop_id = %shop.id, active = shop.active, "Source shop updated");
    Ok(shop)
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Redirect logs newest first, with shop names resolved
pub async fn list_history(
    app_state: &AppState,
    limit: Option<usize>,
    target_shop_id: Option<String>,
    status: Option<LogStatus>,
) -> AppResult<Vec<HistoryEntry>> {
    let filter = LogFilter {
        target_shop_id,
        status,
        limit: limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
    };
    let logs = app_state.stores.logs.list(&filter).await?;

    let targets: HashMap<String, String> = app_state
        .stores
        .shops
        .list()
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    let sources: HashMap<String, String> = app_state
        .stores
        .sources
        .list()
        .await?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    let name_of = |names: &HashMap<String, String>, id: &str| {
        names
            .get(id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_TARGET.to_string())
    };

    Ok(logs
        .into_iter()
        .map(|log| HistoryEntry {
            source_shop: name_of(&sources, &log.source_shop_id),
            target_shop: name_of(&targets, &log.target_shop_id),
            id: log.id,
            date: log.created_at,
            cart_total: log.cart_total,
            success: log.success,
            completed: log.completed,
            checkout_url: log.checkout_url,
            error_message: log.error_message,
            cart_items: log.cart_items,
        })
        .collect())
}

//! HTTP request handlers
//!
//! This module contains all the HTTP endpoint handlers. Each handler is responsible
//! for extracting data from HTTP requests, calling the appropriate services, and
//! returning HTTP responses wrapped in the [`ApiResponse`] envelope.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiResponse, AppError, AppResult};
use crate::extractor::JsonBody;
use crate::models::*;
use crate::services::redirect_service::{self, RedirectOutcome};
use crate::services::webhook_service::{self, WebhookOutcome};
use crate::services::{revenue_service, rotation_service, shop_service, stats_service};
use crate::state::AppState;

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/rotation/mode", get(get_mode).post(set_mode))
        .route("/api/rotation/next", get(next_target))
        .route("/api/rotation/reset", post(reset_rotation))
        .route("/api/rotation/stats", get(rotation_stats))
        .route("/api/stats", get(stats_overview))
        .route("/api/stats/by-shop", get(stats_by_shop))
        .route("/api/cloak/redirect", post(redirect))
        .route(
            "/api/target-shops",
            get(list_target_shops).post(create_target_shop),
        )
        .route(
            "/api/target-shops/check-limits",
            post(check_limits),
        )
        .route(
            "/api/target-shops/{id}",
            put(update_target_shop).delete(delete_target_shop),
        )
        .route(
            "/api/source-shops",
            get(list_source_shops).post(create_source_shop),
        )
        .route("/api/source-shops/{id}", put(update_source_shop))
        .route("/api/history", get(history))
        .route("/api/webhooks/shopify", post(shopify_webhook))
        .with_state(app_state)
}

/// Root endpoint - liveness check
pub async fn root() -> &'static str {
    "OK"
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

pub async fn get_mode(State(state): State<AppState>) -> AppResult<Json<ApiResponse<ModeBody>>> {
    let mode = rotation_service::get_mode(&state).await?;
    Ok(ApiResponse::ok(ModeBody {
        mode: mode.to_string(),
    }))
}

/// Switch the rotation mode; anything but the three known modes is a 400
pub async fn set_mode(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<ModeBody>,
) -> AppResult<Json<ApiResponse<ModeBody>>> {
    let mode = rotation_service::set_mode(&state, &payload.mode).await?;
    Ok(ApiResponse::ok(ModeBody {
        mode: mode.to_string(),
    }))
}

/// Preview selection: advances the round-robin cursor like a real redirect
pub async fn next_target(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<TargetSummary>>> {
    let target = rotation_service::pick_next_target(&state).await?;
    Ok(ApiResponse::ok(TargetSummary::from(&target)))
}

pub async fn reset_rotation(State(state): State<AppState>) -> AppResult<Json<ApiResponse<()>>> {
    rotation_service::reset_rotation(&state).await?;
    Ok(ApiResponse::empty())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Per-target statistics
///
/// Query parameters:
/// - `startDate`: RFC3339 timestamp or `YYYY-MM-DD` (optional)
/// - `endDate`: RFC3339 timestamp or `YYYY-MM-DD`, whole day included (optional)
pub async fn rotation_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> AppResult<Json<ApiResponse<Vec<RotationStats>>>> {
    let window =
        stats_service::parse_window(params.start_date.as_deref(), params.end_date.as_deref())?;
    let stats = stats_service::get_rotation_stats(&state, window).await?;
    Ok(ApiResponse::ok(stats))
}

/// Dashboard summary, same query parameters as `/api/rotation/stats`
pub async fn stats_overview(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> AppResult<Json<ApiResponse<StatsOverview>>> {
    let window =
        stats_service::parse_window(params.start_date.as_deref(), params.end_date.as_deref())?;
    Ok(ApiResponse::ok(stats_service::get_overview(&state, window).await?))
}

/// Every target shop with its all-time statistics
pub async fn stats_by_shop(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<TargetShopStats>>>> {
    Ok(ApiResponse::ok(stats_service::get_target_shop_stats(&state).await?))
}

// ---------------------------------------------------------------------------
// Redirect
// ---------------------------------------------------------------------------

/// Redirect a cart to the next target shop
///
/// A gateway failure still answers 200 with the target's cart page and
/// `degraded: true`; only an exhausted target set is a 503.
pub async fn redirect(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RedirectRequest>,
) -> AppResult<Response> {
    let outcome =
        redirect_service::redirect(&state, &payload.source_key, payload.cart_items).await?;

    let response = match outcome {
        RedirectOutcome::Redirected {
            log,
            target,
            checkout_url,
        } => ApiResponse::ok(RedirectResponse {
            checkout_url,
            target_shop_name: target.name,
            redirect_log_id: log.id,
            degraded: false,
            error: None,
        })
        .into_response(),
        RedirectOutcome::Degraded {
            log,
            target,
            fallback_url,
            error,
        } => ApiResponse::ok(RedirectResponse {
            checkout_url: fallback_url,
            target_shop_name: target.name,
            redirect_log_id: log.id,
            degraded: true,
            error: Some(error.to_string()),
        })
        .into_response(),
        RedirectOutcome::NoTargetAvailable { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::failure(AppError::NoEligibleTargets.to_string()),
        )
            .into_response(),
    };
    Ok(response)
}

// ---------------------------------------------------------------------------
// Target shops
// ---------------------------------------------------------------------------

pub async fn list_target_shops(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<TargetShopView>>>> {
    Ok(ApiResponse::ok(shop_service::list_target_shops(&state).await?))
}

pub async fn create_target_shop(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<NewTargetShop>,
) -> AppResult<(StatusCode, Json<ApiResponse<TargetShopView>>)> {
    let shop = shop_service::create_target_shop(&state, payload).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(shop)))
}

pub async fn update_target_shop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(patch): JsonBody<TargetShopPatch>,
) -> AppResult<Json<ApiResponse<TargetShopView>>> {
    let shop = shop_service::update_target_shop(&state, &id, patch).await?;
    Ok(ApiResponse::ok(shop))
}

pub async fn delete_target_shop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    shop_service::delete_target_shop(&state, &id).await?;
    Ok(ApiResponse::empty())
}

/// Run the limit sweep now and list the shops it deactivated
pub async fn check_limits(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<LimitDeactivation>>>> {
    let deactivated = revenue_service::reconcile_all(&state).await?;
    Ok(ApiResponse::ok(deactivated))
}

// ---------------------------------------------------------------------------
// Source shops
// ---------------------------------------------------------------------------

pub async fn list_source_shops(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<SourceShop>>>> {
    Ok(ApiResponse::ok(shop_service::list_source_shops(&state).await?))
}

pub async fn create_source_shop(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<NewSourceShop>,
) -> AppResult<(StatusCode, Json<ApiResponse<SourceShop>>)> {
    let shop = shop_service::create_source_shop(&state, payload).await?;
    Ok((StatusCode::CREATED, ApiResponse::ok(shop)))
}

pub async fn update_source_shop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(patch): JsonBody<SourceShopPatch>,
) -> AppResult<Json<ApiResponse<SourceShop>>> {
    let shop = shop_service::update_source_shop(&state, &id, patch).await?;
    Ok(ApiResponse::ok(shop))
}

// ---------------------------------------------------------------------------
// History and webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub shop_id: Option<String>,
    pub status: Option<LogStatus>,
}

/// Redirect history, newest first
///
/// Query parameters:
/// - `limit`: maximum rows, default 100
/// - `shopId`: only logs for this target shop
/// - `status`: `success`, `failed` or `completed`
pub async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> AppResult<Json<ApiResponse<Vec<HistoryEntry>>>> {
    let entries =
        shop_service::list_history(&state, params.limit, params.shop_id, params.status).await?;
    Ok(ApiResponse::ok(entries))
}

/// Storefront order webhook; the topic comes from `X-Shopify-Topic`
pub async fn shopify_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(order): JsonBody<OrderWebhook>,
) -> AppResult<Json<ApiResponse<WebhookOutcome>>> {
    let topic = headers
        .get("x-shopify-topic")
        .and_then(|v| v.to_str().ok());
    let outcome = webhook_service::handle_order_webhook(&state, topic, order).await?;
    Ok(ApiResponse::ok(outcome))
}

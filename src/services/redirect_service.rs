//! Redirect orchestration
//!
//! Entry point for a checkout redirection: resolve the source shop, validate
//! the cart, reserve the cart on a target, ask the gateway for a checkout,
//! then record the answer on the reserved log. The reservation is a single
//! store write, so no lock is held while the gateway call is in flight.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::RevenueAccrual;
use crate::error::{AppError, AppResult, GatewayError};
use crate::infrastructure::store::{LogChange, Settlement};
use crate::models::{
    CartItem, CheckoutReference, NewRedirectLog, RedirectLog, SourceShop, TargetShop,
    UNKNOWN_TARGET, cart_total,
};
use crate::services::revenue_service::{self, Reservation};
use crate::services::rotation_service;
use crate::state::AppState;

/// How a redirect attempt ended
#[derive(Debug)]
pub enum RedirectOutcome {
    /// Checkout created on the target
    Redirected {
        log: RedirectLog,
        target: TargetShop,
        checkout_url: String,
    },
    /// Gateway failed; the caller gets the target's cart page instead
    Degraded {
        log: RedirectLog,
        target: TargetShop,
        fallback_url: String,
        error: GatewayError,
    },
    /// Every target is inactive or exhausted
    NoTargetAvailable { log: RedirectLog },
}

/// Non-empty, every line with a variant, a positive quantity and a price >= 0.
/// Returns the cart total.
pub fn validate_cart(items: &[CartItem]) -> AppResult<Decimal> {
    if items.is_empty() {
        return Err(AppError::InvalidCart("cart is empty".into()));
    }
    for item in items {
        item.validate()
            .map_err(|e| AppError::InvalidCart(e.to_string()))?;
        if item.price < Decimal::ZERO {
            return Err(AppError::InvalidCart(format!(
                "negative price for variant {}",
                item.variant_id
            )));
        }
    }
    cart_total(items).ok_or_else(|| AppError::InvalidCart("cart total overflows".into()))
}

async fn resolve_source(app_state: &AppState, source_key: &str) -> AppResult<SourceShop> {
    match app_state.stores.sources.find_by_api_key(source_key).await? {
        Some(source) if source.active => Ok(source),
        _ => Err(AppError::UnknownOrInactiveSource),
    }
}

/// Redirect a cart from a source shop to the next target
pub async fn redirect(
    app_state: &AppState,
    source_key: &str,
    cart_items: Vec<CartItem>,
) -> AppResult<RedirectOutcome> {
    let source = resolve_source(app_state, source_key).await?;
    let total = validate_cart(&cart_items)?;

    let Some(reservation) = reserve_target(app_state, &source, total, &cart_items).await? else {
        let log = app_state
            .stores
            .logs
            .append(NewRedirectLog {
                source_shop_id: source.id,
                target_shop_id: UNKNOWN_TARGET.to_string(),
                cart_total: total,
                cart_items,
                success: false,
                checkout_url: None,
                cart_token: None,
                error_message: Some(AppError::NoEligibleTargets.to_string()),
            })
            .await?;
        warn!(log_id = %log.id, "No eligible target shop for redirect");
        return Ok(RedirectOutcome::NoTargetAvailable { log });
    };

    match request_checkout(app_state, &reservation.shop, &cart_items).await {
        Ok(reference) => {
            let checkout_url = reference.checkout_url.clone();
            let log = app_state
                .stores
                .logs
                .apply(LogChange::Settle {
                    id: reservation.log.id.clone(),
                    settlement: Settlement::Checkout {
                        checkout_url: reference.checkout_url.clone(),
                        cart_token: reference.cart_token(),
                    },
                })
                .await?
                .ok_or_else(|| {
                    AppError::Persistence(format!(
                        "redirect log {} is no longer in flight",
                        reservation.log.id
                    ))
                })?;
            info!(
                log_id = %log.id,
                shop_id = %reservation.shop.id,
                cart_total = %total,
                "Checkout redirected"
            );
            Ok(RedirectOutcome::Redirected {
                log,
                target: reservation.shop,
                checkout_url,
            })
        }
        Err(error) => {
            let fallback_url = reservation.shop.fallback_cart_url();
            let settlement = Settlement::Failed {
                fallback_url: fallback_url.clone(),
                error_message: error.to_string(),
            };
            let log = revenue_service::release_reservation(app_state, &reservation, settlement).await?;
            warn!(
                log_id = %log.id,
                shop_id = %reservation.shop.id,
                error = %error,
                "Checkout creation failed, falling back to cart page"
            );
            Ok(RedirectOutcome::Degraded {
                log,
                target: reservation.shop,
                fallback_url,
                error,
            })
        }
    }
}

/// Select targets until one accepts the cart. A target that filled up or
/// disappeared since selection is skipped; `None` once no target is left or
/// the attempts run out.
async fn reserve_target(
    app_state: &AppState,
    source: &SourceShop,
    total: Decimal,
    cart_items: &[CartItem],
) -> AppResult<Option<Reservation>> {
    let amount = match app_state.config.revenue_accrual {
        RevenueAccrual::OnRedirect => total,
        RevenueAccrual::OnConfirmation => Decimal::ZERO,
    };

    let attempts = app_state.config.cas_max_attempts.max(1);
    for attempt in 1..=attempts {
        let target = match rotation_service::pick_next_target(app_state).await {
            Ok(target) => target,
            Err(AppError::NoEligibleTargets) => return Ok(None),
            Err(e) => return Err(e),
        };
        let log = RedirectLog::reserved(
            Uuid::new_v4().to_string(),
            &source.id,
            &target.id,
            total,
            cart_items.to_vec(),
            Utc::now(),
        );
        match revenue_service::reserve_redirect(app_state, &target.id, amount, log).await {
            Ok(Some(reservation)) => return Ok(Some(reservation)),
            Ok(None) => debug!(shop_id = %target.id, attempt, "Target full, selecting again"),
            Err(AppError::NotFound(_)) => {
                debug!(shop_id = %target.id, attempt, "Target removed, selecting again")
            }
            Err(e) => return Err(e),
        }
    }
    warn!(attempts, "No target accepted the cart");
    Ok(None)
}

async fn request_checkout(
    app_state: &AppState,
    target: &TargetShop,
    items: &[CartItem],
) -> Result<CheckoutReference, GatewayError> {
    let timeout = app_state.config.gateway_timeout();
    match tokio::time::timeout(timeout, app_state.gateway.create_checkout(target, items)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(app_state.config.gateway_timeout_ms)),
    }
}

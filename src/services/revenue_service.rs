//! Revenue accounting
//!
//! Keeps the lifetime and daily counters of target shops consistent and
//! enforces the daily cap. Every mutation runs reset-if-new-day, the change
//! itself and the limit check inside one compare-and-swap on the shop, so
//! two requests to the same near-limit shop are serialized.
//!
//! Counter changes caused by a redirect log (reservation, release,
//! confirmation) are written together with that log change, which keeps the
//! log authoritative for [`reconcile_all`].

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::RevenueAccrual;
use crate::error::{AppError, AppResult};
use crate::infrastructure::store::{CasOutcome, LogChange, Settlement};
use crate::models::{
    LimitDeactivation, RedirectLog, RevenueBasis, TargetShop, UNKNOWN_TARGET, calendar_day,
};
use crate::services::shop_registry::{
    LinkedWrite, contention, get_target, update_with_log, update_with_retry,
};
use crate::state::AppState;

/// Zero the shop's daily revenue if its last reset was on an earlier day
pub async fn reset_if_new_day(app_state: &AppState, shop_id: &str) -> AppResult<TargetShop> {
    let tz = app_state.reset_timezone();
    update_with_retry(app_state, shop_id, |shop| {
        let now = Utc::now();
        let mut counters = shop.counters();
        if !counters.reset_if_new_day(now, tz) {
            return Ok(None);
        }
        Ok(Some(shop.with_counters(counters, now)))
    })
    .await
}

/// Add a confirmed checkout to both the daily and the lifetime totals
pub async fn record_completed_checkout(
    app_state: &AppState,
    shop_id: &str,
    amount: Decimal,
) -> AppResult<TargetShop> {
    let tz = app_state.reset_timezone();
    let mut deactivated = false;
    let shop = update_with_retry(app_state, shop_id, |shop| {
        let now = Utc::now();
        let mut counters = shop.counters();
        counters.reset_if_new_day(now, tz);
        counters.accrue(amount, amount);
        deactivated = counters.enforce_limit(shop.daily_revenue_limit);
        Ok(Some(shop.with_counters(counters, now)))
    })
    .await?;

    debug!(
        shop_id,
        daily_revenue = %shop.daily_revenue,
        current_revenue = %shop.current_revenue,
        "Revenue accrued"
    );
    if deactivated {
        log_deactivation(&shop);
    }
    Ok(shop)
}

/// Daily share taken by a target for one in-flight redirect
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Shop as stored right after the reservation
    pub shop: TargetShop,
    pub log: RedirectLog,
    pub amount: Decimal,
    /// This reservation pushed the shop to its limit
    pub deactivated: bool,
}

/// Take `amount` of the shop's daily headroom and open `log` in the same write.
///
/// The shop admits the cart only while it is active and its daily revenue
/// is still under the limit, so the cap is overshot by at most one cart.
/// `None` when the shop declined; the log is not written then.
pub async fn reserve_redirect(
    app_state: &AppState,
    shop_id: &str,
    amount: Decimal,
    log: RedirectLog,
) -> AppResult<Option<Reservation>> {
    let tz = app_state.reset_timezone();
    let log_id = log.id.clone();
    let mut deactivated = false;
    let outcome = update_with_log(app_state, shop_id, LogChange::Append(log), |shop| {
        let now = Utc::now();
        let mut counters = shop.counters();
        counters.reset_if_new_day(now, tz);
        if !counters.admits(shop.daily_revenue_limit) {
            return Ok(None);
        }
        counters.accrue(amount, Decimal::ZERO);
        deactivated = counters.enforce_limit(shop.daily_revenue_limit);
        Ok(Some(shop.with_counters(counters, now)))
    })
    .await?;

    match outcome {
        LinkedWrite::Applied { shop, log } => {
            debug!(shop_id, log_id = %log.id, amount = %amount, "Daily revenue reserved");
            if deactivated {
                log_deactivation(&shop);
            }
            Ok(Some(Reservation {
                shop,
                log,
                amount,
                deactivated,
            }))
        }
        LinkedWrite::Declined(shop) => {
            debug!(shop_id, daily_revenue = %shop.daily_revenue, "Target declined the cart");
            if shop.active {
                enforce_limit(app_state, shop_id).await?;
            }
            Ok(None)
        }
        LinkedWrite::LogRejected => Err(AppError::Persistence(format!(
            "redirect log {} already exists",
            log_id
        ))),
    }
}

/// Give the reserved share back after a failed checkout and record the failure.
///
/// Nothing is subtracted once the shop's day was reset after the
/// reservation. A shop this reservation deactivated is reopened when the
/// release brings it back under its limit.
pub async fn release_reservation(
    app_state: &AppState,
    reservation: &Reservation,
    settlement: Settlement,
) -> AppResult<RedirectLog> {
    let tz = app_state.reset_timezone();
    let change = LogChange::Settle {
        id: reservation.log.id.clone(),
        settlement,
    };
    let reserved_on = calendar_day(reservation.log.created_at, tz);
    let result = update_with_log(app_state, &reservation.shop.id, change.clone(), |shop| {
        let now = Utc::now();
        let mut counters = shop.counters();
        counters.reset_if_new_day(now, tz);
        if calendar_day(counters.last_reset_date, tz) == reserved_on {
            counters.release(reservation.amount);
            let under_limit = shop
                .daily_revenue_limit
                .is_none_or(|limit| counters.daily_revenue < limit);
            if reservation.deactivated && !counters.active && under_limit {
                counters.active = true;
            }
        }
        Ok(Some(shop.with_counters(counters, now)))
    })
    .await;

    match result {
        Ok(LinkedWrite::Applied { shop, log }) => {
            debug!(
                shop_id = %shop.id,
                log_id = %log.id,
                daily_revenue = %shop.daily_revenue,
                active = shop.active,
                "Reservation released"
            );
            Ok(log)
        }
        Ok(LinkedWrite::Declined(_) | LinkedWrite::LogRejected) => Err(not_in_flight(&reservation.log.id)),
        Err(AppError::NotFound(_)) => {
            warn!(shop_id = %reservation.shop.id, "Target shop removed before release");
            app_state
                .stores
                .logs
                .apply(change)
                .await?
                .ok_or_else(|| not_in_flight(&reservation.log.id))
        }
        Err(e) => Err(e),
    }
}

fn not_in_flight(log_id: &str) -> AppError {
    AppError::Persistence(format!("redirect log {} is no longer in flight", log_id))
}

/// Complete a pending log and accrue the confirmed amount in the same write.
///
/// Lifetime revenue always grows. Daily revenue grows only when the cap
/// counts confirmed checkouts, since redirect-time accrual already reserved
/// it. `None` when the log was confirmed or settled by someone else first.
pub async fn confirm_checkout(
    app_state: &AppState,
    log: &RedirectLog,
    order_id: &str,
    completed_at: DateTime<Utc>,
) -> AppResult<Option<RedirectLog>> {
    let change = LogChange::Complete {
        id: log.id.clone(),
        order_id: order_id.to_string(),
        completed_at,
    };
    if log.target_shop_id == UNKNOWN_TARGET {
        return Ok(app_state.stores.logs.apply(change).await?);
    }

    let tz = app_state.reset_timezone();
    let daily = match app_state.config.revenue_accrual {
        RevenueAccrual::OnRedirect => Decimal::ZERO,
        RevenueAccrual::OnConfirmation => log.cart_total,
    };
    let mut deactivated = false;
    let result = update_with_log(app_state, &log.target_shop_id, change.clone(), |shop| {
        let now = Utc::now();
        let mut counters = shop.counters();
        counters.reset_if_new_day(now, tz);
        counters.accrue(daily, log.cart_total);
        deactivated = counters.enforce_limit(shop.daily_revenue_limit);
        Ok(Some(shop.with_counters(counters, now)))
    })
    .await;

    match result {
        Ok(LinkedWrite::Applied { shop, log }) => {
            debug!(
                shop_id = %shop.id,
                daily_revenue = %shop.daily_revenue,
                current_revenue = %shop.current_revenue,
                "Confirmed revenue accrued"
            );
            if deactivated {
                log_deactivation(&shop);
            }
            Ok(Some(log))
        }
        Ok(LinkedWrite::Declined(_) | LinkedWrite::LogRejected) => Ok(None),
        Err(AppError::NotFound(_)) => {
            warn!(shop_id = %log.target_shop_id, "Confirmed checkout for a removed target shop");
            Ok(app_state.stores.logs.apply(change).await?)
        }
        Err(e) => Err(e),
    }
}

/// Deactivate the shop if its daily revenue reached the limit.
///
/// A stale daily counter is reset first so yesterday's revenue never
/// deactivates a shop today. Calling it on an inactive shop changes nothing.
pub async fn enforce_limit(app_state: &AppState, shop_id: &str) -> AppResult<TargetShop> {
    let tz = app_state.reset_timezone();
    let mut deactivated = false;
    let shop = update_with_retry(app_state, shop_id, |shop| {
        let now = Utc::now();
        let mut counters = shop.counters();
        let was_reset = counters.reset_if_new_day(now, tz);
        deactivated = counters.enforce_limit(shop.daily_revenue_limit);
        if !was_reset && !deactivated {
            return Ok(None);
        }
        Ok(Some(shop.with_counters(counters, now)))
    })
    .await?;

    if deactivated {
        log_deactivation(&shop);
    }
    Ok(shop)
}

fn log_deactivation(shop: &TargetShop) {
    warn!(
        shop_id = %shop.id,
        shop_name = %shop.name,
        daily_revenue = %shop.daily_revenue,
        limit = ?shop.daily_revenue_limit,
        "Target shop reached its daily revenue limit, deactivated"
    );
}

/// Recompute every shop's counters from the log and re-apply the limit.
///
/// Lifetime revenue is the sum of completed checkouts. Daily revenue is the
/// sum since local midnight on the configured accrual basis. Returns the
/// shops this pass deactivated.
pub async fn reconcile_all(app_state: &AppState) -> AppResult<Vec<LimitDeactivation>> {
    let mut deactivations = Vec::new();
    for shop in app_state.stores.shops.list().await? {
        let updated = match reconcile_shop(app_state, &shop.id).await {
            Ok(Some(updated)) => updated,
            Ok(None) => continue,
            Err(AppError::NotFound(_)) => {
                debug!(shop_id = %shop.id, "Shop removed during reconciliation");
                continue;
            }
            Err(e) => return Err(e),
        };

        log_deactivation(&updated);
        if let Some(limit) = updated.daily_revenue_limit {
            deactivations.push(LimitDeactivation {
                shop_id: updated.id.clone(),
                shop_name: updated.name.clone(),
                daily_revenue: updated.daily_revenue,
                limit,
            });
        }
    }

    info!(deactivated = deactivations.len(), "Revenue reconciliation complete");
    Ok(deactivations)
}

/// Rebuild one shop from the log. The sums are taken after reading the
/// shop and the swap expects that revision, so a linked write landing in
/// between forces a fresh read. Returns the shop when this pass deactivated it.
async fn reconcile_shop(app_state: &AppState, shop_id: &str) -> AppResult<Option<TargetShop>> {
    let tz = app_state.reset_timezone();
    let daily_basis = match app_state.config.revenue_accrual {
        RevenueAccrual::OnRedirect => RevenueBasis::Redirected,
        RevenueAccrual::OnConfirmation => RevenueBasis::Completed,
    };
    let logs = &app_state.stores.logs;

    let attempts = app_state.config.cas_max_attempts.max(1);
    for attempt in 1..=attempts {
        let current = get_target(app_state, shop_id).await?;
        let now = Utc::now();
        let lifetime = logs
            .sum_revenue(shop_id, RevenueBasis::Completed, None)
            .await?;
        let today = logs
            .sum_revenue(shop_id, daily_basis, Some(start_of_day(now, tz)))
            .await?;

        let mut counters = current.counters();
        counters.reset_if_new_day(now, tz);
        counters.current_revenue = lifetime;
        counters.daily_revenue = today;
        let deactivated = counters.enforce_limit(current.daily_revenue_limit);
        if counters == current.counters() {
            return Ok(None);
        }
        let mut next = current.with_counters(counters, now);
        next.revision = current.revision + 1;

        match app_state
            .stores
            .shops
            .compare_and_swap(current.revision, next)
            .await?
        {
            CasOutcome::Applied(updated) => return Ok(deactivated.then_some(updated)),
            CasOutcome::Conflict => {
                debug!(shop_id, attempt, "Shop moved while summing its log, retrying");
                tokio::task::yield_now().await;
            }
        }
    }
    Err(contention(shop_id, attempts))
}

/// Apply the daily reset to every shop. Returns how many were reset.
pub async fn reset_all_daily_revenues(app_state: &AppState) -> AppResult<usize> {
    let tz = app_state.reset_timezone();
    let mut reset_count = 0;
    for shop in app_state.stores.shops.list().await? {
        let mut was_reset = false;
        let result = update_with_retry(app_state, &shop.id, |current| {
            let now = Utc::now();
            let mut counters = current.counters();
            was_reset = counters.reset_if_new_day(now, tz);
            if !was_reset {
                return Ok(None);
            }
            Ok(Some(current.with_counters(counters, now)))
        })
        .await;

        match result {
            Ok(_) if was_reset => reset_count += 1,
            Ok(_) | Err(AppError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    if reset_count > 0 {
        info!(reset_count, "Daily revenue reset");
    }
    Ok(reset_count)
}

/// Start of the calendar day containing `now` in `tz`, as UTC
pub fn start_of_day(now: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
    calendar_day(now, tz)
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(tz).single())
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Background task for the daily reset sweep
///
/// Disabled when the interval is 0.
pub async fn daily_reset_task(app_state: AppState) {
    let period = app_state.config.daily_reset_interval_secs;
    if period == 0 {
        return;
    }
    let mut interval = time::interval(Duration::from_secs(period));

    loop {
        interval.tick().await;

        if let Err(e) = reset_all_daily_revenues(&app_state).await {
            error!(error = %e, "Daily reset sweep failed");
        }
    }
}

/// Background task for revenue reconciliation
///
/// Disabled when the interval is 0.
pub async fn reconcile_task(app_state: AppState) {
    let period = app_state.config.reconcile_interval_secs;
    if period == 0 {
        return;
    }
    let mut interval = time::interval(Duration::from_secs(period));

    loop {
        interval.tick().await;

        if let Err(e) = reconcile_all(&app_state).await {
            error!(error = %e, "Revenue reconciliation failed");
        }
    }
}

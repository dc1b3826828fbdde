//! Rotation engine
//!
//! Picks the target shop for a checkout among the eligible shops. The mode
//! and the round-robin cursor live in the rotation repository; the cursor is
//! an unbounded counter advanced by compare-and-swap, so concurrent requests
//! never reuse a position and the eligible set may change between calls.

use rand::Rng;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::models::{RotationMode, TargetShop};
use crate::services::shop_registry;
use crate::state::AppState;

/// `eligible[index mod len]`
pub fn pick_round_robin(eligible: &[TargetShop], index: u64) -> Option<&TargetShop> {
    if eligible.is_empty() {
        return None;
    }
    let slot = (index % eligible.len() as u64) as usize;
    eligible.get(slot)
}

/// Walk the shops subtracting weights from `draw` (taken in `[0, total)`)
/// until the remainder drops to zero or below. Weight-0 shops are skipped.
/// If nothing was picked, the last positively weighted shop is returned.
pub fn pick_weighted(eligible: &[TargetShop], draw: f64) -> Option<&TargetShop> {
    let mut remainder = draw;
    let mut last_weighted = None;
    for shop in eligible.iter().filter(|s| s.weight > 0) {
        remainder -= f64::from(shop.weight);
        if remainder <= 0.0 {
            return Some(shop);
        }
        last_weighted = Some(shop);
    }
    last_weighted
}

/// First shop by creation order
pub fn pick_manual(eligible: &[TargetShop]) -> Option<&TargetShop> {
    eligible.first()
}

pub fn total_weight(eligible: &[TargetShop]) -> u64 {
    eligible.iter().map(|s| u64::from(s.weight)).sum()
}

fn draw_below(total: u64) -> f64 {
    rand::thread_rng().gen_range(0.0..total as f64)
}

pub async fn get_mode(app_state: &AppState) -> AppResult<RotationMode> {
    Ok(app_state.stores.rotation.load_or_init().await?.mode)
}

/// Accepts only `round-robin`, `weighted` or `manual`
pub async fn set_mode(app_state: &AppState, raw_mode: &str) -> AppResult<RotationMode> {
    let mode: RotationMode = raw_mode.parse().map_err(AppError::InvalidMode)?;
    let state = app_state.stores.rotation.set_mode(mode).await?;
    info!(mode = %state.mode, "Rotation mode changed");
    Ok(state.mode)
}

pub async fn reset_rotation(app_state: &AppState) -> AppResult<()> {
    app_state.stores.rotation.reset_index().await?;
    info!("Rotation cursor reset");
    Ok(())
}

/// Select a target among `eligible` according to the current mode
pub async fn select_target(app_state: &AppState, eligible: &[TargetShop]) -> AppResult<TargetShop> {
    if eligible.is_empty() {
        return Err(AppError::NoEligibleTargets);
    }

    let attempts = app_state.config.cas_max_attempts.max(1);
    for attempt in 1..=attempts {
        let state = app_state.stores.rotation.load_or_init().await?;
        match state.mode {
            RotationMode::RoundRobin => {
                let index = state.current_index;
                let Some(chosen) = pick_round_robin(eligible, index) else {
                    return Err(AppError::NoEligibleTargets);
                };
                if app_state
                    .stores
                    .rotation
                    .compare_and_set_index(index, index + 1)
                    .await?
                {
                    debug!(shop_id = %chosen.id, index, "Round-robin selection");
                    return Ok(chosen.clone());
                }
                debug!(attempt, index, "Rotation cursor moved, retrying");
                tokio::task::yield_now().await;
            }
            RotationMode::Weighted => {
                let total = total_weight(eligible);
                if total == 0 {
                    return Err(AppError::NoEligibleTargets);
                }
                let draw = draw_below(total);
                return pick_weighted(eligible, draw)
                    .cloned()
                    .ok_or(AppError::NoEligibleTargets);
            }
            RotationMode::Manual => {
                return pick_manual(eligible)
                    .cloned()
                    .ok_or(AppError::NoEligibleTargets);
            }
        }
    }
    Err(AppError::Persistence(format!(
        "contention on rotation cursor after {} attempts",
        attempts
    )))
}

/// Read the eligible set from the registry and select one target
pub async fn pick_next_target(app_state: &AppState) -> AppResult<TargetShop> {
    let eligible = shop_registry::list_eligible_targets(app_state).await?;
    select_target(app_state, &eligible).await
}

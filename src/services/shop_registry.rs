//! Target shop registry
//!
//! Read access to target shops plus the bounded compare-and-swap loop every
//! shop write goes through.

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::infrastructure::store::{CasOutcome, LinkedOutcome, LogChange};
use crate::models::{RedirectLog, TargetShop};
use crate::state::AppState;

/// Active target shops, creation order ascending.
///
/// An empty set is the expected "all shops exhausted" state and comes back
/// as [`AppError::NoEligibleTargets`].
pub async fn list_eligible_targets(app_state: &AppState) -> AppResult<Vec<TargetShop>> {
    let shops = app_state.stores.shops.list_active().await?;
    if shops.is_empty() {
        return Err(AppError::NoEligibleTargets);
    }
    Ok(shops)
}

pub async fn get_target(app_state: &AppState, shop_id: &str) -> AppResult<TargetShop> {
    app_state
        .stores
        .shops
        .get(shop_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("target shop {}", shop_id)))
}

/// Read-modify-write a shop with optimistic concurrency.
///
/// `modify` sees the latest stored shop and returns the replacement, or
/// `None` to leave it untouched. It runs again after every lost race, at
/// most `cas_max_attempts` times, then the call fails as a persistence error.
pub async fn update_with_retry<F>(
    app_state: &AppState,
    shop_id: &str,
    mut modify: F,
) -> AppResult<TargetShop>
where
    F: FnMut(&TargetShop) -> AppResult<Option<TargetShop>>,
{
    let attempts = app_state.config.cas_max_attempts.max(1);
    for attempt in 1..=attempts {
        let current = get_target(app_state, shop_id).await?;
        let Some(mut next) = modify(&current)? else {
            return Ok(current);
        };
        next.revision = current.revision + 1;

        match app_state
            .stores
            .shops
            .compare_and_swap(current.revision, next)
            .await?
        {
            CasOutcome::Applied(stored) => return Ok(stored),
            CasOutcome::Conflict => {
                debug!(shop_id, attempt, "Shop revision moved, retrying");
                tokio::task::yield_now().await;
            }
        }
    }
    Err(contention(shop_id, attempts))
}

pub(crate) fn contention(shop_id: &str, attempts: u32) -> AppError {
    AppError::Persistence(format!(
        "contention on target shop {} after {} attempts",
        shop_id, attempts
    ))
}

/// Outcome of [`update_with_log`]
#[derive(Debug)]
pub enum LinkedWrite {
    Applied { shop: TargetShop, log: RedirectLog },
    /// `modify` returned `None`; nothing was written
    Declined(TargetShop),
    /// The log was not in the state `change` needs; nothing was written
    LogRejected,
}

/// [`update_with_retry`] for counter changes that must land together with
/// a redirect log change
pub async fn update_with_log<F>(
    app_state: &AppState,
    shop_id: &str,
    change: LogChange,
    mut modify: F,
) -> AppResult<LinkedWrite>
where
    F: FnMut(&TargetShop) -> AppResult<Option<TargetShop>>,
{
    let attempts = app_state.config.cas_max_attempts.max(1);
    for attempt in 1..=attempts {
        let current = get_target(app_state, shop_id).await?;
        let Some(mut next) = modify(&current)? else {
            return Ok(LinkedWrite::Declined(current));
        };
        next.revision = current.revision + 1;

        match app_state
            .stores
            .shops
            .compare_and_swap_with_log(current.revision, next, change.clone())
            .await?
        {
            LinkedOutcome::Applied { shop, log } => return Ok(LinkedWrite::Applied { shop, log }),
            LinkedOutcome::LogRejected => return Ok(LinkedWrite::LogRejected),
            LinkedOutcome::Conflict => {
                debug!(shop_id, attempt, log_id = change.log_id(), "Shop revision moved, retrying");
                tokio::task::yield_now().await;
            }
        }
    }
    Err(contention(shop_id, attempts))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::config::Config;
    use crate::error::StoreResult;
    use crate::infrastructure::store::{MemoryStore, ShopRepository, Stores};
    use crate::test_support::{ScriptedGateway, target};

    /// Shop store whose writes always lose the race
    struct AlwaysStale {
        shop: TargetShop,
        swaps: AtomicU32,
    }

    #[async_trait]
    impl ShopRepository for AlwaysStale {
        async fn insert(&self, shop: TargetShop) -> StoreResult<TargetShop> {
            Ok(shop)
        }
        async fn get(&self, _id: &str) -> StoreResult<Option<TargetShop>> {
            Ok(Some(self.shop.clone()))
        }
        async fn list(&self) -> StoreResult<Vec<TargetShop>> {
            Ok(vec![self.shop.clone()])
        }
        async fn compare_and_swap(
            &self,
            _expected_revision: u64,
            _next: TargetShop,
        ) -> StoreResult<CasOutcome<TargetShop>> {
            self.swaps.fetch_add(1, Ordering::SeqCst);
            Ok(CasOutcome::Conflict)
        }
        async fn compare_and_swap_with_log(
            &self,
            _expected_revision: u64,
            _next: TargetShop,
            _change: LogChange,
        ) -> StoreResult<LinkedOutcome> {
            self.swaps.fetch_add(1, Ordering::SeqCst);
            Ok(LinkedOutcome::Conflict)
        }
        async fn delete(&self, _id: &str) -> StoreResult<bool> {
            Ok(false)
        }
    }

    fn always_stale() -> Arc<AlwaysStale> {
        Arc::new(AlwaysStale {
            shop: target("t1", Utc::now()),
            swaps: AtomicU32::new(0),
        })
    }

    fn state_with(shops: Arc<dyn ShopRepository>) -> AppState {
        let mut stores = Stores::in_memory();
        stores.shops = shops;
        let config = Config {
            cas_max_attempts: 3,
            ..Config::default()
        };
        AppState::with_components(config, stores, Arc::new(ScriptedGateway::succeeding()))
    }

    #[tokio::test]
    async fn empty_eligible_set_is_a_typed_outcome() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let err = list_eligible_targets(&state).await.unwrap_err();
        assert!(matches!(err, AppError::NoEligibleTargets));
    }

    #[tokio::test]
    async fn inactive_shops_are_not_eligible() {
        let store = Arc::new(MemoryStore::new());
        let mut paused = target("t1", Utc::now());
        paused.active = false;
        store.insert(paused).await.unwrap();
        let state = state_with(store);
        assert!(matches!(
            list_eligible_targets(&state).await,
            Err(AppError::NoEligibleTargets)
        ));
    }

    #[tokio::test]
    async fn contention_gives_up_after_bounded_attempts() {
        let stale = always_stale();
        let state = state_with(stale.clone());

        let err = update_with_retry(&state, "t1", |s| {
            let mut next = s.clone();
            next.daily_revenue += Decimal::ONE;
            Ok(Some(next))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Persistence(_)));
        assert_eq!(stale.swaps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unchanged_shop_skips_the_write() {
        let stale = always_stale();
        let state = state_with(stale.clone());

        let current = update_with_retry(&state, "t1", |_| Ok(None)).await.unwrap();
        assert_eq!(current.id, "t1");
        assert_eq!(stale.swaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn linked_contention_writes_no_log() {
        let stale = always_stale();
        let state = state_with(stale.clone());
        let log = RedirectLog::reserved(
            "log-1".into(),
            "src",
            "t1",
            Decimal::ONE,
            Vec::new(),
            Utc::now(),
        );

        let err = update_with_log(&state, "t1", LogChange::Append(log), |s| Ok(Some(s.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert_eq!(stale.swaps.load(Ordering::SeqCst), 3);
        assert!(state.stores.logs.get("log-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn declined_linked_write_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.insert(target("t1", Utc::now())).await.unwrap();
        let state = state_with(store);
        let log = RedirectLog::reserved(
            "log-1".into(),
            "src",
            "t1",
            Decimal::ONE,
            Vec::new(),
            Utc::now(),
        );

        let outcome = update_with_log(&state, "t1", LogChange::Append(log), |_| Ok(None))
            .await
            .unwrap();
        assert!(matches!(outcome, LinkedWrite::Declined(ref shop) if shop.revision == 0));
        assert!(state.stores.logs.get("log-1").await.unwrap().is_none());
    }
}

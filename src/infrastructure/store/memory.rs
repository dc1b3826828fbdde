//! In-process store
//!
//! One mutex guards all records, so each trait call is atomic on its own.
//! Used by tests and by `STORE_BACKEND=memory` single-instance deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    CasOutcome, LinkedOutcome, LogChange, RedirectLogRepository, RotationStateRepository,
    ShopRepository, SourceShopRepository, counts_as_revenue,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    LogFilter, NewRedirectLog, RedirectLog, RevenueBasis, RotationMode, RotationState,
    SourceShop, TargetAggregate, TargetShop, TimeWindow,
};

#[derive(Default)]
struct Inner {
    shops: HashMap<String, TargetShop>,
    /// Insertion order doubles as creation order
    shop_order: Vec<String>,
    sources: HashMap<String, SourceShop>,
    source_order: Vec<String>,
    /// Append order
    logs: Vec<RedirectLog>,
    rotation: Option<RotationState>,
}

impl Inner {
    /// Apply `change` if the log is in the state it needs
    fn apply_log_change(&mut self, change: &LogChange) -> Option<RedirectLog> {
        let position = self.logs.iter().position(|l| l.id == change.log_id());
        if !change.applies_to(position.map(|i| &self.logs[i])) {
            return None;
        }
        match (change, position) {
            (LogChange::Append(log), _) => {
                self.logs.push(log.clone());
                Some(log.clone())
            }
            (_, Some(i)) => {
                change.apply_to(&mut self.logs[i]);
                Some(self.logs[i].clone())
            }
            (_, None) => None,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ShopRepository for MemoryStore {
    async fn insert(&self, shop: TargetShop) -> StoreResult<TargetShop> {
        let mut inner = self.lock()?;
        if inner.shops.values().any(|s| s.domain == shop.domain) {
            return Err(StoreError::Duplicate(format!("target shop {}", shop.domain)));
        }
        inner.shop_order.push(shop.id.clone());
        inner.shops.insert(shop.id.clone(), shop.clone());
        Ok(shop)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<TargetShop>> {
        Ok(self.lock()?.shops.get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<TargetShop>> {
        let inner = self.lock()?;
        Ok(inner
            .shop_order
            .iter()
            .filter_map(|id| inner.shops.get(id).cloned())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: TargetShop,
    ) -> StoreResult<CasOutcome<TargetShop>> {
        let mut inner = self.lock()?;
        let domain_taken = inner
            .shops
            .values()
            .any(|s| s.id != next.id && s.domain == next.domain);
        let current = inner
            .shops
            .get_mut(&next.id)
            .ok_or_else(|| StoreError::NotFound(format!("target shop {}", next.id)))?;
        if current.revision != expected_revision {
            return Ok(CasOutcome::Conflict);
        }
        if domain_taken {
            return Err(StoreError::Duplicate(format!("target shop {}", next.domain)));
        }
        *current = next.clone();
        Ok(CasOutcome::Applied(next))
    }

    async fn compare_and_swap_with_log(
        &self,
        expected_revision: u64,
        next: TargetShop,
        change: LogChange,
    ) -> StoreResult<LinkedOutcome> {
        let mut inner = self.lock()?;
        let current = inner
            .shops
            .get(&next.id)
            .ok_or_else(|| StoreError::NotFound(format!("target shop {}", next.id)))?;
        if current.revision != expected_revision {
            return Ok(LinkedOutcome::Conflict);
        }
        let Some(log) = inner.apply_log_change(&change) else {
            return Ok(LinkedOutcome::LogRejected);
        };
        inner.shops.insert(next.id.clone(), next.clone());
        Ok(LinkedOutcome::Applied { shop: next, log })
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let removed = inner.shops.remove(id).is_some();
        inner.shop_order.retain(|s| s != id);
        Ok(removed)
    }
}

#[async_trait]
impl SourceShopRepository for MemoryStore {
    async fn insert(&self, shop: SourceShop) -> StoreResult<SourceShop> {
        let mut inner = self.lock()?;
        if inner.sources.values().any(|s| s.domain == shop.domain) {
            return Err(StoreError::Duplicate(format!("source shop {}", shop.domain)));
        }
        inner.source_order.push(shop.id.clone());
        inner.sources.insert(shop.id.clone(), shop.clone());
        Ok(shop)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<SourceShop>> {
        Ok(self.lock()?.sources.get(id).cloned())
    }

    async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<SourceShop>> {
        Ok(self
            .lock()?
            .sources
            .values()
            .find(|s| s.api_key == api_key)
            .cloned())
    }

    async fn list(&self) -> StoreResult<Vec<SourceShop>> {
        let inner = self.lock()?;
        Ok(inner
            .source_order
            .iter()
            .filter_map(|id| inner.sources.get(id).cloned())
            .collect())
    }

    async fn update(&self, shop: SourceShop) -> StoreResult<SourceShop> {
        let mut inner = self.lock()?;
        let current = inner
            .sources
            .get_mut(&shop.id)
            .ok_or_else(|| StoreError::NotFound(format!("source shop {}", shop.id)))?;
        *current = shop.clone();
        Ok(shop)
    }
}

#[async_trait]
impl RedirectLogRepository for MemoryStore {
    async fn append(&self, log: NewRedirectLog) -> StoreResult<RedirectLog> {
        let log = RedirectLog::from_new(Uuid::new_v4().to_string(), log, Utc::now());
        self.lock()?.logs.push(log.clone());
        Ok(log)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<RedirectLog>> {
        Ok(self.lock()?.logs.iter().find(|l| l.id == id).cloned())
    }

    async fn list(&self, filter: &LogFilter) -> StoreResult<Vec<RedirectLog>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .rev()
            .filter(|l| filter.matches(l))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn find_pending_by_cart_token(&self, cart_token: &str) -> StoreResult<Option<RedirectLog>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .rev()
            .find(|l| l.is_pending() && l.cart_token.as_deref() == Some(cart_token))
            .cloned())
    }

    async fn latest_pending(&self) -> StoreResult<Option<RedirectLog>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .rev()
            .find(|l| l.is_pending())
            .cloned())
    }

    async fn apply(&self, change: LogChange) -> StoreResult<Option<RedirectLog>> {
        Ok(self.lock()?.apply_log_change(&change))
    }

    async fn sum_revenue(
        &self,
        target_shop_id: &str,
        basis: RevenueBasis,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Decimal> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|l| l.target_shop_id == target_shop_id && counts_as_revenue(l, basis, since))
            .map(|l| l.cart_total)
            .sum())
    }

    async fn aggregate_by_target(&self, window: TimeWindow) -> StoreResult<Vec<TargetAggregate>> {
        let inner = self.lock()?;
        let mut by_target: BTreeMap<&str, TargetAggregate> = BTreeMap::new();
        for log in inner.logs.iter().filter(|l| window.contains(l.created_at)) {
            let entry = by_target
                .entry(log.target_shop_id.as_str())
                .or_insert_with(|| TargetAggregate {
                    target_shop_id: log.target_shop_id.clone(),
                    total_redirections: 0,
                    successful_redirections: 0,
                    completed_checkouts: 0,
                    total_revenue: Decimal::ZERO,
                });
            entry.total_redirections += 1;
            if log.success {
                entry.successful_redirections += 1;
            }
            if log.completed {
                entry.completed_checkouts += 1;
                entry.total_revenue = entry.total_revenue.saturating_add(log.cart_total);
            }
        }
        Ok(by_target.into_values().collect())
    }
}

#[async_trait]
impl RotationStateRepository for MemoryStore {
    async fn load_or_init(&self) -> StoreResult<RotationState> {
        let mut inner = self.lock()?;
        Ok(*inner.rotation.get_or_insert_with(RotationState::default))
    }

    async fn set_mode(&self, mode: RotationMode) -> StoreResult<RotationState> {
        let mut inner = self.lock()?;
        let state = inner.rotation.get_or_insert_with(RotationState::default);
        state.mode = mode;
        Ok(*state)
    }

    async fn compare_and_set_index(&self, expected: u64, next: u64) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let state = inner.rotation.get_or_insert_with(RotationState::default);
        if state.current_index != expected {
            return Ok(false);
        }
        state.current_index = next;
        Ok(true)
    }

    async fn reset_index(&self) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner
            .rotation
            .get_or_insert_with(RotationState::default)
            .current_index = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::Settlement;
    use crate::models::CartItem;

    fn shop(id: &str, domain: &str) -> TargetShop {
        let now = Utc::now();
        TargetShop {
            id: id.into(),
            name: id.into(),
            domain: domain.into(),
            access_token: "token".into(),
            active: true,
            weight: 1,
            daily_revenue_limit: None,
            current_revenue: Decimal::ZERO,
            daily_revenue: Decimal::ZERO,
            last_reset_date: now,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    fn new_log(target: &str, total: i64, success: bool) -> NewRedirectLog {
        NewRedirectLog {
            source_shop_id: "src".into(),
            target_shop_id: target.into(),
            cart_total: Decimal::from(total),
            cart_items: vec![CartItem {
                variant_id: "1".into(),
                quantity: 1,
                price: Decimal::from(total),
                title: None,
                image: None,
            }],
            success,
            checkout_url: None,
            cart_token: Some(format!("tok-{}-{}", target, total)),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_domains() {
        let store = MemoryStore::new();
        ShopRepository::insert(&store, shop("a", "a.example")).await.unwrap();
        let err = ShopRepository::insert(&store, shop("b", "a.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn compare_and_swap_detects_stale_revision() {
        let store = MemoryStore::new();
        let original = ShopRepository::insert(&store, shop("a", "a.example")).await.unwrap();

        let mut first = original.clone();
        first.revision = 1;
        first.daily_revenue = Decimal::from(5);
        assert!(matches!(
            store.compare_and_swap(0, first).await.unwrap(),
            CasOutcome::Applied(_)
        ));

        let mut stale = original;
        stale.revision = 1;
        assert_eq!(store.compare_and_swap(0, stale).await.unwrap(), CasOutcome::Conflict);

        let stored = ShopRepository::get(&store, "a").await.unwrap().unwrap();
        assert_eq!(stored.daily_revenue, Decimal::from(5));
    }

    #[tokio::test]
    async fn lists_in_creation_order() {
        let store = MemoryStore::new();
        for (id, domain) in [("c", "c.example"), ("a", "a.example"), ("b", "b.example")] {
            ShopRepository::insert(&store, shop(id, domain)).await.unwrap();
        }
        let ids: Vec<String> = ShopRepository::list(&store)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn rotation_cursor_only_advances_from_expected_value() {
        let store = MemoryStore::new();
        assert_eq!(store.load_or_init().await.unwrap(), RotationState::default());
        assert!(store.compare_and_set_index(0, 1).await.unwrap());
        assert!(!store.compare_and_set_index(0, 1).await.unwrap());
        assert_eq!(store.load_or_init().await.unwrap().current_index, 1);
        store.reset_index().await.unwrap();
        assert_eq!(store.load_or_init().await.unwrap().current_index, 0);
    }

    #[tokio::test]
    async fn completion_is_write_once() {
        let store = MemoryStore::new();
        let log = store.append(new_log("a", 20, true)).await.unwrap();
        let now = Utc::now();

        let done = store.mark_completed(&log.id, "order-1", now).await.unwrap().unwrap();
        assert!(done.completed);
        assert_eq!(done.order_id.as_deref(), Some("order-1"));
        assert!(store.mark_completed(&log.id, "order-2", now).await.unwrap().is_none());
        assert!(store.latest_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregates_group_by_target_id() {
        let store = MemoryStore::new();
        let first = store.append(new_log("a", 20, true)).await.unwrap();
        store.append(new_log("a", 30, true)).await.unwrap();
        store.append(new_log("b", 5, false)).await.unwrap();
        store
            .append(new_log(crate::models::UNKNOWN_TARGET, 7, false))
            .await
            .unwrap();
        store.mark_completed(&first.id, "o", Utc::now()).await.unwrap();

        let rows = store.aggregate_by_target(TimeWindow::default()).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.target_shop_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "unknown"]);
        assert_eq!(rows[0].total_redirections, 2);
        assert_eq!(rows[0].successful_redirections, 2);
        assert_eq!(rows[0].completed_checkouts, 1);
        assert_eq!(rows[0].total_revenue, Decimal::from(20));
        assert_eq!(rows[1].successful_redirections, 0);
        assert_eq!(rows[2].total_redirections, 1);
    }

    #[tokio::test]
    async fn linked_write_needs_both_revision_and_log_state() {
        let store = MemoryStore::new();
        let original = ShopRepository::insert(&store, shop("a", "a.example")).await.unwrap();
        let log = RedirectLog::reserved(
            "log-1".into(),
            "src",
            "a",
            Decimal::from(20),
            Vec::new(),
            Utc::now(),
        );

        let mut next = original.clone();
        next.revision = 1;
        next.daily_revenue = Decimal::from(20);
        let applied = store
            .compare_and_swap_with_log(0, next.clone(), LogChange::Append(log.clone()))
            .await
            .unwrap();
        assert!(matches!(applied, LinkedOutcome::Applied { .. }));

        // stale revision: neither the shop nor the log moves
        let mut stale = original.clone();
        stale.revision = 1;
        let settle = LogChange::Settle {
            id: "log-1".into(),
            settlement: Settlement::Checkout {
                checkout_url: "https://a.example/checkouts/1".into(),
                cart_token: "c1".into(),
            },
        };
        assert_eq!(
            store
                .compare_and_swap_with_log(0, stale, settle.clone())
                .await
                .unwrap(),
            LinkedOutcome::Conflict
        );
        assert!(RedirectLogRepository::get(&store, "log-1").await.unwrap().unwrap().in_flight);

        // appending the same id twice is rejected and leaves the shop alone
        let mut again = next.clone();
        again.revision = 2;
        again.daily_revenue = Decimal::from(40);
        assert_eq!(
            store
                .compare_and_swap_with_log(1, again, LogChange::Append(log))
                .await
                .unwrap(),
            LinkedOutcome::LogRejected
        );
        let stored = ShopRepository::get(&store, "a").await.unwrap().unwrap();
        assert_eq!(stored.daily_revenue, Decimal::from(20));
        assert_eq!(stored.revision, 1);

        let settled = store.apply(settle.clone()).await.unwrap().unwrap();
        assert!(!settled.in_flight);
        assert_eq!(settled.cart_token.as_deref(), Some("c1"));
        assert!(store.apply(settle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_flight_logs_cannot_be_confirmed() {
        let store = MemoryStore::new();
        let log = RedirectLog::reserved(
            "log-1".into(),
            "src",
            "a",
            Decimal::from(20),
            Vec::new(),
            Utc::now(),
        );
        store.apply(LogChange::Append(log)).await.unwrap().unwrap();

        assert!(store.latest_pending().await.unwrap().is_none());
        assert!(store.mark_completed("log-1", "o", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sums_revenue_by_basis() {
        let store = MemoryStore::new();
        let first = store.append(new_log("a", 20, true)).await.unwrap();
        store.append(new_log("a", 30, true)).await.unwrap();
        store.append(new_log("a", 99, false)).await.unwrap();
        store.mark_completed(&first.id, "o", Utc::now()).await.unwrap();

        let redirected = store.sum_revenue("a", RevenueBasis::Redirected, None).await.unwrap();
        let completed = store.sum_revenue("a", RevenueBasis::Completed, None).await.unwrap();
        assert_eq!(redirected, Decimal::from(50));
        assert_eq!(completed, Decimal::from(20));
    }
}

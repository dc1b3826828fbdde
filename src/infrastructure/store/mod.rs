//! Persistence adapters
//!
//! The core only talks to these traits. Every write to a target shop is a
//! compare-and-swap on its `revision`, and the rotation cursor advances by
//! compare-and-swap on `current_index`, so callers can build atomic
//! read-modify-write loops on top of any backend.
//!
//! Revenue counters move together with the log entry that justifies them
//! ([`ShopRepository::compare_and_swap_with_log`]). Any log change that
//! affects a shop's revenue sums therefore also bumps that shop's revision.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::StoreResult;
use crate::models::{
    LogFilter, NewRedirectLog, RedirectLog, RevenueBasis, RotationMode, RotationState,
    SourceShop, TargetAggregate, TargetShop, TimeWindow,
};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Result of a compare-and-swap write
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
    Applied(T),
    /// The record moved on since it was read
    Conflict,
}

/// Gateway answer recorded on an in-flight log
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Checkout {
        checkout_url: String,
        cart_token: String,
    },
    Failed {
        fallback_url: String,
        error_message: String,
    },
}

/// A change to one redirect log
#[derive(Debug, Clone, PartialEq)]
pub enum LogChange {
    /// Store a new log; its id must be unused
    Append(RedirectLog),
    /// Record the gateway answer; only applies while the log is in flight
    Settle { id: String, settlement: Settlement },
    /// Confirm the checkout; only applies while the log is pending
    Complete {
        id: String,
        order_id: String,
        completed_at: DateTime<Utc>,
    },
}

impl LogChange {
    pub fn log_id(&self) -> &str {
        match self {
            LogChange::Append(log) => &log.id,
            LogChange::Settle { id, .. } | LogChange::Complete { id, .. } => id,
        }
    }

    /// Whether the change may be applied to `existing`
    pub(crate) fn applies_to(&self, existing: Option<&RedirectLog>) -> bool {
        match (self, existing) {
            (LogChange::Append(_), None) => true,
            (LogChange::Settle { .. }, Some(log)) => log.in_flight && !log.completed,
            (LogChange::Complete { .. }, Some(log)) => !log.completed && !log.in_flight,
            _ => false,
        }
    }

    /// Apply a `Settle` or `Complete` change to `log`
    pub(crate) fn apply_to(&self, log: &mut RedirectLog) {
        match self {
            LogChange::Append(new) => *log = new.clone(),
            LogChange::Settle { settlement, .. } => {
                log.in_flight = false;
                match settlement {
                    Settlement::Checkout {
                        checkout_url,
                        cart_token,
                    } => {
                        log.checkout_url = Some(checkout_url.clone());
                        log.cart_token = Some(cart_token.clone());
                    }
                    Settlement::Failed {
                        fallback_url,
                        error_message,
                    } => {
                        log.success = false;
                        log.checkout_url = Some(fallback_url.clone());
                        log.error_message = Some(error_message.clone());
                    }
                }
            }
            LogChange::Complete {
                order_id,
                completed_at,
                ..
            } => {
                log.completed = true;
                log.completed_at = Some(*completed_at);
                log.order_id = Some(order_id.clone());
            }
        }
    }
}

/// Result of a shop swap bundled with a log change
#[derive(Debug, Clone, PartialEq)]
pub enum LinkedOutcome {
    Applied { shop: TargetShop, log: RedirectLog },
    /// The shop revision moved on; nothing was written
    Conflict,
    /// The log is missing or not in the state the change needs; nothing was written
    LogRejected,
}

#[async_trait]
pub trait ShopRepository: Send + Sync {
    /// Fails with `Duplicate` when the domain is already registered
    async fn insert(&self, shop: TargetShop) -> StoreResult<TargetShop>;
    async fn get(&self, id: &str) -> StoreResult<Option<TargetShop>>;
    /// All shops, creation time ascending
    async fn list(&self) -> StoreResult<Vec<TargetShop>>;
    /// Active shops, creation time ascending
    async fn list_active(&self) -> StoreResult<Vec<TargetShop>> {
        Ok(self.list().await?.into_iter().filter(|s| s.active).collect())
    }
    /// Replace the record if its stored revision still equals `expected_revision`.
    /// `next.revision` must be `expected_revision + 1`.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: TargetShop,
    ) -> StoreResult<CasOutcome<TargetShop>>;
    /// Counter-only swap committed atomically with `change`. Neither is
    /// written unless both the revision and the log state match.
    async fn compare_and_swap_with_log(
        &self,
        expected_revision: u64,
        next: TargetShop,
        change: LogChange,
    ) -> StoreResult<LinkedOutcome>;
    async fn delete(&self, id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait SourceShopRepository: Send + Sync {
    async fn insert(&self, shop: SourceShop) -> StoreResult<SourceShop>;
    async fn get(&self, id: &str) -> StoreResult<Option<SourceShop>>;
    async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<SourceShop>>;
    /// Creation time ascending
    async fn list(&self) -> StoreResult<Vec<SourceShop>>;
    async fn update(&self, shop: SourceShop) -> StoreResult<SourceShop>;
}

#[async_trait]
pub trait RedirectLogRepository: Send + Sync {
    async fn append(&self, log: NewRedirectLog) -> StoreResult<RedirectLog>;
    async fn get(&self, id: &str) -> StoreResult<Option<RedirectLog>>;
    /// Newest first
    async fn list(&self, filter: &LogFilter) -> StoreResult<Vec<RedirectLog>>;
    async fn find_pending_by_cart_token(&self, cart_token: &str) -> StoreResult<Option<RedirectLog>>;
    /// Most recent log not yet completed and without an order id
    async fn latest_pending(&self) -> StoreResult<Option<RedirectLog>>;
    /// Apply `change` on its own. `None` when the log is not in the state
    /// the change needs.
    async fn apply(&self, change: LogChange) -> StoreResult<Option<RedirectLog>>;
    /// Set `completed`, `completed_at` and `order_id` once.
    /// `None` when the log is missing, in flight or already completed.
    async fn mark_completed(
        &self,
        id: &str,
        order_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<Option<RedirectLog>> {
        self.apply(LogChange::Complete {
            id: id.to_string(),
            order_id: order_id.to_string(),
            completed_at,
        })
        .await
    }
    /// Sum of cart totals for one target on the given basis, counting logs
    /// from `since` on (creation time for `Redirected`, completion time for
    /// `Completed`)
    async fn sum_revenue(
        &self,
        target_shop_id: &str,
        basis: RevenueBasis,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Decimal>;
    /// Redirections, successes, completions and completed revenue per target
    /// over the window, ordered by target id. Unplaced attempts come back
    /// under the unknown-target sentinel.
    async fn aggregate_by_target(&self, window: TimeWindow) -> StoreResult<Vec<TargetAggregate>>;
}

#[async_trait]
pub trait RotationStateRepository: Send + Sync {
    /// Read the singleton, creating it with defaults on first access
    async fn load_or_init(&self) -> StoreResult<RotationState>;
    async fn set_mode(&self, mode: RotationMode) -> StoreResult<RotationState>;
    /// Advance the cursor only if it still equals `expected`
    async fn compare_and_set_index(&self, expected: u64, next: u64) -> StoreResult<bool>;
    async fn reset_index(&self) -> StoreResult<()>;
}

/// Repository handles injected into the application state
#[derive(Clone)]
pub struct Stores {
    pub shops: Arc<dyn ShopRepository>,
    pub sources: Arc<dyn SourceShopRepository>,
    pub logs: Arc<dyn RedirectLogRepository>,
    pub rotation: Arc<dyn RotationStateRepository>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }

    pub async fn redis(redis_url: &str) -> StoreResult<Self> {
        Ok(Self::from_backend(Arc::new(RedisStore::connect(redis_url).await?)))
    }

    fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ShopRepository
            + SourceShopRepository
            + RedirectLogRepository
            + RotationStateRepository
            + 'static,
    {
        Self {
            shops: backend.clone(),
            sources: backend.clone(),
            logs: backend.clone(),
            rotation: backend,
        }
    }
}

/// Whether `log` counts toward revenue on `basis` from `since` on
pub(crate) fn counts_as_revenue(
    log: &RedirectLog,
    basis: RevenueBasis,
    since: Option<DateTime<Utc>>,
) -> bool {
    match basis {
        RevenueBasis::Redirected => {
            log.success && since.is_none_or(|since| log.created_at >= since)
        }
        RevenueBasis::Completed => match log.completed_at {
            Some(at) => log.completed && since.is_none_or(|since| at >= since),
            None => false,
        },
    }
}

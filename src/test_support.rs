//! Fixtures shared by unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::Config;
use crate::error::GatewayError;
use crate::infrastructure::gateway::CheckoutGateway;
use crate::infrastructure::store::Stores;
use crate::models::{CartItem, CheckoutReference, SourceShop, TargetShop};
use crate::state::AppState;

/// Gateway that answers from a fixed script
pub struct ScriptedGateway {
    pub fail_with: Option<GatewayError>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn succeeding() -> Self {
        Self {
            fail_with: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: GatewayError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::succeeding()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl CheckoutGateway for ScriptedGateway {
    async fn create_checkout(
        &self,
        target: &TargetShop,
        _items: &[CartItem],
    ) -> Result<CheckoutReference, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(CheckoutReference {
            cart_id: format!("gid://shopify/Cart/cart-{}?key=k", n),
            checkout_url: format!("https://{}/checkouts/cart-{}", target.domain, n),
        })
    }
}

pub fn state(config: Config, gateway: ScriptedGateway) -> AppState {
    AppState::with_components(config, Stores::in_memory(), Arc::new(gateway))
}

pub fn default_state() -> AppState {
    state(Config::default(), ScriptedGateway::succeeding())
}

pub fn target(id: &str, created_at: DateTime<Utc>) -> TargetShop {
    TargetShop {
        id: id.into(),
        name: format!("Shop {}", id),
        domain: format!("{}.example", id),
        access_token: "storefront-token".into(),
        active: true,
        weight: 1,
        daily_revenue_limit: None,
        current_revenue: Decimal::ZERO,
        daily_revenue: Decimal::ZERO,
        last_reset_date: created_at,
        created_at,
        updated_at: created_at,
        revision: 0,
    }
}

pub async fn insert_target(app_state: &AppState, shop: TargetShop) -> TargetShop {
    app_state.stores.shops.insert(shop).await.unwrap()
}

pub async fn insert_source(app_state: &AppState, api_key: &str, active: bool) -> SourceShop {
    app_state
        .stores
        .sources
        .insert(SourceShop {
            id: format!("src-{}", api_key),
            name: "Source".into(),
            domain: format!("{}.source.example", api_key),
            api_key: api_key.into(),
            active,
            created_at: Utc::now(),
        })
        .await
        .unwrap()
}

pub fn item(price: i64, quantity: i64) -> CartItem {
    CartItem {
        variant_id: "4410".into(),
        quantity,
        price: Decimal::from(price),
        title: Some("Item".into()),
        image: None,
    }
}

//! Application state management
//!
//! This module defines the application state shared across all handlers and
//! services: configuration, the injected repositories and the checkout
//! gateway. The rotation singleton lives behind the rotation repository,
//! never in process memory, so several instances can share one store.

use std::sync::Arc;

use chrono::FixedOffset;

use crate::config::{Config, StoreBackend};
use crate::error::StoreResult;
use crate::infrastructure::gateway::{CheckoutGateway, StorefrontGateway};
use crate::infrastructure::store::Stores;

/// Global application state
///
/// Cheaply cloneable; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub stores: Stores,
    pub gateway: Arc<dyn CheckoutGateway>,
}

impl AppState {
    /// Build the state for the configured backend with the storefront gateway
    pub async fn new(config: Config) -> StoreResult<Self> {
        let stores = match config.store_backend {
            StoreBackend::Redis => Stores::redis(&config.redis_url).await?,
            StoreBackend::Memory => Stores::in_memory(),
        };
        let gateway = Arc::new(StorefrontGateway::new(config.storefront_api_version.clone()));
        Ok(Self::with_components(config, stores, gateway))
    }

    pub fn with_components(
        config: Config,
        stores: Stores,
        gateway: Arc<dyn CheckoutGateway>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            stores,
            gateway,
        }
    }

    pub fn reset_timezone(&self) -> FixedOffset {
        self.config.reset_timezone()
    }
}

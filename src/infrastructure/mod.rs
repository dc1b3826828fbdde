//! Infrastructure layer
//!
//! External dependencies: persistence adapters, the storefront checkout
//! gateway, the shared HTTP client and logging setup.

pub mod gateway;
pub mod http_client;
pub mod logger;
pub mod store;

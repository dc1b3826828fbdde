//! Checkout Rotator Library
//!
//! This library provides all the core functionality for the checkout
//! redirection service. It can be used independently of the main binary for
//! testing or integration into other applications.

pub mod config;
pub mod error;
pub mod extractor;
pub mod handlers;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{ApiResponse, AppError, AppResult};
pub use handlers::create_router;
pub use models::*;
pub use state::AppState;

//! Business logic services
//!
//! This module contains all the business logic of the application.
//! Services orchestrate domain operations and coordinate with infrastructure
//! through the repositories and the gateway held in [`crate::state::AppState`].

pub mod redirect_service;
pub mod revenue_service;
pub mod rotation_service;
pub mod shop_registry;
pub mod shop_service;
pub mod stats_service;
pub mod webhook_service;

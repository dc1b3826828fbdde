//! Unified error handling
//!
//! - [`AppError`] - every failure the service can surface
//! - [`ApiResponse`] - the `{success, data, error}` JSON envelope
//! - [`StoreError`] - persistence adapter errors, converted into `AppError`
//! - [`GatewayError`] - checkout gateway errors, answered with a degraded redirect
//!
//! | Variant | Status |
//! |---------|--------|
//! | `InvalidInput`, `InvalidMode`, `InvalidCart` | 400 |
//! | `UnknownOrInactiveSource` | 403 |
//! | `NotFound`, `NoEligibleTargets` | 404 |
//! | `Conflict` | 409 |
//! | `Persistence` | 500 |

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

/// API response envelope
///
/// ```json
/// { "success": true, "data": { ... } }
/// { "success": false, "error": "..." }
/// ```
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.into()),
        })
    }

    pub fn empty() -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            error: None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // ========== Rejected input (4xx) ==========
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid rotation mode: {0}")]
    InvalidMode(String),

    #[error("Invalid cart: {0}")]
    InvalidCart(String),

    #[error("Unknown or inactive source shop")]
    UnknownOrInactiveSource,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    // ========== Operational states ==========
    #[error("No eligible target shop available")]
    NoEligibleTargets,

    // ========== Faults (5xx) ==========
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::InvalidMode(_) | AppError::InvalidCart(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::UnknownOrInactiveSource => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::NoEligibleTargets => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Persistence(msg) => {
                error!(target: "persistence", error = %msg, "Persistence failure");
                "Persistence failure".to_string()
            }
            other => other.to_string(),
        };
        (status, ApiResponse::failure(message)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Duplicate(what) => AppError::Conflict(what),
            other => AppError::Persistence(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Persistence adapter errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Checkout gateway errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Storefront API error: {0}")]
    Status(u16),

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("Cart creation rejected: {0}")]
    UserErrors(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_app_taxonomy() {
        assert!(matches!(
            AppError::from(StoreError::Duplicate("shop.example".into())),
            AppError::Conflict(_)
        ));
        assert!(matches!(
            AppError::from(StoreError::NotFound("shop 1".into())),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            AppError::from(StoreError::Backend("connection reset".into())),
            AppError::Persistence(_)
        ));
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(AppError::InvalidMode("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NoEligibleTargets.status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::UnknownOrInactiveSource.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Persistence("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

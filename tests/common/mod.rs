#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use checkout_rotator::config::Config;
use checkout_rotator::error::GatewayError;
use checkout_rotator::infrastructure::gateway::CheckoutGateway;
use checkout_rotator::infrastructure::store::Stores;
use checkout_rotator::models::{CartItem, CheckoutReference, TargetShop};
use checkout_rotator::{AppState, create_router};

/// Gateway double: numbered carts on success, a fixed status error otherwise
pub struct FakeGateway {
    pub fail_status: Option<u16>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakeGateway {
    pub fn ok() -> Self {
        Self {
            fail_status: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(status: u16) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::ok()
        }
    }

    /// Succeeds after `delay`, keeping concurrent redirects in flight together
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::ok()
        }
    }
}

#[async_trait]
impl CheckoutGateway for FakeGateway {
    async fn create_checkout(
        &self,
        target: &TargetShop,
        _items: &[CartItem],
    ) -> Result<CheckoutReference, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.fail_status {
            return Err(GatewayError::Status(status));
        }
        Ok(CheckoutReference {
            cart_id: format!("gid://shopify/Cart/tok-{}?key=secret", n),
            checkout_url: format!("https://{}/checkouts/tok-{}", target.domain, n),
        })
    }
}

pub fn app_state(config: Config, gateway: FakeGateway) -> AppState {
    AppState::with_components(config, Stores::in_memory(), Arc::new(gateway))
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with(Config::default(), FakeGateway::ok())
    }

    pub fn with(config: Config, gateway: FakeGateway) -> Self {
        let state = app_state(config, gateway);
        Self {
            router: create_router(state.clone()),
            state,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None, &[]).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body), &[]).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(body), &[]).await
    }

    /// Register a target shop through the admin API, returns its id
    pub async fn create_target(&self, domain: &str, limit: Option<i64>) -> String {
        let (status, body) = self
            .post(
                "/api/target-shops",
                serde_json::json!({
                    "name": format!("Target {}", domain),
                    "domain": domain,
                    "accessToken": "storefront-token",
                    "weight": 1,
                    "dailyRevenueLimit": limit,
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["data"]["id"].as_str().unwrap().to_string()
    }

    /// Register a source shop, returns its api key
    pub async fn create_source(&self, domain: &str) -> String {
        let (status, body) = self
            .post(
                "/api/source-shops",
                serde_json::json!({ "name": "Front", "domain": domain }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["data"]["apiKey"].as_str().unwrap().to_string()
    }
}

//! Checkout gateway
//!
//! Creates a checkout for a cart on a target storefront. The production
//! adapter talks to the storefront GraphQL API (`cartCreate`); tests plug in
//! their own [`CheckoutGateway`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::GatewayError;
use crate::infrastructure::http_client;
use crate::models::{CartItem, CheckoutReference, TargetShop};

#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_checkout(
        &self,
        target: &TargetShop,
        items: &[CartItem],
    ) -> Result<CheckoutReference, GatewayError>;
}

const CART_CREATE: &str = r#"
mutation cartCreate($input: CartInput!) {
  cartCreate(input: $input) {
    cart {
      id
      checkoutUrl
    }
    userErrors {
      field
      message
    }
  }
}
"#;

/// Storefront GraphQL client
#[derive(Debug, Clone)]
pub struct StorefrontGateway {
    api_version: String,
}

impl StorefrontGateway {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
        }
    }

    fn endpoint(&self, domain: &str) -> String {
        format!("https://{}/api/{}/graphql.json", domain, self.api_version)
    }
}

/// Variant ids arrive bare from the storefront script; the API wants global ids
pub fn merchandise_id(variant_id: &str) -> String {
    if variant_id.starts_with("gid://") {
        variant_id.to_string()
    } else {
        format!("gid://shopify/ProductVariant/{}", variant_id)
    }
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<CartCreateData>,
    errors: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartCreateData {
    cart_create: Option<CartCreatePayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartCreatePayload {
    cart: Option<CreatedCart>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedCart {
    id: String,
    checkout_url: String,
}

#[derive(Deserialize)]
struct UserError {
    message: String,
}

fn parse_cart_create(body: GraphQlResponse) -> Result<CheckoutReference, GatewayError> {
    if let Some(errors) = body.errors {
        return Err(GatewayError::GraphQl(errors.to_string()));
    }
    let payload = body
        .data
        .and_then(|d| d.cart_create)
        .ok_or_else(|| GatewayError::MalformedResponse("missing cartCreate".into()))?;

    if !payload.user_errors.is_empty() {
        let messages: Vec<String> = payload.user_errors.into_iter().map(|e| e.message).collect();
        return Err(GatewayError::UserErrors(messages.join("; ")));
    }

    let cart = payload
        .cart
        .ok_or_else(|| GatewayError::MalformedResponse("missing cart".into()))?;
    Ok(CheckoutReference {
        cart_id: cart.id,
        checkout_url: cart.checkout_url,
    })
}

#[async_trait]
impl CheckoutGateway for StorefrontGateway {
    async fn create_checkout(
        &self,
        target: &TargetShop,
        items: &[CartItem],
    ) -> Result<CheckoutReference, GatewayError> {
        let lines: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                json!({
                    "merchandiseId": merchandise_id(&item.variant_id),
                    "quantity": item.quantity,
                })
            })
            .collect();
        let payload = json!({
            "query": CART_CREATE,
            "variables": { "input": { "lines": lines } },
        });

        let url = self.endpoint(&target.domain);
        debug!(shop_id = %target.id, %url, "Creating storefront cart");

        let response = http_client::post_json_with_headers(
            &url,
            &[("X-Shopify-Storefront-Access-Token", target.access_token.as_str())],
            &payload,
        )
        .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Status(response.status().as_u16()));
        }

        let body = response
            .json::<GraphQlResponse>()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        parse_cart_create(body)
    }
}

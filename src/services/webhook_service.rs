//! Checkout confirmation
//!
//! Order webhooks finalize the redirect log they belong to and, depending on
//! the accrual mode, feed the confirmed amount into revenue accounting.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::models::{OrderWebhook, RedirectLog};
use crate::services::revenue_service;
use crate::state::AppState;

pub const ORDER_CREATED_TOPIC: &str = "orders/create";

/// What a webhook delivery did
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum WebhookOutcome {
    Confirmed {
        #[serde(rename = "redirectLogId")]
        redirect_log_id: String,
    },
    /// Log already confirmed by an earlier delivery
    AlreadyConfirmed,
    NoMatchingLog,
    Ignored,
}

pub async fn handle_order_webhook(
    app_state: &AppState,
    topic: Option<&str>,
    order: OrderWebhook,
) -> AppResult<WebhookOutcome> {
    if topic != Some(ORDER_CREATED_TOPIC) {
        debug!(topic = ?topic, "Ignoring webhook topic");
        return Ok(WebhookOutcome::Ignored);
    }
    let Some(order_id) = order.order_id() else {
        debug!("Ignoring order webhook without an order id");
        return Ok(WebhookOutcome::Ignored);
    };

    let Some(log) = find_log_for(app_state, &order).await? else {
        warn!(order_id = %order_id, "No pending redirect log for order");
        return Ok(WebhookOutcome::NoMatchingLog);
    };

    let Some(log) = revenue_service::confirm_checkout(app_state, &log, &order_id, Utc::now()).await?
    else {
        debug!(log_id = %log.id, order_id = %order_id, "Redirect log already confirmed");
        return Ok(WebhookOutcome::AlreadyConfirmed);
    };

    info!(
        log_id = %log.id,
        order_id = %order_id,
        shop_id = %log.target_shop_id,
        "Checkout confirmed"
    );

    Ok(WebhookOutcome::Confirmed {
        redirect_log_id: log.id,
    })
}

/// Match on the cart token first, else the most recent pending log
async fn find_log_for(app_state: &AppState, order: &OrderWebhook) -> AppResult<Option<RedirectLog>> {
    let logs = &app_state.stores.logs;
    for token in [&order.cart_token, &order.checkout_token].into_iter().flatten() {
        if let Some(log) = logs.find_pending_by_cart_token(token).await? {
            return Ok(Some(log));
        }
    }
    Ok(logs.latest_pending().await?)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::config::{Config, RevenueAccrual};
    use crate::models::{NewRedirectLog, UNKNOWN_TARGET};
    use crate::test_support::{ScriptedGateway, default_state, insert_target, state, target};

    fn order(id: i64, cart_token: Option<&str>) -> OrderWebhook {
        OrderWebhook {
            id: Some(serde_json::json!(id)),
            cart_token: cart_token.map(String::from),
            checkout_token: None,
        }
    }

    async fn append(app_state: &AppState, total: i64, cart_token: &str) -> RedirectLog {
        app_state
            .stores
            .logs
            .append(NewRedirectLog {
                source_shop_id: "src-1".into(),
                target_shop_id: "t1".into(),
                cart_total: Decimal::from(total),
                cart_items: Vec::new(),
                success: true,
                checkout_url: None,
                cart_token: Some(cart_token.into()),
                error_message: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn order_matches_its_cart_token() {
        let state = default_state();
        insert_target(&state, target("t1", Utc::now())).await;
        let first = append(&state, 20, "cart-a").await;
        append(&state, 30, "cart-b").await;

        let outcome = handle_order_webhook(&state, Some("orders/create"), order(1, Some("cart-a")))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Confirmed { ref redirect_log_id } if *redirect_log_id == first.id
        ));

        let log = state.stores.logs.get(&first.id).await.unwrap().unwrap();
        assert!(log.completed);
        assert_eq!(log.order_id.as_deref(), Some("1"));

        // daily share was counted at redirect time, confirmation adds lifetime only
        let shop = state.stores.shops.get("t1").await.unwrap().unwrap();
        assert_eq!(shop.current_revenue, Decimal::from(20));
        assert_eq!(shop.daily_revenue, Decimal::ZERO);
    }

    #[tokio::test]
    async fn unmatched_token_falls_back_to_latest_pending() {
        let state = default_state();
        insert_target(&state, target("t1", Utc::now())).await;
        append(&state, 20, "cart-a").await;
        let latest = append(&state, 30, "cart-b").await;

        let outcome = handle_order_webhook(&state, Some("orders/create"), order(7, None))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Confirmed { ref redirect_log_id } if *redirect_log_id == latest.id
        ));
    }

    #[tokio::test]
    async fn second_confirmation_is_a_no_op() {
        let config = Config {
            revenue_accrual: RevenueAccrual::OnConfirmation,
            ..Config::default()
        };
        let state = state(config, ScriptedGateway::succeeding());
        insert_target(&state, target("t1", Utc::now())).await;
        let log = append(&state, 20, "cart-a").await;

        handle_order_webhook(&state, Some("orders/create"), order(1, Some("cart-a")))
            .await
            .unwrap();
        let shop = state.stores.shops.get("t1").await.unwrap().unwrap();
        assert_eq!(shop.daily_revenue, Decimal::from(20));
        assert_eq!(shop.current_revenue, Decimal::from(20));

        // the only log is no longer pending, so nothing matches
        let again = handle_order_webhook(&state, Some("orders/create"), order(2, Some("cart-a")))
            .await
            .unwrap();
        assert!(matches!(again, WebhookOutcome::NoMatchingLog));

        let stored = state.stores.logs.get(&log.id).await.unwrap().unwrap();
        assert_eq!(stored.order_id.as_deref(), Some("1"));
        let shop = state.stores.shops.get("t1").await.unwrap().unwrap();
        assert_eq!(shop.current_revenue, Decimal::from(20));
    }

    #[tokio::test]
    async fn other_topics_are_ignored() {
        let state = default_state();
        append(&state, 20, "cart-a").await;
        let outcome = handle_order_webhook(&state, Some("orders/paid"), order(1, Some("cart-a")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored));
        let outcome = handle_order_webhook(&state, None, order(1, Some("cart-a")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored));
    }

    #[tokio::test]
    async fn order_without_id_is_ignored() {
        let state = default_state();
        let hook = OrderWebhook {
            id: None,
            cart_token: Some("cart-a".into()),
            checkout_token: None,
        };
        append(&state, 20, "cart-a").await;
        let outcome = handle_order_webhook(&state, Some("orders/create"), hook)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored));
        let pending = state.stores.logs.latest_pending().await.unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn unplaced_attempt_is_confirmed_without_accounting() {
        let state = default_state();
        insert_target(&state, target("t1", Utc::now())).await;
        let log = state
            .stores
            .logs
            .append(NewRedirectLog {
                source_shop_id: "src-1".into(),
                target_shop_id: UNKNOWN_TARGET.into(),
                cart_total: Decimal::from(20),
                cart_items: Vec::new(),
                success: false,
                checkout_url: None,
                cart_token: Some("cart-u".into()),
                error_message: None,
            })
            .await
            .unwrap();

        let outcome = handle_order_webhook(&state, Some("orders/create"), order(3, Some("cart-u")))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Confirmed { ref redirect_log_id } if *redirect_log_id == log.id
        ));
        let shop = state.stores.shops.get("t1").await.unwrap().unwrap();
        assert_eq!(shop.current_revenue, Decimal::ZERO);
        assert_eq!(shop.revision, 0);
    }
}

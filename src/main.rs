use tracing::info;

use checkout_rotator::config::Config;
use checkout_rotator::handlers::create_router;
use checkout_rotator::infrastructure::logger::init_logger;
use checkout_rotator::services::revenue_service;
use checkout_rotator::state::AppState;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_logger();

    let config = Config::from_env();
    let port = config.http_port;

    let app_state = AppState::new(config)
        .await
        .expect("Failed to create AppState");

    spawn_background_tasks(app_state.clone()).await;

    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to port {}: {}", port, e));

    info!(port, "service starting");

    axum::serve(listener, app)
        .await
        .expect("Failed to start HTTP server");
}

async fn spawn_background_tasks(app_state: AppState) {
    let daily_reset_state = app_state.clone();
    tokio::spawn(revenue_service::daily_reset_task(daily_reset_state));

    let reconcile_state = app_state.clone();
    tokio::spawn(revenue_service::reconcile_task(reconcile_state));

    info!("background tasks started");
}

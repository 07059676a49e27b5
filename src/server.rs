use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        get_balance, health_check, list_orders, list_withdrawals, login, register, upload_order,
        withdraw, AppState,
    },
    error::{AppError, AppResult},
    shutdown::ShutdownSignal,
};

pub async fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/user",
            Router::new()
                // Account endpoints
                .route("/register", post(register))
                .route("/login", post(login))
                // Caller endpoints; identity comes from the upstream auth layer
                .route("/orders", post(upload_order).get(list_orders))
                .route("/balance", get(get_balance))
                .route("/balance/withdraw", post(withdraw))
                .route("/withdrawals", get(list_withdrawals)),
        )
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Serve `app` until `shutdown` fires, then let in-flight requests finish.
pub async fn run_server(app: Router, bind_address: &str, shutdown: ShutdownSignal) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to bind {}: {}", bind_address, e)))?;
    info!("🌐 Server listening on: {}", bind_address);

    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|e| AppError::Internal(format!("Server error: {}", e)))?;

    info!("Server stopped");
    Ok(())
}

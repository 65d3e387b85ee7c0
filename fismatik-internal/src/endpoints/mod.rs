//! HTTP surface of the gateway.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics::counter;
use tower_http::cors::CorsLayer;

use crate::auth::require_bearer;
use crate::error::Error;
use crate::gateway_util::AppStateData;
use crate::rate_limit::rate_limit_middleware;

pub mod advice;
pub mod chat;
pub mod fallback;
pub mod receipts;
pub mod status;

fn record_outcome<T>(endpoint: &'static str, result: &Result<T, Error>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    };
    counter!("fismatik_requests_total", "endpoint" => endpoint, "outcome" => outcome).increment(1);
}

/// Public health route plus the bearer-protected `/api` routes.
/// The coarse rate limit, when enabled, only guards receipt parsing and runs before authentication.
pub fn build_api_router(app_state: AppStateData) -> Router {
    let auth = axum::middleware::from_fn_with_state(app_state.identity.clone(), require_bearer);

    let mut receipt_routes = Router::new()
        .route("/api/parse-receipt", post(receipts::parse_receipt_handler))
        .route_layer(auth.clone());
    if let Some(limiter) = app_state.rate_limiter.clone() {
        receipt_routes = receipt_routes.route_layer(axum::middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));
    }

    let assistant_routes = Router::new()
        .route("/api/financial-advice", post(advice::financial_advice_handler))
        .route("/api/chat", post(chat::chat_handler))
        .route_layer(auth);

    let body_limit = app_state.config.gateway.body_limit_bytes;
    Router::new()
        .route("/health", get(status::health_handler))
        .merge(receipt_routes)
        .merge(assistant_routes)
        .fallback(fallback::handle_404)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

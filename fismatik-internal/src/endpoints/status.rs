use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};

pub const HEALTH_MESSAGE: &str = "Fismatik backend çalışıyor.";

/// A handler for a health check that does not touch any backend
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "ok": true, "message": HEALTH_MESSAGE }))
}

/// `/metrics` in the Prometheus text format
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body, json!({ "ok": true, "message": "Fismatik backend çalışıyor." }));
    }
}

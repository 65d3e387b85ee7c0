use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use metrics::counter;
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::CallerRateLimiter;

/// The socket peer, else `"unknown"`.
/// With `trust_forwarded_for`, the first `X-Forwarded-For` hop takes precedence.
pub fn caller_address(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(first) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|forwarded| {
                forwarded
                    .split(',')
                    .map(str::trim)
                    .find(|hop| !hop.is_empty())
            })
        {
            return first.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<CallerRateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let caller = caller_address(&request, limiter.trust_forwarded_for());
    match limiter.check(&caller) {
        Ok(()) => Ok(next.run(request).await),
        Err(wait) => {
            debug!(caller, "Coarse rate limit exceeded");
            counter!("fismatik_requests_total", "endpoint" => "parse_receipt", "outcome" => "rate_limited")
                .increment(1);
            Err(Error::new(ErrorDetails::RateLimited {
                retry_after_secs: wait.as_secs_f64().ceil() as u64,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    use crate::config::CoarseRateLimitConfig;

    const PEER: [u8; 4] = [192, 168, 1, 5];

    fn request(forwarded: Option<&str>) -> Request {
        let mut builder = Request::builder().method("POST").uri("/api/parse-receipt");
        if let Some(forwarded) = forwarded {
            builder = builder.header("x-forwarded-for", forwarded);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn from_peer(forwarded: Option<&str>) -> Request {
        let mut request = request(forwarded);
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((PEER, 5555))));
        request
    }

    fn limited_router(trust_forwarded_for: bool) -> Router {
        let limiter = Arc::new(
            CallerRateLimiter::new(&CoarseRateLimitConfig {
                enabled: true,
                max_requests: 3,
                window_ms: 120_000,
                trust_forwarded_for,
            })
            .unwrap(),
        );
        Router::new()
            .route("/api/parse-receipt", post(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                limiter,
                rate_limit_middleware,
            ))
    }

    #[test]
    fn test_caller_address_ignores_forwarded_for_by_default() {
        assert_eq!(
            caller_address(&from_peer(Some("203.0.113.7")), false),
            "192.168.1.5"
        );
        assert_eq!(caller_address(&request(Some("203.0.113.7")), false), "unknown");
        assert_eq!(caller_address(&request(None), false), "unknown");
    }

    #[test]
    fn test_caller_address_with_trusted_proxy() {
        assert_eq!(
            caller_address(&from_peer(Some(" 203.0.113.7 , 10.0.0.1")), true),
            "203.0.113.7"
        );
        assert_eq!(caller_address(&from_peer(Some(" , ")), true), "192.168.1.5");
        assert_eq!(caller_address(&from_peer(None), true), "192.168.1.5");
        assert_eq!(caller_address(&request(None), true), "unknown");
    }

    #[tokio::test]
    async fn test_fourth_request_is_rejected_with_retry_after() {
        let router = limited_router(false);

        for _ in 0..3 {
            let response = router.clone().oneshot(from_peer(None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = router.clone().oneshot(from_peer(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((110..=120).contains(&retry_after));
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_reset_the_limit() {
        let router = limited_router(false);

        for i in 0..3 {
            let forwarded = format!("10.9.9.{i}");
            let response = router
                .clone()
                .oneshot(from_peer(Some(&forwarded)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = router
            .clone()
            .oneshot(from_peer(Some("10.9.9.200")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_trusted_forwarded_for_keys_each_client() {
        let router = limited_router(true);

        for i in 0..6 {
            let forwarded = format!("10.9.9.{i}");
            let response = router
                .clone()
                .oneshot(from_peer(Some(&forwarded)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::abuse_guard::AbuseGuard;
use crate::ai::GenerationClient;
use crate::auth::{IdentityProvider, SupabaseIdentityProvider};
use crate::config::{Config, Secrets};
use crate::error::{Error, ErrorDetails};
use crate::pipeline::RequestPipeline;
use crate::quota::{PostgrestQuotaStore, QuotaStore};
use crate::rate_limit::CallerRateLimiter;
use crate::usage::UsageAccountant;

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub identity: IdentityProvider,
    pub quota_store: QuotaStore,
    pub pipeline: Arc<RequestPipeline>,
    pub rate_limiter: Option<Arc<CallerRateLimiter>>,
}
pub type AppState = axum::extract::State<AppStateData>;

/// Handles of the periodic tasks started alongside the app state
pub struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Waits for every task to observe shutdown; the usage worker drains its queue first.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Background task `{name}` failed: {e}");
            }
        }
    }
}

impl AppStateData {
    pub async fn new(
        config: Arc<Config>,
        secrets: Secrets,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, BackgroundTasks), Error> {
        let http_client = setup_http_client()?;
        let identity = setup_identity_provider(&http_client, &secrets)?;
        let quota_store = setup_quota_store(&http_client, &secrets)?;
        if secrets.ai_api_key.is_none() {
            tracing::warn!(
                "No generation API key configured: AI endpoints will fail until `FISMATIK_AI_API_KEY` is set."
            );
        }
        let ai = GenerationClient::new(http_client.clone(), &config.ai, secrets.ai_api_key)?;
        Self::with_components(config, identity, quota_store, ai, shutdown)
    }

    /// Assembles the state from already-built clients and starts the background tasks.
    pub fn with_components(
        config: Arc<Config>,
        identity: IdentityProvider,
        quota_store: QuotaStore,
        ai: GenerationClient,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, BackgroundTasks), Error> {
        let guard = Arc::new(AbuseGuard::new(&config.abuse_guard));
        let sweeper = guard.spawn_sweeper(config.abuse_guard.sweep_interval(), shutdown.clone());
        let (usage, usage_worker) = UsageAccountant::spawn(
            quota_store.clone(),
            config.usage.queue_capacity,
            shutdown.clone(),
        );
        let mut handles = vec![("abuse_guard_sweeper", sweeper), ("usage_accountant", usage_worker)];

        let rate_limiter = if config.rate_limit.enabled {
            let limiter = Arc::new(CallerRateLimiter::new(&config.rate_limit)?);
            handles.push((
                "rate_limit_cleanup",
                limiter.spawn_cleanup(config.rate_limit.window(), shutdown),
            ));
            tracing::info!(
                "Coarse rate limit enabled: {} requests per {:?} per caller",
                config.rate_limit.max_requests,
                config.rate_limit.window()
            );
            Some(limiter)
        } else {
            None
        };

        let pipeline = Arc::new(RequestPipeline::new(
            &config,
            quota_store.clone(),
            guard,
            Arc::new(ai),
            usage,
        ));

        Ok((
            Self {
                config,
                identity,
                quota_store,
                pipeline,
                rate_limiter,
            },
            BackgroundTasks { handles },
        ))
    }
}

pub fn setup_identity_provider(
    http_client: &Client,
    secrets: &Secrets,
) -> Result<IdentityProvider, Error> {
    match (&secrets.supabase_url, &secrets.supabase_service_key) {
        (Some(url), Some(key)) => Ok(IdentityProvider::Supabase(SupabaseIdentityProvider::new(
            http_client.clone(),
            url,
            key.clone(),
        )?)),
        _ => {
            tracing::warn!(
                "Supabase is not configured: every authenticated request will fail with `AUTH_ERROR`."
            );
            Ok(IdentityProvider::Disabled)
        }
    }
}

pub fn setup_quota_store(http_client: &Client, secrets: &Secrets) -> Result<QuotaStore, Error> {
    match (&secrets.supabase_url, &secrets.supabase_service_key) {
        (Some(url), Some(key)) => Ok(QuotaStore::Production(PostgrestQuotaStore::new(
            http_client.clone(),
            url.clone(),
            key.clone(),
        )?)),
        _ => {
            tracing::warn!(
                "Disabling quota store: blocks, monthly counts and token usage will not be persisted."
            );
            Ok(QuotaStore::new_disabled())
        }
    }
}

/// A wrapper type that attempts to deserialize the request body into the specified type `T`.
/// Failures carry the JSON path of the offending field and map to `INVALID_INPUT`.
#[derive(Debug)]
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{e} ({})", e.status()),
            })
        })?;

        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{e} ({})", e.status()),
                })
            })?
            .0;

        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

/// Upper bound for any outbound call; the generation client applies its own shorter timeout.
pub const DEFAULT_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use serde::Deserialize;

    use super::*;
    use crate::quota::MockQuotaStore;
    use crate::testing::{spawn_mock_provider, test_generation_client, MockReply};

    #[derive(Debug, Deserialize)]
    struct Payload {
        #[expect(dead_code)]
        count: u32,
    }

    fn json_request(body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_structured_json_reports_field_path() {
        let err = StructuredJson::<Payload>::from_request(json_request(r#"{"count":"x"}"#), &())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert!(err.to_string().contains("count"), "{err}");

        let err = StructuredJson::<Payload>::from_request(json_request("{not json"), &())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_missing_supabase_secrets_disable_backends() {
        let secrets = Secrets {
            ai_api_key: None,
            supabase_url: None,
            supabase_service_key: None,
        };
        let client = setup_http_client().unwrap();
        assert!(matches!(
            setup_identity_provider(&client, &secrets).unwrap(),
            IdentityProvider::Disabled
        ));
        assert!(setup_quota_store(&client, &secrets).unwrap().is_disabled());
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let provider = spawn_mock_provider(MockReply::text("ok")).await;
        let mut config = Config::default();
        config.rate_limit.enabled = true;
        let (shutdown, rx) = watch::channel(false);
        let (state, tasks) = AppStateData::with_components(
            Arc::new(config),
            IdentityProvider::Disabled,
            QuotaStore::Mock(Arc::new(MockQuotaStore::default())),
            test_generation_client(&provider),
            rx,
        )
        .unwrap();
        assert!(state.rate_limiter.is_some());
        assert_eq!(tasks.handles.len(), 3);

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), tasks.join())
            .await
            .unwrap();
    }
}

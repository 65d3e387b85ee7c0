use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use fismatik_internal::ai::GenerationClient;
use fismatik_internal::auth::{IdentityProvider, MockIdentityProvider};
use fismatik_internal::config::{AiConfig, Config};
use fismatik_internal::endpoints::build_api_router;
use fismatik_internal::gateway_util::{AppStateData, BackgroundTasks};
use fismatik_internal::quota::{MockQuotaStore, QuotaStore};
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;
use url::Url;

pub const TOKEN: &str = "token-user-1";
pub const USER_ID: &str = "user-1";

pub const RECEIPT_REPLY: &str = "```json\n{\"merchantName\":\"MIGROS\",\"date\":\"2026-10-03\",\"totalAmount\":\"152,40\",\"taxAmount\":12.1,\"category\":\"Market\",\"items\":[{\"name\":\"Ekmek\",\"price\":15,\"category\":\"Gıda\"}]}\n```";

#[derive(Clone)]
struct ProviderState {
    reply: Arc<Mutex<(StatusCode, Value)>>,
    calls: Arc<AtomicU64>,
}

/// Stand-in for the generation provider's `generateContent` endpoint
pub struct FakeProvider {
    pub url: Url,
    state: ProviderState,
}

impl FakeProvider {
    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::Relaxed)
    }

    pub fn reply_with_text(&self, text: &str, tokens: u64) {
        *self.state.reply.lock().unwrap() = (StatusCode::OK, candidate(text, tokens));
    }

    pub fn reply_with_status(&self, status: StatusCode, body: Value) {
        *self.state.reply.lock().unwrap() = (status, body);
    }
}

fn candidate(text: &str, tokens: u64) -> Value {
    json!({
        "candidates": [{ "content": { "parts": [{ "text": text }], "role": "model" } }],
        "usageMetadata": { "totalTokenCount": tokens },
    })
}

async fn generate_content(State(state): State<ProviderState>) -> Response {
    state.calls.fetch_add(1, Ordering::Relaxed);
    let (status, body) = state.reply.lock().unwrap().clone();
    (status, Json(body)).into_response()
}

pub async fn spawn_fake_provider() -> FakeProvider {
    let state = ProviderState {
        reply: Arc::new(Mutex::new((StatusCode::OK, candidate(RECEIPT_REPLY, 420)))),
        calls: Arc::new(AtomicU64::new(0)),
    };
    let router = Router::new()
        .route("/v1beta/models/{model_action}", post(generate_content))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    FakeProvider {
        url: Url::parse(&format!("http://{addr}/")).unwrap(),
        state,
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MockQuotaStore>,
    pub identity: Arc<MockIdentityProvider>,
    pub provider: FakeProvider,
    shutdown: watch::Sender<bool>,
    tasks: BackgroundTasks,
}

impl TestApp {
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    /// Stops the background tasks, flushing queued usage writes.
    pub async fn shutdown(self) -> Arc<MockQuotaStore> {
        self.shutdown.send(true).unwrap();
        self.tasks.join().await;
        self.store
    }
}

pub async fn spawn_app(mut config: Config) -> TestApp {
    let provider = spawn_fake_provider().await;
    config.ai = AiConfig {
        base_url: provider.url.clone(),
        ..AiConfig::default()
    };
    let store = Arc::new(MockQuotaStore::default());
    let identity = Arc::new(MockIdentityProvider::default().with_user(TOKEN, USER_ID));
    let ai = GenerationClient::new(
        reqwest::Client::new(),
        &config.ai,
        Some(SecretString::from("integration-key")),
    )
    .unwrap();
    let (shutdown, rx) = watch::channel(false);
    let (state, tasks) = AppStateData::with_components(
        Arc::new(config),
        IdentityProvider::Mock(identity.clone()),
        QuotaStore::Mock(store.clone()),
        ai,
        rx,
    )
    .unwrap();
    TestApp {
        router: build_api_router(state),
        store,
        identity,
        provider,
        shutdown,
        tasks,
    }
}

pub fn post_json(path: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    post_raw(path, token, body.to_string())
}

pub fn post_raw(path: &str, token: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).unwrap()
}

/// A receipt text of exactly `chars` characters, distinct per `seed`
pub fn receipt_text(seed: usize, chars: usize) -> String {
    let head = format!("FIS {seed:04} MIGROS TOPLAM 152,40 ");
    head.chars().chain(std::iter::repeat('x')).take(chars).collect()
}

#![cfg(test)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::ai::GenerationClient;
use crate::config::AiConfig;

#[derive(Debug, Clone)]
enum MockBody {
    Text(String),
    Empty,
    Status(StatusCode, String),
}

/// Canned reply of the mock generation provider
#[derive(Debug, Clone)]
pub struct MockReply {
    body: MockBody,
    tokens: Option<u64>,
    delay: Option<Duration>,
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self {
            body: MockBody::Text(text.to_string()),
            tokens: None,
            delay: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            body: MockBody::Empty,
            tokens: None,
            delay: None,
        }
    }

    pub fn status(status: StatusCode, body: &str) -> Self {
        Self {
            body: MockBody::Status(status, body.to_string()),
            tokens: None,
            delay: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub model: String,
    pub key: Option<String>,
    pub prompt: String,
}

struct MockProviderState {
    reply: Mutex<MockReply>,
    requests: Mutex<Vec<RecordedRequest>>,
    calls: AtomicU64,
}

pub struct MockProvider {
    pub url: Url,
    state: Arc<MockProviderState>,
}

impl MockProvider {
    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::Relaxed)
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.lock().unwrap().last().cloned()
    }

    pub fn set_reply(&self, reply: MockReply) {
        *self.state.reply.lock().unwrap() = reply;
    }
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

async fn generate_content(
    State(state): State<Arc<MockProviderState>>,
    Path(model_action): Path<String>,
    Query(query): Query<KeyQuery>,
    Json(body): Json<Value>,
) -> Response {
    state.calls.fetch_add(1, Ordering::Relaxed);
    let model = model_action
        .split_once(':')
        .map(|(model, _)| model.to_string())
        .unwrap_or(model_action);
    let prompt = body
        .pointer("/contents/0/parts/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    state.requests.lock().unwrap().push(RecordedRequest {
        model,
        key: query.key,
        prompt,
    });

    let reply = state.reply.lock().unwrap().clone();
    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }
    let usage = reply
        .tokens
        .map(|tokens| json!({ "totalTokenCount": tokens }));
    match reply.body {
        MockBody::Text(text) => Json(json!({
            "candidates": [{ "content": { "parts": [{ "text": text }], "role": "model" } }],
            "usageMetadata": usage,
        }))
        .into_response(),
        MockBody::Empty => Json(json!({
            "candidates": [],
            "usageMetadata": usage,
        }))
        .into_response(),
        MockBody::Status(status, body) => (status, body).into_response(),
    }
}

/// Gemini-style provider bound to an ephemeral local port
pub async fn spawn_mock_provider(reply: MockReply) -> MockProvider {
    let state = Arc::new(MockProviderState {
        reply: Mutex::new(reply),
        requests: Mutex::new(Vec::new()),
        calls: AtomicU64::new(0),
    });
    let router = Router::new()
        .route("/v1beta/models/{model_action}", post(generate_content))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    MockProvider {
        url: Url::parse(&format!("http://{addr}/")).unwrap(),
        state,
    }
}

pub fn test_generation_client(provider: &MockProvider) -> GenerationClient {
    let config = AiConfig {
        base_url: provider.url.clone(),
        ..Default::default()
    };
    GenerationClient::new(
        reqwest::Client::new(),
        &config,
        Some(SecretString::from("test-key")),
    )
    .unwrap()
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::quota::TierId;

/// Authenticated caller, attached to request extensions by [`require_bearer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub id: String,
    pub email: Option<String>,
    /// Filled in by the receipt pipeline once the tier is resolved
    pub tier: Option<TierId>,
}

impl UserContext {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            email,
            tier: None,
        }
    }
}

#[derive(Clone)]
pub enum IdentityProvider {
    Disabled,
    Mock(Arc<MockIdentityProvider>),
    Supabase(SupabaseIdentityProvider),
}

impl IdentityProvider {
    /// Resolves an `Authorization` header value.
    /// Anything other than `Bearer <token>` is rejected without contacting the provider.
    pub async fn resolve(&self, authorization: Option<&str>) -> Result<UserContext, Error> {
        let token = extract_bearer(authorization)
            .ok_or_else(|| Error::new(ErrorDetails::Unauthenticated))?;
        match self {
            IdentityProvider::Disabled => Err(Error::new(ErrorDetails::AuthProvider {
                message: "No identity provider is configured".to_string(),
            })),
            IdentityProvider::Mock(mock) => mock.resolve(token),
            IdentityProvider::Supabase(provider) => provider.resolve(token).await,
        }
    }
}

fn extract_bearer(authorization: Option<&str>) -> Option<&str> {
    authorization?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Clone)]
pub struct SupabaseIdentityProvider {
    client: Client,
    user_url: Url,
    service_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct ProviderUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl SupabaseIdentityProvider {
    pub fn new(client: Client, base_url: &Url, service_key: SecretString) -> Result<Self, Error> {
        let user_url = base_url.join("auth/v1/user").map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid identity provider URL `{base_url}`: {e}"),
            })
        })?;
        Ok(Self {
            client,
            user_url,
            service_key,
        })
    }

    async fn resolve(&self, token: &str) -> Result<UserContext, Error> {
        let response = self
            .client
            .get(self.user_url.clone())
            .bearer_auth(token)
            .header("apikey", self.service_key.expose_secret())
            .send()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::AuthProvider {
                    message: format!("Request to identity provider failed: {e}"),
                })
            })?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            return Err(Error::new(ErrorDetails::InvalidCredential));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::AuthProvider {
                message: format!("Identity provider returned status {status}: {body}"),
            }));
        }

        let user: ProviderUser = response.json().await.map_err(|e| {
            Error::new(ErrorDetails::AuthProvider {
                message: format!("Failed to decode identity provider response: {e}"),
            })
        })?;
        match user.id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(UserContext::new(id, user.email)),
            None => Err(Error::new(ErrorDetails::InvalidCredential)),
        }
    }
}

/// Static token → user table for tests
#[derive(Debug, Default)]
pub struct MockIdentityProvider {
    users: HashMap<String, UserContext>,
    calls: AtomicU64,
}

impl MockIdentityProvider {
    pub fn with_user(mut self, token: &str, user_id: &str) -> Self {
        self.users.insert(
            token.to_string(),
            UserContext::new(user_id, Some(format!("{user_id}@example.com"))),
        );
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn resolve(&self, token: &str) -> Result<UserContext, Error> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| Error::new(ErrorDetails::InvalidCredential))
    }
}

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

pub async fn require_bearer(
    State(identity): State<IdentityProvider>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let user = identity
        .resolve(authorization_header(request.headers()))
        .await?;
    tracing::Span::current().record("user_id", user.id.as_str());
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

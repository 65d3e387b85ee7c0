//! Quota store: user roles, receipt counts and token usage.
//!
//! Production traffic goes to a PostgREST endpoint (the hosted database's REST layer).
//! `Mock` backs unit and integration tests; `Disabled` is used when no database is configured,
//! in which case reads return permissive defaults and writes are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::quota::TierId;

/// Row of the `user_roles` table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct UserRole {
    #[serde(default)]
    pub is_blocked: Option<bool>,
    #[serde(default)]
    pub tier_id: Option<String>,
}

#[derive(Clone)]
pub enum QuotaStore {
    Disabled,
    Mock(Arc<MockQuotaStore>),
    Production(PostgrestQuotaStore),
}

impl QuotaStore {
    pub fn new_disabled() -> Self {
        QuotaStore::Disabled
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, QuotaStore::Disabled)
    }

    pub async fn fetch_user_role(&self, user_id: &str) -> Result<Option<UserRole>, Error> {
        match self {
            QuotaStore::Disabled => Ok(None),
            QuotaStore::Mock(mock) => mock.fetch_user_role(user_id),
            QuotaStore::Production(store) => store.fetch_user_role(user_id).await,
        }
    }

    pub async fn is_blocked(&self, user_id: &str) -> Result<bool, Error> {
        Ok(self
            .fetch_user_role(user_id)
            .await?
            .and_then(|role| role.is_blocked)
            .unwrap_or(false))
    }

    pub async fn get_tier(&self, user_id: &str) -> Result<Option<TierId>, Error> {
        Ok(self
            .fetch_user_role(user_id)
            .await?
            .and_then(|role| role.tier_id)
            .filter(|tier| !tier.is_empty())
            .map(TierId::from))
    }

    /// Number of non-manual receipts dated at or after `since`
    pub async fn monthly_receipt_count(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, Error> {
        match self {
            QuotaStore::Disabled => Ok(0),
            QuotaStore::Mock(mock) => mock.monthly_receipt_count(user_id),
            QuotaStore::Production(store) => store.monthly_receipt_count(user_id, since).await,
        }
    }

    pub async fn mark_blocked(&self, user_id: &str) -> Result<(), Error> {
        match self {
            QuotaStore::Disabled => {
                tracing::debug!(user_id, "Quota store disabled, not persisting block flag");
                Ok(())
            }
            QuotaStore::Mock(mock) => mock.mark_blocked(user_id),
            QuotaStore::Production(store) => store.mark_blocked(user_id).await,
        }
    }

    pub async fn increment_token_usage(&self, user_id: &str, amount: u64) -> Result<(), Error> {
        match self {
            QuotaStore::Disabled => Ok(()),
            QuotaStore::Mock(mock) => mock.increment_token_usage(user_id, amount),
            QuotaStore::Production(store) => store.increment_token_usage(user_id, amount).await,
        }
    }
}

/// First instant of the current UTC month
pub fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, TimeZone};
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

#[derive(Clone)]
pub struct PostgrestQuotaStore {
    client: Client,
    base_url: Url,
    service_key: SecretString,
}

impl PostgrestQuotaStore {
    pub fn new(client: Client, base_url: Url, service_key: SecretString) -> Result<Self, Error> {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        if base_url.cannot_be_a_base() {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("Quota store URL `{base_url}` cannot be used as a base URL"),
            }));
        }
        Ok(Self {
            client,
            base_url,
            service_key,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, Error> {
        self.base_url
            .join(&format!("rest/v1/{table}"))
            .map_err(|e| {
                Error::new(ErrorDetails::QuotaStore {
                    message: format!("Invalid quota store URL for `{table}`: {e}"),
                })
            })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        let key = self.service_key.expose_secret();
        builder
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"))
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<reqwest::Response, Error> {
        let response = self.authorized(builder).send().await.map_err(|e| {
            Error::new_without_logging(ErrorDetails::QuotaStore {
                message: format!("Failed to {what}: {e}"),
            })
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::new_without_logging(ErrorDetails::QuotaStore {
            message: format!("Failed to {what}: status {status}: {body}"),
        }))
    }

    async fn fetch_user_role(&self, user_id: &str) -> Result<Option<UserRole>, Error> {
        let mut url = self.table_url("user_roles")?;
        url.query_pairs_mut()
            .append_pair("select", "is_blocked,tier_id")
            .append_pair("user_id", &format!("eq.{user_id}"))
            .append_pair("limit", "1");
        let response = self
            .send(self.client.get(url), "fetch user role")
            .await?;
        let rows: Vec<UserRole> = response.json().await.map_err(|e| {
            Error::new_without_logging(ErrorDetails::QuotaStore {
                message: format!("Failed to decode user role: {e}"),
            })
        })?;
        Ok(rows.into_iter().next())
    }

    async fn monthly_receipt_count(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut url = self.table_url("receipts")?;
        url.query_pairs_mut()
            .append_pair("select", "id")
            .append_pair("user_id", &format!("eq.{user_id}"))
            .append_pair("is_manual", "eq.false")
            .append_pair(
                "date",
                &format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        let builder = self
            .client
            .get(url)
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0");
        let response = self.send(builder, "count receipts").await?;
        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        parse_content_range_total(&content_range).ok_or_else(|| {
            Error::new_without_logging(ErrorDetails::QuotaStore {
                message: format!("Missing exact count in Content-Range `{content_range}`"),
            })
        })
    }

    async fn mark_blocked(&self, user_id: &str) -> Result<(), Error> {
        let mut url = self.table_url("user_roles")?;
        url.query_pairs_mut()
            .append_pair("user_id", &format!("eq.{user_id}"));
        let builder = self
            .client
            .patch(url)
            .header("Prefer", "return=minimal")
            .json(&json!({ "is_blocked": true }));
        self.send(builder, "mark user blocked").await?;
        Ok(())
    }

    async fn increment_token_usage(&self, user_id: &str, amount: u64) -> Result<(), Error> {
        let url = self.table_url("rpc/increment_token_usage")?;
        let builder = self
            .client
            .post(url)
            .json(&json!({ "p_user_id": user_id, "p_amount": amount }));
        match self.send(builder, "increment token usage").await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(user_id, "Token usage RPC failed, falling back to upsert: {e}");
                self.upsert_token_usage(user_id, amount).await
            }
        }
    }

    /// Read-then-write fallback for deployments without the increment RPC.
    /// Concurrent writers may lose increments; usage accounting is approximate.
    async fn upsert_token_usage(&self, user_id: &str, amount: u64) -> Result<(), Error> {
        #[derive(Deserialize)]
        struct TokenUsageRow {
            #[serde(default)]
            total_tokens: Option<u64>,
        }

        let mut url = self.table_url("user_token_usage")?;
        url.query_pairs_mut()
            .append_pair("select", "total_tokens")
            .append_pair("user_id", &format!("eq.{user_id}"))
            .append_pair("limit", "1");
        let response = self
            .send(self.client.get(url), "read token usage")
            .await?;
        let rows: Vec<TokenUsageRow> = response.json().await.map_err(|e| {
            Error::new_without_logging(ErrorDetails::QuotaStore {
                message: format!("Failed to decode token usage: {e}"),
            })
        })?;
        let previous = rows
            .into_iter()
            .next()
            .and_then(|row| row.total_tokens)
            .unwrap_or(0);

        let url = self.table_url("user_token_usage")?;
        let builder = self
            .client
            .post(url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({
                "user_id": user_id,
                "total_tokens": previous.saturating_add(amount),
                "last_updated": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }));
        self.send(builder, "upsert token usage").await?;
        Ok(())
    }
}

/// Parses the total out of a PostgREST `Content-Range` header (`0-0/42` or `*/0`)
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

#[derive(Debug, Default)]
struct MockState {
    roles: HashMap<String, UserRole>,
    receipt_counts: HashMap<String, u64>,
    token_usage: HashMap<String, u64>,
}

/// In-memory quota store with injectable failures
#[derive(Debug, Default)]
pub struct MockQuotaStore {
    state: Mutex<MockState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl MockQuotaStore {
    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        // A poisoned mutex means a test already panicked while holding it.
        #[expect(clippy::expect_used)]
        let mut state = self.state.lock().expect("Mutex poisoned");
        f(&mut state)
    }

    fn read_failure(&self) -> Result<(), Error> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::new_without_logging(ErrorDetails::QuotaStore {
                message: "mock read failure".to_string(),
            }));
        }
        Ok(())
    }

    fn write_failure(&self) -> Result<(), Error> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::new_without_logging(ErrorDetails::QuotaStore {
                message: "mock write failure".to_string(),
            }));
        }
        Ok(())
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    pub fn set_tier(&self, user_id: &str, tier: &str) {
        self.with_state(|state| {
            state.roles.entry(user_id.to_string()).or_default().tier_id = Some(tier.to_string());
        });
    }

    pub fn set_blocked(&self, user_id: &str, blocked: bool) {
        self.with_state(|state| {
            state.roles.entry(user_id.to_string()).or_default().is_blocked = Some(blocked);
        });
    }

    pub fn set_receipt_count(&self, user_id: &str, count: u64) {
        self.with_state(|state| {
            state.receipt_counts.insert(user_id.to_string(), count);
        });
    }

    pub fn blocked(&self, user_id: &str) -> bool {
        self.with_state(|state| {
            state
                .roles
                .get(user_id)
                .and_then(|role| role.is_blocked)
                .unwrap_or(false)
        })
    }

    pub fn token_usage(&self, user_id: &str) -> u64 {
        self.with_state(|state| state.token_usage.get(user_id).copied().unwrap_or(0))
    }

    fn fetch_user_role(&self, user_id: &str) -> Result<Option<UserRole>, Error> {
        self.read_failure()?;
        Ok(self.with_state(|state| state.roles.get(user_id).cloned()))
    }

    fn monthly_receipt_count(&self, user_id: &str) -> Result<u64, Error> {
        self.read_failure()?;
        Ok(self.with_state(|state| state.receipt_counts.get(user_id).copied().unwrap_or(0)))
    }

    fn mark_blocked(&self, user_id: &str) -> Result<(), Error> {
        self.write_failure()?;
        self.set_blocked(user_id, true);
        Ok(())
    }

    fn increment_token_usage(&self, user_id: &str, amount: u64) -> Result<(), Error> {
        self.write_failure()?;
        self.with_state(|state| {
            *state.token_usage.entry(user_id.to_string()).or_default() += amount;
        });
        Ok(())
    }
}

//! Generation provider proxy.
//!
//! Renders one of the fixed prompt templates, calls a Gemini-style `generateContent` endpoint
//! and hands back the reply text together with the number of tokens it cost.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use strum::{Display, IntoStaticStr};
use url::Url;

use crate::config::AiConfig;
use crate::error::{Error, ErrorDetails};

pub mod receipt;
pub mod templates;

pub use receipt::{parse_receipt, strip_fences, ParsedReceipt, ReceiptItem};
pub use templates::{Prompt, PromptTemplates};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PromptKind {
    ReceiptExtraction,
    FinancialAdvice,
    Chat,
}

/// Reply of a successful provider call. `text` is `None` when the provider returned no text.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub kind: PromptKind,
    pub text: Option<String>,
    pub tokens: u64,
}

impl GenerationOutput {
    pub fn require_text(self) -> Result<String, Error> {
        match self.text {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(Error::new(ErrorDetails::EmptyResponse {
                prompt_kind: self.kind.to_string(),
            })),
        }
    }
}

/// Fallback token count when the provider reports no usage
pub fn estimate_tokens(prompt: &str) -> u64 {
    (prompt.chars().count() as u64).div_ceil(4)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    total_token_count: Option<u64>,
}

impl GenerateContentResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}

pub struct GenerationClient {
    http: Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    timeout: Duration,
    templates: PromptTemplates,
}

impl GenerationClient {
    pub fn new(http: Client, config: &AiConfig, api_key: Option<SecretString>) -> Result<Self, Error> {
        let endpoint = config
            .base_url
            .join(&format!("v1beta/models/{}:generateContent", config.model))
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!(
                        "Invalid generation endpoint for base URL `{}` and model `{}`: {e}",
                        config.base_url, config.model
                    ),
                })
            })?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            timeout: config.timeout(),
            templates: PromptTemplates::new()?,
        })
    }

    pub fn templates(&self) -> &PromptTemplates {
        &self.templates
    }

    /// Sends a rendered prompt. Fails on transport errors, non-success statuses and success
    /// bodies that are not a provider envelope; a blank reply is reported through
    /// [`GenerationOutput::require_text`].
    #[tracing::instrument(skip_all, fields(prompt_kind = %prompt.kind))]
    pub async fn generate(&self, prompt: &Prompt) -> Result<GenerationOutput, Error> {
        let Some(api_key) = &self.api_key else {
            return Err(Error::new(ErrorDetails::InternalError {
                message: "Generation provider API key is not configured".to_string(),
            }));
        };
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", api_key.expose_secret());

        let body = json!({ "contents": [{ "parts": [{ "text": prompt.text }] }] });
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_timeout() {
                    format!("Request timed out after {}ms", self.timeout.as_millis())
                } else {
                    format!("Request failed: {}", e.without_url())
                };
                Error::new(ErrorDetails::Upstream {
                    message,
                    status_code: None,
                    raw_response: None,
                })
            })?;

        let status = response.status();
        let raw = response.text().await.map_err(|e| {
            Error::new(ErrorDetails::Upstream {
                message: format!("Failed to read response body: {}", e.without_url()),
                status_code: Some(status),
                raw_response: None,
            })
        })?;

        if !status.is_success() {
            return Err(Error::new(ErrorDetails::Upstream {
                message: provider_error_message(status, &raw),
                status_code: Some(status),
                raw_response: Some(raw),
            }));
        }

        // A success status with a body we cannot read carries no usable text
        let reply: GenerateContentResponse = serde_json::from_str(&raw).map_err(|e| {
            tracing::warn!("Provider returned an undecodable success body: {e}");
            Error::new(ErrorDetails::EmptyResponse {
                prompt_kind: prompt.kind.to_string(),
            })
        })?;
        let tokens = reply
            .usage_metadata
            .as_ref()
            .and_then(|usage| usage.total_token_count)
            .unwrap_or_else(|| estimate_tokens(&prompt.text));

        Ok(GenerationOutput {
            kind: prompt.kind,
            text: reply.first_text(),
            tokens,
        })
    }
}

/// `error.message` from a Google-style error body, else the status reason
fn provider_error_message(status: StatusCode, raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|body| {
            body.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            format!(
                "Provider returned status {status}{}",
                status
                    .canonical_reason()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default()
            )
        })
}

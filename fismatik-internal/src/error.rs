use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;

use crate::quota::MonthlyLimit;

/// Controls whether raw provider output is included in error responses.
///
/// WARNING: enabling this exposes model output (which may echo user receipts)
/// in response bodies.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn debug_enabled() -> bool {
    *DEBUG.get().unwrap_or(&false)
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn code(&self) -> &'static str {
        self.0.code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AbuseDetected {
        user_id: String,
    },
    AccountBlocked {
        user_id: String,
    },
    AppState {
        message: String,
    },
    AuthProvider {
        message: String,
    },
    Config {
        message: String,
    },
    EmptyResponse {
        prompt_kind: String,
    },
    InternalError {
        message: String,
    },
    InvalidCredential,
    InvalidInput {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    MalformedStructuredResponse {
        message: String,
        raw_output: String,
    },
    QuotaExceeded {
        tier_id: String,
        used_this_month: u64,
        limit: MonthlyLimit,
    },
    QuotaStore {
        message: String,
    },
    RateLimited {
        retry_after_secs: u64,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    TemplateRender {
        template_name: String,
        message: String,
    },
    Unauthenticated,
    Upstream {
        message: String,
        status_code: Option<StatusCode>,
        raw_response: Option<String>,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    pub(crate) fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AbuseDetected { .. } => tracing::Level::WARN,
            ErrorDetails::AccountBlocked { .. } => tracing::Level::INFO,
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::AuthProvider { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::EmptyResponse { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidCredential => tracing::Level::INFO,
            ErrorDetails::InvalidInput { .. } => tracing::Level::DEBUG,
            ErrorDetails::JsonRequest { .. } => tracing::Level::DEBUG,
            ErrorDetails::MalformedStructuredResponse { .. } => tracing::Level::WARN,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::INFO,
            ErrorDetails::QuotaStore { .. } => tracing::Level::WARN,
            ErrorDetails::RateLimited { .. } => tracing::Level::INFO,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::DEBUG,
            ErrorDetails::TemplateRender { .. } => tracing::Level::ERROR,
            ErrorDetails::Unauthenticated => tracing::Level::DEBUG,
            ErrorDetails::Upstream { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AbuseDetected { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::AccountBlocked { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::AuthProvider { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::EmptyResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidCredential => StatusCode::UNAUTHORIZED,
            ErrorDetails::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MalformedStructuredResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::QuotaStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::TemplateRender { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Unauthenticated => StatusCode::UNAUTHORIZED,
            // The provider's own status is passed through; transport failures have none.
            ErrorDetails::Upstream { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Stable machine-readable code carried in the `code` field of the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            ErrorDetails::AbuseDetected { .. } => "ABUSE_DETECTED",
            ErrorDetails::AccountBlocked { .. } => "ACCOUNT_BLOCKED",
            ErrorDetails::AuthProvider { .. } => "AUTH_ERROR",
            ErrorDetails::EmptyResponse { .. } => "AI_EMPTY",
            ErrorDetails::InvalidCredential => "INVALID_TOKEN",
            ErrorDetails::InvalidInput { .. } | ErrorDetails::JsonRequest { .. } => {
                "INVALID_INPUT"
            }
            ErrorDetails::MalformedStructuredResponse { .. } => "AI_PARSE_ERROR",
            ErrorDetails::QuotaExceeded { .. } => "SCAN_LIMIT_REACHED",
            ErrorDetails::RateLimited { .. } => "RATE_LIMIT",
            ErrorDetails::RouteNotFound { .. } => "NOT_FOUND",
            ErrorDetails::Unauthenticated => "NO_TOKEN",
            ErrorDetails::Upstream { .. } => "AI_ERROR",
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::QuotaStore { .. }
            | ErrorDetails::TemplateRender { .. } => "INTERNAL_ERROR",
        }
    }

    /// Message shown to the mobile client. Internal failures never leak their details here.
    fn public_message(&self) -> String {
        match self {
            ErrorDetails::AbuseDetected { .. } => "The same receipt was submitted too many times in a short period, so the account has been temporarily blocked.".to_string(),
            ErrorDetails::AccountBlocked { .. } => "This account has been blocked for security reasons. Please contact support.".to_string(),
            ErrorDetails::AuthProvider { .. } => "Something went wrong while verifying your session.".to_string(),
            ErrorDetails::EmptyResponse { .. } => "The AI service did not produce a usable answer.".to_string(),
            ErrorDetails::InvalidCredential => "Your session is no longer valid, please sign in again.".to_string(),
            ErrorDetails::InvalidInput { message } | ErrorDetails::JsonRequest { message } => {
                message.clone()
            }
            ErrorDetails::MalformedStructuredResponse { .. } => "The AI response was not valid receipt JSON.".to_string(),
            ErrorDetails::QuotaExceeded { tier_id, limit, .. } => {
                format!("Monthly receipt limit reached (limit for {tier_id}: {limit}).")
            }
            ErrorDetails::RateLimited { .. } => "Too many requests. Please wait a couple of minutes and try again.".to_string(),
            ErrorDetails::RouteNotFound { path, method } => {
                format!("Route not found: {method} {path}")
            }
            ErrorDetails::Unauthenticated => "Authorization header is missing.".to_string(),
            ErrorDetails::Upstream { .. } => "The AI service returned an error.".to_string(),
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::QuotaStore { .. }
            | ErrorDetails::TemplateRender { .. } => "The server hit an unexpected error.".to_string(),
        }
    }

    /// Variant-specific fields merged into the top level of the error envelope
    fn extra_fields(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        match self {
            ErrorDetails::QuotaExceeded {
                tier_id,
                used_this_month,
                limit,
            } => {
                extra.insert("tierId".to_string(), json!(tier_id));
                extra.insert("usedThisMonth".to_string(), json!(used_this_month));
                extra.insert("maxPerMonth".to_string(), json!(limit));
            }
            ErrorDetails::RateLimited { retry_after_secs } => {
                extra.insert("retryAfter".to_string(), json!(retry_after_secs));
            }
            ErrorDetails::Upstream {
                status_code,
                raw_response,
                ..
            } => {
                // Provider error bodies are JSON in practice; fall back to the raw text otherwise.
                let details = raw_response
                    .as_deref()
                    .map(|raw| serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!(raw)))
                    .unwrap_or(Value::Null);
                extra.insert("details".to_string(), details);
                extra.insert(
                    "providerStatus".to_string(),
                    json!(status_code.map(|s| s.as_u16())),
                );
            }
            ErrorDetails::MalformedStructuredResponse { raw_output, .. } if debug_enabled() => {
                extra.insert("rawOutput".to_string(), json!(raw_output));
            }
            _ => {}
        }
        extra
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AbuseDetected { user_id } => {
                write!(f, "Duplicate submissions from user `{user_id}` exceeded the abuse threshold")
            }
            ErrorDetails::AccountBlocked { user_id } => {
                write!(f, "Rejected request from blocked user `{user_id}`")
            }
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::AuthProvider { message } => {
                write!(f, "Error contacting the identity provider: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::EmptyResponse { prompt_kind } => {
                write!(f, "Generation provider returned no text for `{prompt_kind}` prompt")
            }
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidCredential => {
                write!(f, "Identity provider rejected the bearer credential")
            }
            ErrorDetails::InvalidInput { message } => write!(f, "Invalid input: {message}"),
            ErrorDetails::JsonRequest { message } => {
                write!(f, "Error parsing request body: {message}")
            }
            ErrorDetails::MalformedStructuredResponse { message, raw_output } => {
                write!(
                    f,
                    "Structured response could not be parsed: {message}. Raw output: {raw_output}"
                )
            }
            ErrorDetails::QuotaExceeded {
                tier_id,
                used_this_month,
                limit,
            } => write!(
                f,
                "Monthly quota exhausted for tier `{tier_id}`: {used_this_month} used, limit {limit}"
            ),
            ErrorDetails::QuotaStore { message } => write!(f, "Quota store error: {message}"),
            ErrorDetails::RateLimited { retry_after_secs } => {
                write!(f, "Rate limit exceeded, retry after {retry_after_secs}s")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::TemplateRender {
                template_name,
                message,
            } => write!(f, "Error rendering template `{template_name}`: {message}"),
            ErrorDetails::Unauthenticated => write!(f, "Request is missing a bearer credential"),
            ErrorDetails::Upstream {
                message,
                status_code,
                raw_response,
            } => {
                write!(f, "Generation provider error: {message}")?;
                if let Some(status_code) = status_code {
                    write!(f, " (status {status_code})")?;
                }
                if debug_enabled() {
                    if let Some(raw_response) = raw_response {
                        write!(f, " Raw response: {raw_response}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl Error {
    /// Returns the (StatusCode, JSON Value) tuple that `into_response()` renders
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let mut body = Map::new();
        body.insert("ok".to_string(), Value::Bool(false));
        body.insert("code".to_string(), json!(self.code()));
        body.insert("message".to_string(), json!(self.0.public_message()));
        body.extend(self.0.extra_fields());
        (self.status_code(), Value::Object(body))
    }
}

impl IntoResponse for Error {
    /// Convert the (already logged) error into the uniform `{ok: false, ...}` envelope
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        let mut response = (status_code, Json(body)).into_response();
        if let ErrorDetails::RateLimited { retry_after_secs } = self.get_details() {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

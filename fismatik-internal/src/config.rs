use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::quota::{MonthlyLimit, TierId, TierLimits};

/// Top-level gateway configuration, loaded from a TOML file.
///
/// Secrets are never read from the file; see [`Secrets::from_env`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub abuse_guard: AbuseGuardConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub receipts: ReceiptsConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub rate_limit: CoarseRateLimitConfig,
}

impl Config {
    pub async fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let deserializer = toml::Deserializer::new(contents);
        let config: Config = serde_path_to_error::deserialize(deserializer).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.abuse_guard.window_ms == 0 || self.abuse_guard.sweep_interval_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`abuse_guard.window_ms` and `abuse_guard.sweep_interval_ms` must be positive"
                    .to_string(),
            }));
        }
        if self.abuse_guard.max_duplicates == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`abuse_guard.max_duplicates` must be at least 1".to_string(),
            }));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`rate_limit.max_requests` and `rate_limit.window_ms` must be positive"
                    .to_string(),
            }));
        }
        if self.usage.queue_capacity == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`usage.queue_capacity` must be positive".to_string(),
            }));
        }
        if !self.quota.tiers.contains_key(&self.quota.default_tier) {
            tracing::warn!(
                "Default tier `{}` has no entry in `[quota.tiers]`; falling back to {}",
                self.quota.default_tier,
                self.quota.fallback_limit
            );
        }
        Ok(())
    }

    pub fn tier_limits(&self) -> TierLimits {
        TierLimits::new(
            self.quota.tiers.clone(),
            self.quota.default_tier.clone(),
            self.quota.fallback_limit,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            debug: false,
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

fn default_body_limit_bytes() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiConfig {
    #[serde(default = "default_ai_base_url")]
    pub base_url: Url,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_ai_timeout_ms")]
    pub timeout_ms: u64,
    /// Currency label interpolated into the advice prompt
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl AiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: default_ai_base_url(),
            model: default_ai_model(),
            timeout_ms: default_ai_timeout_ms(),
            currency: default_currency(),
        }
    }
}

#[expect(clippy::expect_used)]
fn default_ai_base_url() -> Url {
    Url::parse("https://generativelanguage.googleapis.com/").expect("static URL is valid")
}

fn default_ai_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_ai_timeout_ms() -> u64 {
    30_000
}

fn default_currency() -> String {
    "TL".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AbuseGuardConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_duplicates")]
    pub max_duplicates: usize,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_entries_per_user")]
    pub max_entries_per_user: usize,
    #[serde(default = "default_fingerprint_prefix_chars")]
    pub fingerprint_prefix_chars: usize,
}

impl AbuseGuardConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for AbuseGuardConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_duplicates: default_max_duplicates(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_entries_per_user: default_max_entries_per_user(),
            fingerprint_prefix_chars: default_fingerprint_prefix_chars(),
        }
    }
}

fn default_window_ms() -> u64 {
    5_000
}

fn default_max_duplicates() -> usize {
    4
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_max_entries_per_user() -> usize {
    64
}

fn default_fingerprint_prefix_chars() -> usize {
    200
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default = "default_tier")]
    pub default_tier: TierId,
    #[serde(default = "default_fallback_limit")]
    pub fallback_limit: MonthlyLimit,
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<TierId, MonthlyLimit>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier(),
            fallback_limit: default_fallback_limit(),
            tiers: default_tiers(),
        }
    }
}

fn default_tier() -> TierId {
    TierId::from("standart")
}

fn default_fallback_limit() -> MonthlyLimit {
    MonthlyLimit::Limited(100)
}

fn default_tiers() -> HashMap<TierId, MonthlyLimit> {
    HashMap::from([
        (TierId::from("standart"), MonthlyLimit::Limited(100)),
        (TierId::from("premium"), MonthlyLimit::Limited(500)),
        (TierId::from("limitless"), MonthlyLimit::Unlimited),
    ])
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptsConfig {
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            min_text_chars: default_min_text_chars(),
        }
    }
}

fn default_min_text_chars() -> usize {
    10
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

/// Per-caller-address limiter in front of `/api/parse-receipt`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoarseRateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    /// Key callers on the first `X-Forwarded-For` hop instead of the socket peer.
    /// Only safe behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl CoarseRateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for CoarseRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_max_requests(),
            window_ms: default_rate_window_ms(),
            trust_forwarded_for: false,
        }
    }
}

fn default_max_requests() -> u32 {
    3
}

fn default_rate_window_ms() -> u64 {
    120_000
}

/// Credentials for the external services, read from the environment
pub struct Secrets {
    pub ai_api_key: Option<SecretString>,
    pub supabase_url: Option<Url>,
    pub supabase_service_key: Option<SecretString>,
}

impl Secrets {
    pub fn from_env() -> Result<Self, Error> {
        let ai_api_key = env_with_fallback("FISMATIK_AI_API_KEY", "GOOGLE_API_KEY")
            .map(SecretString::from);
        let supabase_url = env_with_fallback("FISMATIK_SUPABASE_URL", "SUPABASE_URL")
            .map(|raw| {
                Url::parse(&raw).map_err(|e| {
                    Error::new(ErrorDetails::Config {
                        message: format!("Invalid Supabase URL `{raw}`: {e}"),
                    })
                })
            })
            .transpose()?;
        let supabase_service_key =
            env_with_fallback("FISMATIK_SUPABASE_SERVICE_KEY", "SUPABASE_SERVICE_ROLE_KEY")
                .map(SecretString::from);
        Ok(Self {
            ai_api_key,
            supabase_url,
            supabase_service_key,
        })
    }
}

fn env_with_fallback(primary: &str, legacy: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| {
            std::env::var(legacy)
                .ok()
                .filter(|v| !v.is_empty())
                .inspect(|_| {
                    tracing::warn!(
                        "Using legacy environment variable `{legacy}`; prefer `{primary}` instead."
                    );
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.abuse_guard.window_ms, 5_000);
        assert_eq!(config.abuse_guard.max_duplicates, 4);
        assert_eq!(config.receipts.min_text_chars, 10);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(120));
        assert!(!config.rate_limit.trust_forwarded_for);
        assert_eq!(config.gateway.body_limit_bytes, 2 * 1024 * 1024);
        assert_eq!(config.ai.timeout(), Duration::from_secs(30));
        assert_eq!(
            config.tier_limits().limit_for(&TierId::from("standart")),
            MonthlyLimit::Limited(100)
        );
    }

    #[test]
    fn test_tier_table_accepts_unlimited() {
        let config = Config::parse(
            r#"
[quota]
default_tier = "basic"

[quota.tiers]
basic = 20
gold = "unlimited"
"#,
        )
        .unwrap();
        let limits = config.tier_limits();
        assert_eq!(limits.limit_for(&TierId::from("basic")), MonthlyLimit::Limited(20));
        assert_eq!(limits.limit_for(&TierId::from("gold")), MonthlyLimit::Unlimited);
        // Unknown tiers resolve through the default tier
        assert_eq!(limits.limit_for(&TierId::from("ghost")), MonthlyLimit::Limited(20));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = Config::parse("[gateway]\nbind_adress = \"0.0.0.0:3000\"\n").unwrap_err();
        assert!(err.to_string().contains("bind_adress"));
    }

    #[test]
    fn test_zero_duplicates_is_rejected() {
        assert!(Config::parse("[abuse_guard]\nmax_duplicates = 0\n").is_err());
    }

    #[test]
    fn test_zero_guard_periods_are_rejected() {
        let err = Config::parse("[abuse_guard]\nsweep_interval_ms = 0\n").unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(err.to_string().contains("sweep_interval_ms"));
        assert!(Config::parse("[abuse_guard]\nwindow_ms = 0\n").is_err());
        assert!(Config::parse("[abuse_guard]\nsweep_interval_ms = 1\n").is_ok());
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fismatik.toml");
        std::fs::write(
            &path,
            "[gateway]\nbind_address = \"127.0.0.1:4000\"\n\n[rate_limit]\nenabled = true\n",
        )
        .unwrap();
        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(
            config.gateway.bind_address,
            Some("127.0.0.1:4000".parse().unwrap())
        );
        assert!(config.rate_limit.enabled);
    }
}

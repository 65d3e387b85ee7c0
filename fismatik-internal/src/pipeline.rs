//! Request admission pipeline.
//!
//! Receipt parsing runs: input validation → block flag → duplicate-submission guard →
//! monthly quota → generation → usage accounting → reply validation.
//! Advice and chat only validate their input and call the generation provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

use crate::abuse_guard::{AbuseGuard, GuardVerdict};
use crate::ai::{parse_receipt, GenerationClient, ParsedReceipt};
use crate::auth::UserContext;
use crate::config::Config;
use crate::error::{Error, ErrorDetails};
use crate::quota::store::start_of_month;
use crate::quota::{MonthlyLimit, QuotaEvaluator, QuotaStore, TierId};
use crate::usage::{UsageAccountant, UsageEvent};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseReceiptRequest {
    #[serde(default)]
    pub raw_text: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialAdviceRequest {
    #[serde(default)]
    pub total_spent: Value,
    #[serde(default)]
    pub categories: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMeta {
    pub tier_id: TierId,
    /// Includes the receipt being parsed
    pub used_this_month: u64,
    pub max_per_month: MonthlyLimit,
    pub remaining_monthly_scans: Option<u64>,
    pub tier_limits: BTreeMap<TierId, MonthlyLimit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptOutcome {
    pub data: ParsedReceipt,
    pub meta: ReceiptMeta,
}

pub struct RequestPipeline {
    store: QuotaStore,
    guard: Arc<AbuseGuard>,
    quota: QuotaEvaluator,
    ai: Arc<GenerationClient>,
    usage: UsageAccountant,
    min_text_chars: usize,
    currency: String,
}

fn invalid_input(message: &str) -> Error {
    Error::new(ErrorDetails::InvalidInput {
        message: message.to_string(),
    })
}

impl RequestPipeline {
    pub fn new(
        config: &Config,
        store: QuotaStore,
        guard: Arc<AbuseGuard>,
        ai: Arc<GenerationClient>,
        usage: UsageAccountant,
    ) -> Self {
        Self {
            quota: QuotaEvaluator::new(store.clone(), Arc::new(config.tier_limits())),
            store,
            guard,
            ai,
            usage,
            min_text_chars: config.receipts.min_text_chars,
            currency: config.ai.currency.clone(),
        }
    }

    fn validate_receipt_text<'a>(&self, raw_text: &'a Value) -> Result<&'a str, Error> {
        match raw_text.as_str() {
            Some(text) if text.trim().chars().count() >= self.min_text_chars => Ok(text),
            _ => Err(invalid_input(&format!(
                "`rawText` must be a receipt text of at least {} characters.",
                self.min_text_chars
            ))),
        }
    }

    async fn is_blocked(&self, user_id: &str) -> bool {
        match self.store.is_blocked(user_id).await {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(user_id, "Block flag lookup failed, treating user as not blocked: {e}");
                false
            }
        }
    }

    async fn monthly_count(&self, user_id: &str) -> u64 {
        let since = start_of_month(Utc::now());
        match self.store.monthly_receipt_count(user_id, since).await {
            Ok(count) => count,
            Err(e) => {
                warn!(user_id, "Monthly receipt count failed, assuming 0: {e}");
                0
            }
        }
    }

    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn parse_receipt(
        &self,
        user: &mut UserContext,
        request: &ParseReceiptRequest,
    ) -> Result<ReceiptOutcome, Error> {
        let raw_text = self.validate_receipt_text(&request.raw_text)?;

        if self.is_blocked(&user.id).await {
            return Err(Error::new(ErrorDetails::AccountBlocked {
                user_id: user.id.clone(),
            }));
        }

        if self.guard.check(&user.id, raw_text) == GuardVerdict::Blocked {
            counter!("fismatik_abuse_blocks_total").increment(1);
            if let Err(e) = self.store.mark_blocked(&user.id).await {
                warn!(user_id = user.id, "Failed to persist block flag: {e}");
            }
            return Err(Error::new(ErrorDetails::AbuseDetected {
                user_id: user.id.clone(),
            }));
        }

        let (used, decision) = tokio::join!(
            self.monthly_count(&user.id),
            self.quota.evaluate(&user.id)
        );
        user.tier = Some(decision.tier.clone());
        if !decision.admits(used) {
            counter!("fismatik_quota_rejections_total", "tier" => decision.tier.to_string())
                .increment(1);
            return Err(Error::new(ErrorDetails::QuotaExceeded {
                tier_id: decision.tier.to_string(),
                used_this_month: used,
                limit: decision.limit,
            }));
        }

        let prompt = self.ai.templates().receipt_extraction(raw_text)?;
        let output = self.ai.generate(&prompt).await?;
        // Tokens were spent even if the reply turns out to be unusable
        self.usage
            .submit(UsageEvent::now(user.id.clone(), output.tokens));
        let receipt = parse_receipt(&output.require_text()?)?;

        Ok(ReceiptOutcome {
            data: receipt,
            meta: ReceiptMeta {
                tier_id: decision.tier.clone(),
                used_this_month: used + 1,
                max_per_month: decision.limit,
                remaining_monthly_scans: decision.remaining_after(used),
                tier_limits: self.quota.limits().as_sorted_map(),
            },
        })
    }

    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn financial_advice(
        &self,
        user: &UserContext,
        request: &FinancialAdviceRequest,
    ) -> Result<String, Error> {
        if !request.total_spent.as_f64().is_some_and(|total| total >= 0.0) {
            return Err(invalid_input(
                "`totalSpent` must be a number greater than or equal to 0.",
            ));
        }
        let Value::Object(map) = &request.categories else {
            return Err(invalid_input("`categories` must be an object of category amounts."));
        };
        let categories: BTreeMap<String, String> = map
            .iter()
            .map(|(name, amount)| (name.clone(), display_amount(amount)))
            .collect();

        let prompt = self.ai.templates().financial_advice(
            &display_amount(&request.total_spent),
            &categories,
            &self.currency,
        )?;
        let advice = self.ai.generate(&prompt).await?.require_text()?;
        Ok(advice.trim().to_string())
    }

    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn chat(&self, user: &UserContext, request: &ChatRequest) -> Result<String, Error> {
        let message = request
            .message
            .as_str()
            .filter(|message| !message.is_empty())
            .ok_or_else(|| invalid_input("`message` must be a non-empty string."))?;

        let prompt = self.ai.templates().chat(message)?;
        let reply = self.ai.generate(&prompt).await?.require_text()?;
        Ok(reply.trim().to_string())
    }
}

/// Renders an amount the way a person would write it: `1500`, `500.5`.
/// Non-numeric values pass through as their text.
fn display_amount(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(amount) if n.is_f64() => amount.to_string(),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

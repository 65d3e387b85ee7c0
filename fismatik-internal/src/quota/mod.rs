use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod store;

pub use store::{MockQuotaStore, PostgrestQuotaStore, QuotaStore, UserRole};

/// Subscription tier identifier, as stored in `user_roles.tier_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(String);

impl TierId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TierId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TierId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monthly receipt allowance of a tier.
///
/// Config files spell unbounded tiers as the string `"unlimited"`; JSON responses use `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthlyLimit {
    Limited(u32),
    Unlimited,
}

impl MonthlyLimit {
    pub fn as_option(&self) -> Option<u32> {
        match self {
            MonthlyLimit::Limited(limit) => Some(*limit),
            MonthlyLimit::Unlimited => None,
        }
    }
}

impl fmt::Display for MonthlyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonthlyLimit::Limited(limit) => write!(f, "{limit}"),
            MonthlyLimit::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for MonthlyLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MonthlyLimit::Limited(limit) => serializer.serialize_u32(*limit),
            MonthlyLimit::Unlimited => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for MonthlyLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MonthlyLimitVisitor;

        impl<'de> Visitor<'de> for MonthlyLimitVisitor {
            type Value = MonthlyLimit;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative integer or the string \"unlimited\"")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u32::try_from(value)
                    .map(MonthlyLimit::Limited)
                    .map_err(|_| E::custom(format!("monthly limit out of range: {value}")))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                u32::try_from(value)
                    .map(MonthlyLimit::Limited)
                    .map_err(|_| E::custom(format!("monthly limit out of range: {value}")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                if value.eq_ignore_ascii_case("unlimited") {
                    Ok(MonthlyLimit::Unlimited)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(value), &self))
                }
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(MonthlyLimit::Unlimited)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(MonthlyLimit::Unlimited)
            }
        }

        deserializer.deserialize_any(MonthlyLimitVisitor)
    }
}

/// Static tier → monthly limit table, loaded once at startup
#[derive(Debug, Clone)]
pub struct TierLimits {
    tiers: HashMap<TierId, MonthlyLimit>,
    default_tier: TierId,
    fallback_limit: MonthlyLimit,
}

impl TierLimits {
    pub fn new(
        tiers: HashMap<TierId, MonthlyLimit>,
        default_tier: TierId,
        fallback_limit: MonthlyLimit,
    ) -> Self {
        Self {
            tiers,
            default_tier,
            fallback_limit,
        }
    }

    pub fn default_tier(&self) -> &TierId {
        &self.default_tier
    }

    /// Tier entry, then the default tier's entry, then the hard-coded fallback
    pub fn limit_for(&self, tier: &TierId) -> MonthlyLimit {
        self.tiers
            .get(tier)
            .or_else(|| self.tiers.get(&self.default_tier))
            .copied()
            .unwrap_or(self.fallback_limit)
    }

    /// Sorted view for response metadata
    pub fn as_sorted_map(&self) -> BTreeMap<TierId, MonthlyLimit> {
        self.tiers
            .iter()
            .map(|(tier, limit)| (tier.clone(), *limit))
            .collect()
    }
}

/// A user's resolved tier and allowance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub tier: TierId,
    pub limit: MonthlyLimit,
}

impl QuotaDecision {
    /// Whether a new receipt may be processed given `used` receipts this month
    pub fn admits(&self, used: u64) -> bool {
        match self.limit {
            MonthlyLimit::Limited(limit) => used < u64::from(limit),
            MonthlyLimit::Unlimited => true,
        }
    }

    /// Remaining allowance once the current request is counted; `None` when unlimited
    pub fn remaining_after(&self, used: u64) -> Option<u64> {
        self.limit
            .as_option()
            .map(|limit| u64::from(limit).saturating_sub(used + 1))
    }
}

/// Resolves tiers through the quota store and limits through the static table
#[derive(Clone)]
pub struct QuotaEvaluator {
    store: QuotaStore,
    limits: Arc<TierLimits>,
}

impl QuotaEvaluator {
    pub fn new(store: QuotaStore, limits: Arc<TierLimits>) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &Arc<TierLimits> {
        &self.limits
    }

    pub async fn evaluate(&self, user_id: &str) -> QuotaDecision {
        let tier = match self.store.get_tier(user_id).await {
            Ok(Some(tier)) => tier,
            Ok(None) => self.limits.default_tier().clone(),
            Err(e) => {
                tracing::warn!(
                    user_id,
                    "Tier lookup failed, using default tier `{}`: {e}",
                    self.limits.default_tier()
                );
                self.limits.default_tier().clone()
            }
        };
        let limit = self.limits.limit_for(&tier);
        QuotaDecision { tier, limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TierLimits {
        TierLimits::new(
            HashMap::from([
                (TierId::from("standart"), MonthlyLimit::Limited(100)),
                (TierId::from("limitless"), MonthlyLimit::Unlimited),
            ]),
            TierId::from("standart"),
            MonthlyLimit::Limited(100),
        )
    }

    #[test]
    fn test_admits_iff_below_limit() {
        let decision = QuotaDecision {
            tier: TierId::from("standart"),
            limit: MonthlyLimit::Limited(100),
        };
        assert!(decision.admits(0));
        assert!(decision.admits(99));
        assert!(!decision.admits(100));
        assert!(!decision.admits(250));
    }

    #[test]
    fn test_remaining_after() {
        let decision = QuotaDecision {
            tier: TierId::from("standart"),
            limit: MonthlyLimit::Limited(100),
        };
        assert_eq!(decision.remaining_after(5), Some(94));
        assert_eq!(decision.remaining_after(99), Some(0));
        assert_eq!(decision.remaining_after(150), Some(0));

        let unlimited = QuotaDecision {
            tier: TierId::from("limitless"),
            limit: MonthlyLimit::Unlimited,
        };
        assert!(unlimited.admits(u64::MAX - 1));
        assert_eq!(unlimited.remaining_after(10), None);
    }

    #[test]
    fn test_limit_fallback_chain() {
        let table = limits();
        assert_eq!(table.limit_for(&TierId::from("limitless")), MonthlyLimit::Unlimited);
        assert_eq!(table.limit_for(&TierId::from("unknown")), MonthlyLimit::Limited(100));

        let no_default = TierLimits::new(
            HashMap::new(),
            TierId::from("standart"),
            MonthlyLimit::Limited(7),
        );
        assert_eq!(no_default.limit_for(&TierId::from("anything")), MonthlyLimit::Limited(7));
    }

    #[test]
    fn test_monthly_limit_json() {
        assert_eq!(serde_json::to_value(MonthlyLimit::Limited(3)).unwrap(), 3);
        assert!(serde_json::to_value(MonthlyLimit::Unlimited).unwrap().is_null());
        let parsed: MonthlyLimit = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, MonthlyLimit::Unlimited);
        assert!(serde_json::from_str::<MonthlyLimit>("\"lots\"").is_err());
        assert!(serde_json::from_str::<MonthlyLimit>("-1").is_err());
    }

    #[tokio::test]
    async fn test_evaluate_uses_stored_tier() {
        let mock = Arc::new(MockQuotaStore::default());
        mock.set_tier("u1", "limitless");
        let evaluator = QuotaEvaluator::new(QuotaStore::Mock(mock), Arc::new(limits()));

        let decision = evaluator.evaluate("u1").await;
        assert_eq!(decision.tier, TierId::from("limitless"));
        assert_eq!(decision.limit, MonthlyLimit::Unlimited);
    }

    #[tokio::test]
    async fn test_evaluate_falls_back_on_missing_row_and_errors() {
        let mock = Arc::new(MockQuotaStore::default());
        let evaluator = QuotaEvaluator::new(QuotaStore::Mock(mock.clone()), Arc::new(limits()));

        let decision = evaluator.evaluate("nobody").await;
        assert_eq!(decision.tier, TierId::from("standart"));
        assert_eq!(decision.limit, MonthlyLimit::Limited(100));

        mock.set_tier("u2", "limitless");
        mock.fail_reads(true);
        let decision = evaluator.evaluate("u2").await;
        assert_eq!(decision.tier, TierId::from("standart"));
    }
}

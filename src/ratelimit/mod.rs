pub mod cache;
pub mod limiter;

pub use cache::LimiterCache;
pub use limiter::{AcquireOutcome, Limiter};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limiter algorithm. Sliding window splits the window into
/// [`SLIDING_WINDOW_SEGMENTS`] segments; token bucket refills
/// `tokens_per_period` every `refill_period_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    #[default]
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// Number of segments a sliding window is divided into.
pub const SLIDING_WINDOW_SEGMENTS: u32 = 10;

/// Key composition for a rate-limit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    Global,
    Tenant,
    User,
    #[default]
    Tool,
    TenantTool,
    UserTool,
}

/// Identity used when a tenant or user header is absent.
pub const ANONYMOUS: &str = "anonymous";

/// Compose the limiter key for a scope. One scheme shared by the pipeline
/// action and the gateway middleware so permits are never accidentally
/// shared across scopes.
pub fn scope_key(scope: Scope, tool: &str, tenant: &str, user: &str) -> String {
    match scope {
        Scope::Global => "global".to_string(),
        Scope::Tenant => format!("tenant:{}", tenant),
        Scope::User => format!("user:{}:{}", tenant, user),
        Scope::Tool => format!("tool:{}", tool),
        Scope::TenantTool => format!("tenant-tool:{}:{}", tenant, tool),
        Scope::UserTool => format!("user-tool:{}:{}:{}", tenant, user, tool),
    }
}

/// A rate-limit quota as it appears in policy documents and gateway
/// configuration. Validated by [`Quota::validate`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(rename = "permitLimit")]
    pub permit_limit: u32,
    #[serde(default, rename = "windowMs")]
    pub window_ms: Option<u64>,
    #[serde(default, rename = "refillPeriodMs")]
    pub refill_period_ms: Option<u64>,
    #[serde(default, rename = "tokensPerPeriod")]
    pub tokens_per_period: Option<u32>,
    #[serde(default, rename = "queueLimit")]
    pub queue_limit: u32,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default, rename = "segmentationKey")]
    pub segmentation_key: Option<String>,
}

impl Quota {
    /// Window duration for window-based strategies, refill period for
    /// token buckets.
    pub fn period(&self) -> Duration {
        let ms = match self.strategy {
            Strategy::FixedWindow | Strategy::SlidingWindow => self.window_ms.unwrap_or(1_000),
            Strategy::TokenBucket => self.refill_period_ms.unwrap_or(1_000),
        };
        Duration::from_millis(ms.max(1))
    }

    /// Tokens added per refill period (token bucket only). Defaults to the
    /// full permit limit so an unconfigured bucket behaves like a window.
    pub fn refill_amount(&self) -> u32 {
        self.tokens_per_period.unwrap_or(self.permit_limit).max(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.permit_limit < 1 {
            return Err("permitLimit must be >= 1".to_string());
        }
        match self.strategy {
            Strategy::FixedWindow | Strategy::SlidingWindow => {
                if self.window_ms.is_some_and(|w| w == 0) {
                    return Err("windowMs must be > 0".to_string());
                }
            }
            Strategy::TokenBucket => {
                if self.refill_period_ms.is_some_and(|p| p == 0) {
                    return Err("refillPeriodMs must be > 0".to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_deserializes_camel_case() {
        let quota: Quota = serde_json::from_str(
            r#"{"strategy":"slidingWindow","permitLimit":5,"windowMs":10000,"queueLimit":2,"scope":"tenantTool"}"#,
        )
        .unwrap();
        assert_eq!(quota.strategy, Strategy::SlidingWindow);
        assert_eq!(quota.permit_limit, 5);
        assert_eq!(quota.window_ms, Some(10_000));
        assert_eq!(quota.scope, Some(Scope::TenantTool));
    }

    #[test]
    fn zero_permit_limit_rejected() {
        let quota = Quota {
            strategy: Strategy::FixedWindow,
            permit_limit: 0,
            window_ms: Some(1000),
            refill_period_ms: None,
            tokens_per_period: None,
            queue_limit: 0,
            scope: None,
            segmentation_key: None,
        };
        assert!(quota.validate().is_err());
    }

    #[test]
    fn zero_window_rejected() {
        let quota = Quota {
            strategy: Strategy::FixedWindow,
            permit_limit: 1,
            window_ms: Some(0),
            refill_period_ms: None,
            tokens_per_period: None,
            queue_limit: 0,
            scope: None,
            segmentation_key: None,
        };
        assert!(quota.validate().is_err());
    }

    #[test]
    fn scope_keys_never_collide_across_scopes() {
        let keys = [
            scope_key(Scope::Global, "t", "acme", "u1"),
            scope_key(Scope::Tenant, "t", "acme", "u1"),
            scope_key(Scope::User, "t", "acme", "u1"),
            scope_key(Scope::Tool, "t", "acme", "u1"),
            scope_key(Scope::TenantTool, "t", "acme", "u1"),
            scope_key(Scope::UserTool, "t", "acme", "u1"),
        ];
        let unique: std::collections::HashSet<&String> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
        assert_eq!(keys[0], "global");
        assert_eq!(keys[3], "tool:t");
        assert_eq!(keys[4], "tenant-tool:acme:t");
        assert_eq!(keys[5], "user-tool:acme:u1:t");
    }

    #[test]
    fn token_bucket_period_uses_refill() {
        let quota = Quota {
            strategy: Strategy::TokenBucket,
            permit_limit: 10,
            window_ms: None,
            refill_period_ms: Some(250),
            tokens_per_period: Some(2),
            queue_limit: 0,
            scope: None,
            segmentation_key: None,
        };
        assert_eq!(quota.period(), Duration::from_millis(250));
        assert_eq!(quota.refill_amount(), 2);
    }
}

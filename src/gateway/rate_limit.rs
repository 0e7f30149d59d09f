use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::RateLimitConfig;
use crate::ratelimit::{ANONYMOUS, LimiterCache, Quota, Scope, scope_key};

use super::policy::CompiledPattern;

/// Bound on queued acquires; mirrors the pipeline action.
const QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Decision for one `tools/call`.
#[derive(Debug, PartialEq, Eq)]
pub enum RateDecision {
    /// No policy applies; rate limiting is bypassed.
    Bypassed,
    Allowed,
    Denied {
        limit: u32,
        window_ms: u64,
        retry_after_secs: u64,
    },
}

/// Scope-keyed rate limiting in front of the dispatcher. Policy selection:
/// exact override on the external name, else first wildcard override in
/// configuration order, else the default quota, else bypass.
pub struct GatewayRateLimiter {
    enabled: bool,
    default_quota: Option<Quota>,
    exact_overrides: Vec<(String, Quota)>,
    pattern_overrides: Vec<(CompiledPattern, Quota)>,
    cache: Arc<LimiterCache>,
}

impl GatewayRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut exact = Vec::new();
        let mut patterns = Vec::new();
        for (pattern, quota) in &config.overrides {
            if pattern.contains('*') {
                patterns.push((CompiledPattern::compile(pattern), quota.clone()));
            } else {
                exact.push((pattern.clone(), quota.clone()));
            }
        }
        Self {
            enabled: config.enabled,
            default_quota: config.default_quota.clone(),
            exact_overrides: exact,
            pattern_overrides: patterns,
            cache: Arc::new(LimiterCache::new(
                config.max_cache_size,
                Duration::from_secs(config.entry_expiration_secs.max(1)),
            )),
        }
    }

    pub fn cache(&self) -> &Arc<LimiterCache> {
        &self.cache
    }

    fn select_quota(&self, external_name: &str) -> Option<&Quota> {
        if let Some((_, quota)) = self
            .exact_overrides
            .iter()
            .find(|(name, _)| name == external_name)
        {
            return Some(quota);
        }
        if let Some((_, quota)) = self
            .pattern_overrides
            .iter()
            .find(|(pattern, _)| pattern.matches(external_name))
        {
            return Some(quota);
        }
        self.default_quota.as_ref()
    }

    pub async fn check(
        &self,
        external_name: &str,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
    ) -> RateDecision {
        if !self.enabled {
            return RateDecision::Bypassed;
        }
        let Some(quota) = self.select_quota(external_name) else {
            return RateDecision::Bypassed;
        };

        let tenant = tenant_id.unwrap_or(ANONYMOUS);
        let user = user_id.unwrap_or(ANONYMOUS);
        // Overrides are per-tool by nature; the default quota guards the
        // whole gateway unless it names a scope itself.
        let scope = quota.scope.unwrap_or(Scope::Tool);
        let key = scope_key(scope, external_name, tenant, user);

        let limiter = self.cache.get_or_create(&key, quota);
        let outcome = if quota.queue_limit == 0 {
            limiter.limiter().try_acquire()
        } else {
            limiter.limiter().acquire(QUEUE_WAIT).await
        };

        match outcome.retry_after() {
            None => RateDecision::Allowed,
            Some(retry_after) => {
                debug!(
                    "gateway rate limit: denied '{}' under key '{}'",
                    external_name, key
                );
                RateDecision::Denied {
                    limit: quota.permit_limit,
                    window_ms: quota.period().as_millis() as u64,
                    retry_after_secs: retry_after.as_secs().max(1),
                }
            }
        }
    }
}

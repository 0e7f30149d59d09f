use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::invocation::{Invocation, ToolOutcome};
use crate::policy::EffectivePolicy;
use crate::ratelimit::{ANONYMOUS, LimiterCache, Scope, scope_key};

use super::{Action, Next, ORDER_RATE_LIMIT};

/// Bound on queued acquires so a saturated limiter cannot park a call
/// indefinitely.
const QUEUE_WAIT: Duration = Duration::from_secs(5);

/// Applies the per-tool quota from the effective policy. The limiter key
/// follows the policy scope (`tool` when unset); the tenant comes from the
/// transport, falling back to an argument literally named `tenantId`.
pub struct RateLimitAction {
    limiters: Arc<LimiterCache>,
}

impl RateLimitAction {
    pub fn new(limiters: Arc<LimiterCache>) -> Self {
        Self { limiters }
    }
}

#[async_trait]
impl Action for RateLimitAction {
    fn order(&self) -> i32 {
        ORDER_RATE_LIMIT
    }

    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn applies(&self, _invocation: &Invocation, policy: &EffectivePolicy) -> bool {
        policy.rate_limit.is_some()
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        policy: &EffectivePolicy,
        next: Next<'_>,
    ) -> ToolOutcome {
        let Some(quota) = &policy.rate_limit else {
            return next.run(invocation, policy).await;
        };

        let tenant = invocation.effective_tenant().unwrap_or(ANONYMOUS);
        let user = invocation.user_id.as_deref().unwrap_or(ANONYMOUS);
        let key = scope_key(
            quota.scope.unwrap_or(Scope::Tool),
            &invocation.tool_name,
            tenant,
            user,
        );

        let limiter = self.limiters.get_or_create(&key, quota);
        let outcome = if quota.queue_limit == 0 {
            limiter.limiter().try_acquire()
        } else {
            limiter.limiter().acquire(QUEUE_WAIT).await
        };

        match outcome.retry_after() {
            None => next.run(invocation, policy).await,
            Some(retry_after) => {
                debug!(
                    "tool '{}': rate limited under key '{}' (retry after {:?})",
                    invocation.tool_name, key, retry_after
                );
                ToolOutcome::rate_limited(
                    format!("rate limit exceeded for tool '{}'", invocation.tool_name),
                    Some(retry_after.as_secs().max(1)),
                )
            }
        }
    }
}

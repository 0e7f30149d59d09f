use async_trait::async_trait;
use tracing::warn;

use crate::invocation::{FailureKind, Invocation, ToolOutcome};
use crate::policy::EffectivePolicy;

use super::{Action, Next, ORDER_TIMEOUT};

/// Enforces the per-tool deadline. On expiry the in-flight continuation is
/// dropped, which cancels all downstream work, and the caller gets a
/// transient `TIMEOUT` failure.
pub struct TimeoutAction;

#[async_trait]
impl Action for TimeoutAction {
    fn order(&self) -> i32 {
        ORDER_TIMEOUT
    }

    fn name(&self) -> &'static str {
        "timeout"
    }

    fn applies(&self, _invocation: &Invocation, policy: &EffectivePolicy) -> bool {
        policy.timeout.is_some()
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        policy: &EffectivePolicy,
        next: Next<'_>,
    ) -> ToolOutcome {
        let Some(deadline) = policy.timeout else {
            return next.run(invocation, policy).await;
        };

        tokio::select! {
            // Parent cancellation wins over the deadline.
            () = invocation.cancel.cancelled() => {
                ToolOutcome::failure(FailureKind::Cancelled, "invocation cancelled")
            }
            outcome = next.run(invocation, policy) => outcome,
            () = tokio::time::sleep(deadline) => {
                warn!(
                    "tool '{}' timed out after {:?}",
                    invocation.tool_name, deadline
                );
                ToolOutcome::failure(
                    FailureKind::Timeout,
                    format!(
                        "tool '{}' timed out after {} ms",
                        invocation.tool_name,
                        deadline.as_millis()
                    ),
                )
            }
        }
    }
}

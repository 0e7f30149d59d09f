use async_trait::async_trait;
use tracing::{debug, warn};

use crate::invocation::{Invocation, ToolOutcome};
use crate::policy::{AuthPropagationMode, EffectivePolicy};

use super::{Action, Next, ORDER_AUTH};

/// Validates the auth context against the policy's propagation mode.
///
/// Validation only: the actual header injection happens in the executor.
/// A missing context is logged, not failed — the downstream request simply
/// goes out anonymous.
pub struct AuthPropagationAction;

#[async_trait]
impl Action for AuthPropagationAction {
    fn order(&self) -> i32 {
        ORDER_AUTH
    }

    fn name(&self) -> &'static str {
        "auth-propagation"
    }

    fn applies(&self, _invocation: &Invocation, policy: &EffectivePolicy) -> bool {
        policy.auth_propagation != AuthPropagationMode::None
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        policy: &EffectivePolicy,
        next: Next<'_>,
    ) -> ToolOutcome {
        match &invocation.auth {
            None => {
                warn!(
                    "tool '{}': auth propagation mode {:?} but no auth context; request will be anonymous",
                    invocation.tool_name, policy.auth_propagation
                );
            }
            Some(auth) => {
                let satisfied = match policy.auth_propagation {
                    AuthPropagationMode::None => true,
                    AuthPropagationMode::Bearer => auth.bearer_token.is_some(),
                    AuthPropagationMode::ApiKey => auth.api_key.is_some(),
                    AuthPropagationMode::Cookies => auth.cookies.is_some(),
                    AuthPropagationMode::AdditionalHeaders => !auth.additional_headers.is_empty(),
                    AuthPropagationMode::Infer => auth.has_credentials(),
                };
                if satisfied {
                    debug!(
                        "tool '{}': auth context satisfies mode {:?}",
                        invocation.tool_name, policy.auth_propagation
                    );
                } else {
                    warn!(
                        "tool '{}': auth context lacks credentials for mode {:?}; request will be anonymous",
                        invocation.tool_name, policy.auth_propagation
                    );
                }
            }
        }
        next.run(invocation, policy).await
    }
}

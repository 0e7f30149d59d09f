pub mod auth;
pub mod concurrency;
pub mod rate_limit;
pub mod redaction;
pub mod timeout;

pub use auth::AuthPropagationAction;
pub use concurrency::ConcurrencyAction;
pub use rate_limit::RateLimitAction;
pub use redaction::RedactionAction;
pub use timeout::TimeoutAction;

use std::sync::Arc;

use async_trait::async_trait;

use crate::invocation::{FailureKind, Invocation, ToolOutcome};
use crate::policy::EffectivePolicy;

/// Default ordering keys for the built-in actions. Lower runs earlier.
pub const ORDER_AUTH: i32 = 90;
pub const ORDER_TIMEOUT: i32 = 100;
pub const ORDER_CONCURRENCY: i32 = 110;
pub const ORDER_RATE_LIMIT: i32 = 120;
pub const ORDER_REDACTION: i32 = 200;

/// One stage of the invocation pipeline.
///
/// Actions convert known conditions into failure outcomes and return them;
/// they do not panic or error out of the chain. An action may short-circuit
/// by returning without calling `next`.
#[async_trait]
pub trait Action: Send + Sync {
    fn order(&self) -> i32;

    /// Name used in logs only.
    fn name(&self) -> &'static str;

    /// Whether this action participates in the given invocation. A skipped
    /// action passes control straight to the next stage.
    fn applies(&self, invocation: &Invocation, policy: &EffectivePolicy) -> bool;

    async fn invoke(
        &self,
        invocation: &Invocation,
        policy: &EffectivePolicy,
        next: Next<'_>,
    ) -> ToolOutcome;
}

/// Terminal stage of the pipeline: the in-process executor or the gateway
/// dispatcher.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, invocation: &Invocation, policy: &EffectivePolicy) -> ToolOutcome;
}

/// Continuation handed to each action. Runs the remaining applicable
/// actions and finally the terminal dispatcher.
pub struct Next<'a> {
    actions: &'a [Arc<dyn Action>],
    terminal: &'a dyn ToolDispatcher,
}

impl Next<'_> {
    pub async fn run(self, invocation: &Invocation, policy: &EffectivePolicy) -> ToolOutcome {
        let mut rest = self.actions;
        while let Some((head, tail)) = rest.split_first() {
            if head.applies(invocation, policy) {
                let next = Next {
                    actions: tail,
                    terminal: self.terminal,
                };
                return head.invoke(invocation, policy, next).await;
            }
            // Skipped: control goes directly to the next stage.
            rest = tail;
        }
        self.terminal.dispatch(invocation, policy).await
    }
}

/// Ordered, immutable action chain wrapping every tool invocation.
pub struct Pipeline {
    actions: Vec<Arc<dyn Action>>,
    terminal: Arc<dyn ToolDispatcher>,
}

impl Pipeline {
    /// Actions are sorted ascending by order at construction; ties keep
    /// their given relative order (stable sort).
    pub fn new(mut actions: Vec<Arc<dyn Action>>, terminal: Arc<dyn ToolDispatcher>) -> Self {
        actions.sort_by_key(|a| a.order());
        Self { actions, terminal }
    }

    pub async fn run(&self, invocation: &Invocation, policy: &EffectivePolicy) -> ToolOutcome {
        if invocation.cancel.is_cancelled() {
            return ToolOutcome::failure(FailureKind::Cancelled, "invocation cancelled");
        }
        Next {
            actions: &self.actions,
            terminal: &*self.terminal,
        }
        .run(invocation, policy)
        .await
    }
}

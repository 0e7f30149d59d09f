use std::sync::Arc;

use async_trait::async_trait;

use crate::invocation::{Invocation, ToolOutcome};
use crate::policy::EffectivePolicy;
use crate::redact::Redactor;

use super::{Action, Next, ORDER_REDACTION};

/// Sanitizes successful results after the rest of the chain has run.
/// Always applicable; the disabled case is a cheap pass-through inside
/// `invoke` so a skipped configuration costs one branch.
pub struct RedactionAction {
    redactor: Arc<Redactor>,
}

impl RedactionAction {
    pub fn new(redactor: Arc<Redactor>) -> Self {
        Self { redactor }
    }
}

#[async_trait]
impl Action for RedactionAction {
    fn order(&self) -> i32 {
        ORDER_REDACTION
    }

    fn name(&self) -> &'static str {
        "redaction"
    }

    fn applies(&self, _invocation: &Invocation, _policy: &EffectivePolicy) -> bool {
        true
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        policy: &EffectivePolicy,
        next: Next<'_>,
    ) -> ToolOutcome {
        let outcome = next.run(invocation, policy).await;
        if !self.redactor.is_enabled() {
            return outcome;
        }
        match outcome {
            ToolOutcome::Success(mut content) => {
                let replaced = content
                    .text
                    .as_deref()
                    .and_then(|text| self.redactor.redact_text(text));
                if let Some(replaced) = replaced {
                    content.text = Some(replaced);
                }
                if let Some(json) = &mut content.json {
                    self.redactor.redact_json(json);
                }
                ToolOutcome::Success(content)
            }
            failure @ ToolOutcome::Failure(_) => failure,
        }
    }
}

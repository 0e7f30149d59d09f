use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::invocation::{FailureKind, Invocation, ToolOutcome};
use crate::policy::EffectivePolicy;

use super::{Action, Next, ORDER_CONCURRENCY};

/// Cap on the number of distinct per-tool semaphores kept alive.
const SEMAPHORE_CACHE_CAP: usize = 1024;

/// Upper bound on waiting for a permit; prevents a stuck downstream call
/// from deadlocking every later invocation of the same tool.
const SAFETY_WAIT: Duration = Duration::from_secs(300);

/// Bounds simultaneous executions per tool with a semaphore. Semaphores
/// live in a bounded LRU cache keyed by tool name and limit; evicting one
/// with no waiters is safe because the next call rebuilds it.
pub struct ConcurrencyAction {
    semaphores: Mutex<LruCache<String, Arc<Semaphore>>>,
}

impl Default for ConcurrencyAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyAction {
    pub fn new() -> Self {
        Self {
            semaphores: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEMAPHORE_CACHE_CAP).expect("cache cap is nonzero"),
            )),
        }
    }

    fn semaphore_for(&self, tool_name: &str, limit: u32) -> Arc<Semaphore> {
        // The limit is part of the key so a policy change takes effect
        // immediately instead of reusing a differently sized semaphore.
        let key = format!("{}#{}", tool_name, limit);
        let mut cache = self
            .semaphores
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(sem) = cache.get(&key) {
            return sem.clone();
        }
        let sem = Arc::new(Semaphore::new(limit as usize));
        cache.put(key, sem.clone());
        sem
    }
}

#[async_trait]
impl Action for ConcurrencyAction {
    fn order(&self) -> i32 {
        ORDER_CONCURRENCY
    }

    fn name(&self) -> &'static str {
        "concurrency"
    }

    fn applies(&self, _invocation: &Invocation, policy: &EffectivePolicy) -> bool {
        policy.concurrency_limit.is_some_and(|l| l > 0)
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        policy: &EffectivePolicy,
        next: Next<'_>,
    ) -> ToolOutcome {
        let Some(limit) = policy.concurrency_limit.filter(|l| *l > 0) else {
            return next.run(invocation, policy).await;
        };
        let semaphore = self.semaphore_for(&invocation.tool_name, limit);

        let permit = tokio::select! {
            () = invocation.cancel.cancelled() => {
                return ToolOutcome::failure(FailureKind::Cancelled, "invocation cancelled");
            }
            acquired = tokio::time::timeout(SAFETY_WAIT, semaphore.acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        // Semaphore closed; treat as an internal fault.
                        return ToolOutcome::failure(
                            FailureKind::Internal,
                            "concurrency gate unavailable",
                        );
                    }
                    Err(_) => {
                        warn!(
                            "tool '{}': gave up waiting for a concurrency permit after {:?}",
                            invocation.tool_name, SAFETY_WAIT
                        );
                        return ToolOutcome::failure(
                            FailureKind::Timeout,
                            format!(
                                "tool '{}' waited too long for a concurrency slot",
                                invocation.tool_name
                            ),
                        );
                    }
                }
            }
        };

        let outcome = next.run(invocation, policy).await;
        drop(permit);
        outcome
    }
}

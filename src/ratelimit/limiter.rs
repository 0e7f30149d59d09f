use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{Quota, SLIDING_WINDOW_SEGMENTS, Strategy};

/// Result of a permit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// No permit available; `retry_after` is the earliest point a permit
    /// could free up.
    Denied { retry_after: Duration },
}

impl AcquireOutcome {
    pub fn is_acquired(self) -> bool {
        matches!(self, AcquireOutcome::Acquired)
    }

    pub fn retry_after(self) -> Option<Duration> {
        match self {
            AcquireOutcome::Acquired => None,
            AcquireOutcome::Denied { retry_after } => Some(retry_after),
        }
    }
}

enum State {
    FixedWindow {
        window_start: Instant,
        count: u32,
    },
    SlidingWindow {
        /// (segment index, permits used). Segments outside the window are
        /// dropped on every acquire.
        segments: VecDeque<(u64, u32)>,
        origin: Instant,
    },
    TokenBucket {
        tokens: u32,
        last_refill: Instant,
    },
}

/// A single rate limiter for one key. Decisions within one limiter are
/// serialized by the state mutex; queued acquires are served oldest-first
/// through a fair async mutex.
pub struct Limiter {
    quota: Quota,
    state: Mutex<State>,
    /// FIFO hand-off point for blocking acquires. tokio's `Mutex` queues
    /// waiters in arrival order, which gives the oldest-first semantics.
    queue: tokio::sync::Mutex<()>,
    queue_depth: AtomicU32,
}

impl Limiter {
    pub fn new(quota: Quota) -> Self {
        let now = Instant::now();
        let state = match quota.strategy {
            Strategy::FixedWindow => State::FixedWindow {
                window_start: now,
                count: 0,
            },
            Strategy::SlidingWindow => State::SlidingWindow {
                segments: VecDeque::new(),
                origin: now,
            },
            Strategy::TokenBucket => State::TokenBucket {
                tokens: quota.permit_limit,
                last_refill: now,
            },
        };
        Self {
            quota,
            state: Mutex::new(state),
            queue: tokio::sync::Mutex::new(()),
            queue_depth: AtomicU32::new(0),
        }
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Non-blocking permit request.
    pub fn try_acquire(&self) -> AcquireOutcome {
        let now = Instant::now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *state {
            State::FixedWindow {
                window_start,
                count,
            } => {
                let window = self.quota.period();
                if now.duration_since(*window_start) >= window {
                    *window_start = now;
                    *count = 0;
                }
                if *count < self.quota.permit_limit {
                    *count += 1;
                    AcquireOutcome::Acquired
                } else {
                    let retry_after = window.saturating_sub(now.duration_since(*window_start));
                    AcquireOutcome::Denied { retry_after }
                }
            }
            State::SlidingWindow { segments, origin } => {
                let window = self.quota.period();
                let segment_len = window / SLIDING_WINDOW_SEGMENTS;
                let segment_len = if segment_len.is_zero() {
                    Duration::from_millis(1)
                } else {
                    segment_len
                };
                let current = (now.duration_since(*origin).as_nanos()
                    / segment_len.as_nanos().max(1)) as u64;
                let oldest_live = current.saturating_sub(u64::from(SLIDING_WINDOW_SEGMENTS) - 1);
                while segments.front().is_some_and(|(idx, _)| *idx < oldest_live) {
                    segments.pop_front();
                }
                let used: u32 = segments.iter().map(|(_, c)| c).sum();
                if used < self.quota.permit_limit {
                    match segments.back_mut() {
                        Some((idx, count)) if *idx == current => *count += 1,
                        _ => segments.push_back((current, 1)),
                    }
                    AcquireOutcome::Acquired
                } else {
                    // A permit frees when the oldest occupied segment slides out.
                    let oldest = segments.front().map_or(current, |(idx, _)| *idx);
                    let expires_at = *origin
                        + segment_len * (oldest as u32 + SLIDING_WINDOW_SEGMENTS);
                    AcquireOutcome::Denied {
                        retry_after: expires_at.saturating_duration_since(now),
                    }
                }
            }
            State::TokenBucket {
                tokens,
                last_refill,
            } => {
                let period = self.quota.period();
                let elapsed = now.duration_since(*last_refill);
                let periods = (elapsed.as_nanos() / period.as_nanos().max(1)) as u32;
                if periods > 0 {
                    let refill = periods.saturating_mul(self.quota.refill_amount());
                    *tokens = tokens.saturating_add(refill).min(self.quota.permit_limit);
                    *last_refill += period * periods;
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    AcquireOutcome::Acquired
                } else {
                    let retry_after = period.saturating_sub(now.duration_since(*last_refill));
                    AcquireOutcome::Denied { retry_after }
                }
            }
        }
    }

    /// Blocking permit request honoring the quota's queue limit. Waits up
    /// to `max_wait` for a permit; oldest waiter is served first. Returns
    /// the last denial when the queue is full or the wait times out.
    pub async fn acquire(&self, max_wait: Duration) -> AcquireOutcome {
        // Fast path, no queueing.
        let first = self.try_acquire();
        if first.is_acquired() || self.quota.queue_limit == 0 {
            return first;
        }

        if self.queue_depth.fetch_add(1, Ordering::SeqCst) >= self.quota.queue_limit {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return first;
        }

        let deadline = Instant::now() + max_wait;
        let outcome = async {
            let _slot = self.queue.lock().await;
            loop {
                let outcome = self.try_acquire();
                match outcome {
                    AcquireOutcome::Acquired => return outcome,
                    AcquireOutcome::Denied { retry_after } => {
                        let now = Instant::now();
                        if now >= deadline {
                            return outcome;
                        }
                        let nap = retry_after
                            .max(Duration::from_millis(1))
                            .min(deadline.saturating_duration_since(now));
                        tokio::time::sleep(nap).await;
                    }
                }
            }
        }
        .await;
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::PolicySource;

use super::{CatalogSnapshot, EndpointDescriptor, build_snapshot};

/// Floor for the reload throttle; even a chatty policy source cannot push
/// rebuilds closer together than this.
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_millis(500);

/// Owner of the current catalog snapshot.
///
/// Readers take a lock only long enough to clone the `Arc`; the snapshot
/// itself is immutable, so an old snapshot stays valid for any reader that
/// grabbed it before a swap. Rebuilds are single-flight: concurrent
/// `reload()` calls coalesce onto one build.
pub struct CatalogProvider {
    source: Arc<dyn PolicySource>,
    endpoints: RwLock<Arc<Vec<EndpointDescriptor>>>,
    current: RwLock<Arc<CatalogSnapshot>>,
    has_built: AtomicBool,
    last_build: Mutex<Option<Instant>>,
    build_generation: AtomicU64,
    build_lock: tokio::sync::Mutex<()>,
    refresh_interval: Duration,
    min_reload_interval: Duration,
    deny_on_evaluation_failure: bool,
}

impl CatalogProvider {
    pub fn new(
        source: Arc<dyn PolicySource>,
        endpoints: Vec<EndpointDescriptor>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            source,
            endpoints: RwLock::new(Arc::new(endpoints)),
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            has_built: AtomicBool::new(false),
            last_build: Mutex::new(None),
            build_generation: AtomicU64::new(0),
            build_lock: tokio::sync::Mutex::new(()),
            refresh_interval,
            min_reload_interval: MIN_RELOAD_INTERVAL,
            deny_on_evaluation_failure: true,
        }
    }

    /// Let descriptors that fail policy evaluation fall through to the
    /// document default instead of being denied.
    pub fn with_evaluation_failure_fallback(mut self) -> Self {
        self.deny_on_evaluation_failure = false;
        self
    }

    /// Lock-free-for-practical-purposes read of the current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace the known endpoint set (endpoint discovery is an external
    /// collaborator); takes effect on the next rebuild.
    pub fn update_endpoints(&self, endpoints: Vec<EndpointDescriptor>) {
        *self
            .endpoints
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(endpoints);
    }

    /// Rebuild if the current snapshot is older than the refresh interval,
    /// otherwise return it as-is.
    pub async fn ensure_fresh(&self) -> Arc<CatalogSnapshot> {
        let stale = {
            let last = self
                .last_build
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last.is_none_or(|t| t.elapsed() >= self.refresh_interval)
        };
        if stale { self.reload().await } else { self.snapshot() }
    }

    /// Force a rebuild. Keeps the previous snapshot (last-known-good) when
    /// the policy source fails or validation reports errors; publishes with
    /// logged warnings otherwise. Throttled by the minimum reload interval.
    pub async fn reload(&self) -> Arc<CatalogSnapshot> {
        // Throttle: a build that finished moments ago is fresh enough even
        // when the source signals again.
        {
            let last = self
                .last_build
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.is_some_and(|t| t.elapsed() < self.min_reload_interval) {
                return self.snapshot();
            }
        }

        let generation = self.build_generation.load(Ordering::Acquire);
        let _guard = self.build_lock.lock().await;
        if self.build_generation.load(Ordering::Acquire) != generation {
            // Another caller finished a build while we waited; coalesce.
            return self.snapshot();
        }

        let document = match self.source.load().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("catalog reload failed, keeping previous snapshot: {}", e);
                self.record_attempt();
                return self.snapshot();
            }
        };

        let report = document.validate();
        for warning in &report.warnings {
            warn!("policy validation: {}", warning);
        }
        if !report.is_ok() {
            if self.has_built.load(Ordering::Acquire) {
                for error in &report.errors {
                    warn!(
                        "policy validation error, keeping previous snapshot: {}",
                        error
                    );
                }
                self.record_attempt();
                return self.snapshot();
            }
            // No previous valid snapshot: accept the document so the
            // process can start, but say so loudly.
            for error in &report.errors {
                warn!("policy validation error accepted at first load: {}", error);
            }
        }

        let endpoints = self
            .endpoints
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let snapshot = Arc::new(build_snapshot(
            &document,
            &endpoints,
            self.deny_on_evaluation_failure,
        ));
        info!(
            "catalog rebuilt: {} tool(s), policy version '{}'",
            snapshot.len(),
            snapshot.policy_source_version
        );

        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *current = snapshot.clone();
        }
        self.record_attempt();
        self.has_built.store(true, Ordering::Release);
        snapshot
    }

    /// Stamp the throttle clock and bump the coalescing generation. A
    /// failed attempt counts for throttling but not as a published build.
    fn record_attempt(&self) {
        *self
            .last_build
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
        self.build_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// React to policy-source change tokens with single-flight reloads.
    /// Stops when `cancel` fires.
    pub fn spawn_change_listener(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let provider = self.clone();
        let mut changes = provider.source.changes();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            debug!("policy change channel closed, stopping listener");
                            break;
                        }
                        let token = changes.borrow_and_update().clone();
                        debug!("policy change token '{}', reloading catalog", token);
                        provider.reload().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests;

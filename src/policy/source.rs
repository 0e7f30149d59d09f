use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{ContextifyError, ContextifyResult};

use super::PolicyDocument;

/// Debounce window for file system events.
const DEBOUNCE_MS: u64 = 400;

/// Supplier of policy documents plus a change signal. The signal carries
/// opaque `source_version` tokens; a token change means a reload is worth
/// attempting.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load(&self) -> ContextifyResult<PolicyDocument>;

    /// Stream of source-version tokens. Implementations that never change
    /// return a receiver that never updates.
    fn changes(&self) -> watch::Receiver<String>;
}

/// In-memory document, replaceable at runtime. Used when the policy is
/// embedded in the main configuration file (a config reload swaps the
/// document in) and for tests.
pub struct InMemoryPolicySource {
    document: Mutex<PolicyDocument>,
    revision: AtomicU64,
    version_tx: watch::Sender<String>,
    version_rx: watch::Receiver<String>,
}

impl InMemoryPolicySource {
    pub fn new(document: PolicyDocument) -> Self {
        let (version_tx, version_rx) = watch::channel(document.source_version.clone());
        Self {
            document: Mutex::new(document),
            revision: AtomicU64::new(0),
            version_tx,
            version_rx,
        }
    }

    /// Replace the document and bump the version token so change listeners
    /// trigger a reload. Documents without a source version get a
    /// synthesized revision token.
    pub fn set_document(&self, mut document: PolicyDocument) {
        if document.source_version.is_empty() {
            let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
            document.source_version = format!("rev-{}", revision);
        }
        let version = document.source_version.clone();
        *self
            .document
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = document;
        let _ = self.version_tx.send(version);
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicySource {
    async fn load(&self) -> ContextifyResult<PolicyDocument> {
        Ok(self
            .document
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn changes(&self) -> watch::Receiver<String> {
        self.version_rx.clone()
    }
}

/// File-backed policy source. Watches the **parent directory** to handle
/// editor write-to-temp-then-rename patterns; only events matching the
/// policy filename bump the version token.
pub struct FilePolicySource {
    path: PathBuf,
    version_rx: watch::Receiver<String>,
    watcher_handle: Option<JoinHandle<()>>,
}

impl FilePolicySource {
    /// Start watching `path`. The file must exist and parse at startup.
    pub fn start(path: &Path) -> Result<Self> {
        let path = path
            .canonicalize()
            .with_context(|| format!("cannot canonicalize policy path: {}", path.display()))?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("policy path has no parent directory"))?
            .to_path_buf();
        let filename = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("policy path has no filename"))?
            .to_os_string();

        let (version_tx, version_rx) = watch::channel(file_version(&path));

        // Bridge notify's callback to a tokio channel so we can await events
        let (bridge_tx, mut bridge_rx) = tokio::sync::mpsc::channel(64);
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res| {
                let _ = bridge_tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .context("failed to create policy file watcher")?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch directory: {}", parent.display()))?;

        let watched = path.clone();
        let handle = tokio::spawn(async move {
            // Keep watcher alive for the duration of the task
            let _watcher = watcher;

            loop {
                let event = match bridge_rx.recv().await {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        warn!("policy watcher error: {}", e);
                        continue;
                    }
                    None => {
                        debug!("policy watcher channel closed, stopping");
                        break;
                    }
                };

                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let is_our_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().is_some_and(|f| f == filename));
                if !is_our_file {
                    continue;
                }

                // Debounce: wait for the write to settle, then drain extras
                tokio::time::sleep(tokio::time::Duration::from_millis(DEBOUNCE_MS)).await;
                while bridge_rx.try_recv().is_ok() {}

                let version = file_version(&watched);
                debug!("policy file changed, version token {}", version);
                let _ = version_tx.send(version);
            }
        });

        info!("policy watcher started for {}", path.display());
        Ok(Self {
            path,
            version_rx,
            watcher_handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.watcher_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for FilePolicySource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn load(&self) -> ContextifyResult<PolicyDocument> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ContextifyError::Policy(format!(
                "failed to read policy file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let mut document: PolicyDocument = serde_json::from_str(&content)
            .map_err(|e| ContextifyError::Policy(format!("failed to parse policy file: {}", e)))?;
        if document.source_version.is_empty() {
            document.source_version = file_version(&self.path);
        }
        Ok(document)
    }

    fn changes(&self) -> watch::Receiver<String> {
        self.version_rx.clone()
    }
}

/// Version token for a file: its mtime in milliseconds since the epoch.
/// Opaque to consumers; only equality matters.
fn file_version(path: &Path) -> String {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or_else(|| "unknown".to_string(), |d| d.as_millis().to_string())
}

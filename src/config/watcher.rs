use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Config, load_config};

/// How long a burst of file events may settle before a reload is attempted.
const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Watches the configuration file and publishes validated updates.
///
/// Editors that write-to-temp-then-rename replace the file rather than
/// modifying it in place, so the watch covers the parent directory and
/// events are filtered by filename. An update that fails to load or
/// validate is rejected; subscribers keep the last good configuration.
pub struct ConfigWatcher {
    updates: watch::Receiver<Arc<Config>>,
    task: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    pub fn start(config_path: &Path, initial: Config) -> Result<Self> {
        let config_path = config_path
            .canonicalize()
            .with_context(|| format!("cannot canonicalize config path: {}", config_path.display()))?;
        let directory = config_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("config path has no parent directory"))?
            .to_path_buf();
        let filename = config_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("config path has no filename"))?
            .to_os_string();

        let (update_tx, updates) = watch::channel(Arc::new(initial));

        // notify calls back from its own thread; hand events to the async
        // side through a small channel. A full channel only means a burst
        // is in progress, which the settle timer absorbs anyway.
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |event: notify::Result<notify::Event>| {
                let _ = event_tx.try_send(event);
            },
            notify::Config::default(),
        )
        .context("failed to create config watcher")?;
        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch directory: {}", directory.display()))?;

        let task = tokio::spawn(async move {
            // The watcher must live as long as the task or events stop
            let _watcher = watcher;
            let mut settle_at: Option<Instant> = None;

            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else {
                            debug!("config watcher channel closed, stopping");
                            break;
                        };
                        match event {
                            Ok(event) if is_config_change(&event, &filename) => {
                                // Restart the settle window on every hit so
                                // a slow writer gets one reload at the end.
                                settle_at = Some(Instant::now() + SETTLE_DELAY);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("config watcher error: {}", e),
                        }
                    }
                    () = tokio::time::sleep_until(settle_at.unwrap_or_else(Instant::now)),
                            if settle_at.is_some() => {
                        settle_at = None;
                        match load_config(Some(&config_path)) {
                            Ok(fresh) => {
                                info!("configuration reloaded from {}", config_path.display());
                                let _ = update_tx.send(Arc::new(fresh));
                            }
                            Err(e) => {
                                warn!("configuration change rejected, keeping previous: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            updates,
            task: Some(task),
        })
    }

    /// Subscribe to validated configuration updates. The receiver starts
    /// on the configuration the watcher was created with.
    pub fn updates(&self) -> watch::Receiver<Arc<Config>> {
        self.updates.clone()
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_config_change(event: &notify::Event, filename: &OsStr) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|f| f == filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_requires_an_existing_path() {
        assert!(ConfigWatcher::start(Path::new("/nonexistent/config.json"), Config::default()).is_err());

        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "{}").unwrap();
        assert!(ConfigWatcher::start(tmp.path(), Config::default()).is_ok());
    }

    #[tokio::test]
    async fn rewrites_publish_validated_updates() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{"core": {"listenPort": 1111}}"#).unwrap();
        let initial = load_config(Some(tmp.path())).unwrap();

        let watcher = ConfigWatcher::start(tmp.path(), initial).unwrap();
        let mut updates = watcher.updates();
        assert_eq!(updates.borrow().core.listen_port, 1111);

        std::fs::write(tmp.path(), r#"{"core": {"listenPort": 2222}}"#).unwrap();
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .expect("expected a config update")
            .unwrap();
        assert_eq!(updates.borrow_and_update().core.listen_port, 2222);
    }

    #[tokio::test]
    async fn invalid_rewrites_keep_the_previous_config() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{"core": {"listenPort": 1111}}"#).unwrap();
        let initial = load_config(Some(tmp.path())).unwrap();

        let watcher = ConfigWatcher::start(tmp.path(), initial).unwrap();
        let mut updates = watcher.updates();

        std::fs::write(tmp.path(), "{not json").unwrap();
        // The broken write is rejected; no update is published.
        assert!(
            tokio::time::timeout(Duration::from_secs(1), updates.changed())
                .await
                .is_err()
        );
        assert_eq!(updates.borrow().core.listen_port, 1111);

        // A good write afterwards still comes through.
        std::fs::write(tmp.path(), r#"{"core": {"listenPort": 3333}}"#).unwrap();
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .expect("expected a config update")
            .unwrap();
        assert_eq!(updates.borrow_and_update().core.listen_port, 3333);
    }
}

use super::*;
use crate::errors::{ContextifyError, ContextifyResult};
use crate::policy::{PolicyDocument, PolicyEntry, PolicySource};
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use tokio::sync::watch;

struct TestSource {
    document: Mutex<PolicyDocument>,
    fail: AtomicBool,
    loads: AtomicUsize,
    rx: watch::Receiver<String>,
    tx: watch::Sender<String>,
}

impl TestSource {
    fn new(document: PolicyDocument) -> Self {
        let (tx, rx) = watch::channel(document.source_version.clone());
        Self {
            document: Mutex::new(document),
            fail: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            rx,
            tx,
        }
    }

    fn set_document(&self, document: PolicyDocument) {
        let version = document.source_version.clone();
        *self
            .document
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = document;
        let _ = self.tx.send(version);
    }
}

#[async_trait]
impl PolicySource for TestSource {
    async fn load(&self) -> ContextifyResult<PolicyDocument> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ContextifyError::Policy("source unavailable".to_string()));
        }
        Ok(self
            .document
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn changes(&self) -> watch::Receiver<String> {
        self.rx.clone()
    }
}

fn endpoints(names: &[&str]) -> Vec<EndpointDescriptor> {
    names
        .iter()
        .map(|n| EndpointDescriptor {
            operation_id: Some((*n).to_string()),
            http_method: Some("GET".to_string()),
            ..EndpointDescriptor::default()
        })
        .collect()
}

fn open_document(version: &str) -> PolicyDocument {
    PolicyDocument {
        source_version: version.to_string(),
        ..PolicyDocument::default()
    }
}

fn provider_with(source: Arc<TestSource>, names: &[&str]) -> Arc<CatalogProvider> {
    Arc::new(CatalogProvider::new(
        source,
        endpoints(names),
        Duration::from_secs(30),
    ))
}

#[tokio::test(start_paused = true)]
async fn reload_publishes_snapshot() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source, &["GetUser", "ListUsers"]);

    assert!(provider.snapshot().is_empty());
    let snapshot = provider.reload().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.policy_source_version, "v1");
}

#[tokio::test(start_paused = true)]
async fn source_failure_keeps_last_known_good() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source.clone(), &["GetUser"]);

    provider.reload().await;
    assert_eq!(provider.snapshot().len(), 1);

    source.fail.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(1)).await;
    let snapshot = provider.reload().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.policy_source_version, "v1");
}

#[tokio::test(start_paused = true)]
async fn validation_errors_keep_previous_snapshot() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source.clone(), &["GetUser"]);
    provider.reload().await;

    let mut bad = open_document("v2");
    bad.allow = vec![PolicyEntry {
        operation_id: Some("GetUser".to_string()),
        concurrency_limit: Some(0),
        ..PolicyEntry::default()
    }];
    source.set_document(bad);

    tokio::time::advance(Duration::from_secs(1)).await;
    let snapshot = provider.reload().await;
    assert_eq!(snapshot.policy_source_version, "v1");
}

#[tokio::test(start_paused = true)]
async fn invalid_document_accepted_at_first_load() {
    let mut bad = open_document("v1");
    bad.schema_version = 0;
    let source = Arc::new(TestSource::new(bad));
    let provider = provider_with(source, &["GetUser"]);

    // No previous valid snapshot: the document is accepted so the
    // process can start.
    let snapshot = provider.reload().await;
    assert_eq!(snapshot.policy_source_version, "v1");
    assert_eq!(snapshot.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rapid_reloads_are_throttled() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source.clone(), &["GetUser"]);

    provider.reload().await;
    let loads = source.loads.load(Ordering::SeqCst);
    // Within the minimum interval the reload is a no-op.
    provider.reload().await;
    assert_eq!(source.loads.load(Ordering::SeqCst), loads);

    tokio::time::advance(MIN_RELOAD_INTERVAL).await;
    provider.reload().await;
    assert_eq!(source.loads.load(Ordering::SeqCst), loads + 1);
}

#[tokio::test(start_paused = true)]
async fn endpoint_updates_apply_on_the_next_rebuild() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source, &["GetUser"]);
    provider.reload().await;
    assert_eq!(provider.snapshot().len(), 1);

    provider.update_endpoints(endpoints(&["GetUser", "ListUsers"]));
    // The published snapshot is untouched until a rebuild happens.
    assert_eq!(provider.snapshot().len(), 1);

    tokio::time::advance(MIN_RELOAD_INTERVAL).await;
    let snapshot = provider.reload().await;
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.get("ListUsers").is_some());
}

#[tokio::test(start_paused = true)]
async fn ensure_fresh_rebuilds_after_refresh_interval() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = Arc::new(CatalogProvider::new(
        source.clone(),
        endpoints(&["GetUser"]),
        Duration::from_secs(5),
    ));

    provider.ensure_fresh().await;
    let loads = source.loads.load(Ordering::SeqCst);

    tokio::time::advance(Duration::from_secs(1)).await;
    provider.ensure_fresh().await;
    assert_eq!(source.loads.load(Ordering::SeqCst), loads);

    tokio::time::advance(Duration::from_secs(5)).await;
    provider.ensure_fresh().await;
    assert_eq!(source.loads.load(Ordering::SeqCst), loads + 1);
}

#[tokio::test(start_paused = true)]
async fn readers_never_observe_a_partial_snapshot() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source.clone(), &["A", "B", "C"]);
    provider.reload().await;

    let mut readers = Vec::new();
    for _ in 0..8 {
        let provider = provider.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let snapshot = provider.snapshot();
                // Either the v1 or v2 snapshot, never a mixture.
                assert_eq!(snapshot.len(), 3);
                let version = snapshot.policy_source_version.clone();
                assert!(version == "v1" || version == "v2", "got {}", version);
                tokio::task::yield_now().await;
            }
        }));
    }

    source.set_document(open_document("v2"));
    tokio::time::advance(MIN_RELOAD_INTERVAL).await;
    provider.reload().await;

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(provider.snapshot().policy_source_version, "v2");
}

#[tokio::test(start_paused = true)]
async fn snapshot_contents_stable_across_reads() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source, &["GetUser"]);
    provider.reload().await;

    let held = provider.snapshot();
    let names: Vec<String> = held.tools.keys().cloned().collect();
    for _ in 0..10 {
        let again: Vec<String> = held.tools.keys().cloned().collect();
        assert_eq!(names, again);
    }
}

#[tokio::test(start_paused = true)]
async fn change_listener_triggers_reload() {
    let source = Arc::new(TestSource::new(open_document("v1")));
    let provider = provider_with(source.clone(), &["GetUser"]);
    provider.reload().await;

    let cancel = CancellationToken::new();
    let handle = provider.spawn_change_listener(cancel.clone());

    tokio::time::advance(MIN_RELOAD_INTERVAL).await;
    source.set_document(open_document("v2"));
    // Let the listener task observe the token and rebuild.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(provider.snapshot().policy_source_version, "v2");

    cancel.cancel();
    handle.await.unwrap();
}

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use pimsync_store::{ErrorDomain, ItemKind, escape_literal, format_datetime};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::*;
use crate::sync::queue::QueuePhase;

struct FakeStore {
    statements: StdMutex<Vec<String>>,
    fail_updates_containing: StdMutex<Option<String>>,
    snapshot: StdMutex<Vec<ResultRow>>,
    fail_query: StdMutex<bool>,
    fail_open: bool,
}

impl FakeStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            statements: StdMutex::new(Vec::new()),
            fail_updates_containing: StdMutex::new(None),
            snapshot: StdMutex::new(Vec::new()),
            fail_query: StdMutex::new(false),
            fail_open: false,
        })
    }

    fn unreachable_store() -> Arc<Self> {
        Arc::new(Self {
            statements: StdMutex::new(Vec::new()),
            fail_updates_containing: StdMutex::new(None),
            snapshot: StdMutex::new(Vec::new()),
            fail_query: StdMutex::new(false),
            fail_open: true,
        })
    }

    fn fail_updates_containing(&self, needle: &str) {
        *self.fail_updates_containing.lock().unwrap() = Some(needle.to_string());
    }

    fn fail_queries(&self) {
        *self.fail_query.lock().unwrap() = true;
    }

    fn set_snapshot(&self, rows: Vec<ResultRow>) {
        *self.snapshot.lock().unwrap() = rows;
    }

    /// Every submitted update statement, failed attempts included.
    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn statements_containing(&self, needle: &str) -> usize {
        self.statements()
            .iter()
            .filter(|statement| statement.contains(needle))
            .count()
    }
}

#[async_trait]
impl StoreClient for FakeStore {
    async fn open(&self) -> Result<(), StoreError> {
        if self.fail_open {
            return Err(StoreError::connection(0, "store unreachable"));
        }
        Ok(())
    }

    async fn query(&self, _statement: &str) -> Result<Vec<ResultRow>, StoreError> {
        if *self.fail_query.lock().unwrap() {
            return Err(StoreError::query(500, "snapshot query refused"));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn update(&self, statement: &str, _batch_hint: usize) -> Result<(), StoreError> {
        self.statements.lock().unwrap().push(statement.to_string());
        if let Some(needle) = self.fail_updates_containing.lock().unwrap().as_deref()
            && statement.contains(needle)
        {
            return Err(StoreError::update(500, "update refused"));
        }
        Ok(())
    }

    fn escape(&self, input: &str) -> String {
        escape_literal(input)
    }
}

struct FakeSource {
    containers: Vec<ContainerRef>,
    items: StdMutex<HashMap<String, Vec<LocalItem>>>,
    failing_containers: StdMutex<HashSet<String>>,
}

impl FakeSource {
    fn new(containers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            containers: containers
                .iter()
                .map(|key| ContainerRef {
                    key: key.to_string(),
                    display_name: key.to_string(),
                })
                .collect(),
            items: StdMutex::new(HashMap::new()),
            failing_containers: StdMutex::new(HashSet::new()),
        })
    }

    fn put_items(&self, container: &str, items: Vec<LocalItem>) {
        self.items.lock().unwrap().insert(container.to_string(), items);
    }

    fn fail_container(&self, container: &str) {
        self.failing_containers
            .lock()
            .unwrap()
            .insert(container.to_string());
    }
}

#[async_trait]
impl ChangeSource for FakeSource {
    async fn list_containers(&self) -> Result<Vec<ContainerRef>, SourceError> {
        Ok(self.containers.clone())
    }

    async fn list_items(&self, container: &ContainerRef) -> Result<Vec<LocalItem>, SourceError> {
        if self.failing_containers.lock().unwrap().contains(&container.key) {
            return Err(SourceError::Enumeration {
                container: container.key.clone(),
                message: "folder database is unavailable".into(),
            });
        }
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&container.key)
            .cloned()
            .unwrap_or_default())
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        None
    }
}

fn message(identifier: &str, container: &str, secs: i64) -> LocalItem {
    LocalItem::new(ItemKind::Message, identifier, container, secs * 1_000_000).unwrap()
}

fn snapshot_row(identifier: &str, secs: i64) -> ResultRow {
    vec![
        Some(item_iri(ItemKind::Message, identifier)),
        Some(identifier.to_string()),
        Some(format_datetime(secs).unwrap()),
    ]
}

async fn make_dedup(dir: &TempDir) -> DedupStore {
    DedupStore::new_at_path(dir.path().join("dedup.db"), 100)
        .await
        .unwrap()
}

fn make_engine(
    client: Arc<FakeStore>,
    source: Arc<FakeSource>,
    dedup: DedupStore,
) -> SyncEngine {
    SyncEngine::new(
        client,
        source,
        dedup,
        TaskQueue::new(Duration::from_millis(1)),
    )
}

async fn drain(queue: &TaskQueue) {
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if queue.size() == 0 && queue.phase() == QueuePhase::Idle {
            break;
        }
    }
}

#[tokio::test]
async fn initialize_aborts_on_connection_error() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::unreachable_store();
    let source = FakeSource::new(&["inbox"]);
    let engine = make_engine(Arc::clone(&client), source, make_dedup(&dir).await);

    let err = engine.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Store(StoreError {
            domain: ErrorDomain::Connection,
            ..
        })
    ));
}

#[tokio::test]
async fn initialize_declares_the_data_source() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    let engine = make_engine(Arc::clone(&client), source, make_dedup(&dir).await);

    engine.initialize().await.unwrap();

    assert_eq!(client.statements_containing("a nie:DataSource"), 1);
}

#[tokio::test]
async fn full_sweep_pushes_unseen_items_and_records_them() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    source.put_items("inbox", vec![message("X", "inbox", 1), message("Y", "inbox", 2)]);
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    let worker = tokio::spawn({
        let queue = engine.queue().clone();
        async move { queue.run().await }
    });
    assert_eq!(engine.schedule_full_sweep().await.unwrap(), 1);
    drain(engine.queue()).await;

    assert_eq!(client.statements_containing("urn:pimsync:message:X"), 1);
    assert_eq!(client.statements_containing("urn:pimsync:message:Y"), 1);
    let known = engine.dedup.lock().await.list_items("inbox").await.unwrap();
    assert_eq!(
        known,
        vec![
            item_iri(ItemKind::Message, "X"),
            item_iri(ItemKind::Message, "Y")
        ]
    );

    // Walking again without local changes pushes nothing.
    engine.schedule_full_sweep().await.unwrap();
    drain(engine.queue()).await;
    assert_eq!(client.statements().len(), 2);

    engine.queue().shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn failed_push_is_not_recorded_and_retries_next_pass() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    client.fail_updates_containing("urn:pimsync:message:Y");
    let source = FakeSource::new(&["inbox"]);
    source.put_items(
        "inbox",
        vec![
            message("X", "inbox", 1),
            message("Y", "inbox", 1),
            message("Z", "inbox", 1),
        ],
    );
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    let worker = tokio::spawn({
        let queue = engine.queue().clone();
        async move { queue.run().await }
    });
    engine.schedule_full_sweep().await.unwrap();
    drain(engine.queue()).await;

    let known = engine.dedup.lock().await.list_items("inbox").await.unwrap();
    assert_eq!(
        known,
        vec![
            item_iri(ItemKind::Message, "X"),
            item_iri(ItemKind::Message, "Z")
        ]
    );
    assert_eq!(client.statements_containing("urn:pimsync:message:Y"), 1);

    // The next enumeration pass retries Y and only Y.
    engine.schedule_full_sweep().await.unwrap();
    drain(engine.queue()).await;
    assert_eq!(client.statements_containing("urn:pimsync:message:Y"), 2);
    assert_eq!(client.statements_containing("urn:pimsync:message:X"), 1);
    assert_eq!(client.statements_containing("urn:pimsync:message:Z"), 1);

    engine.queue().shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn failing_container_is_skipped_and_others_proceed() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["broken", "inbox"]);
    source.fail_container("broken");
    source.put_items("inbox", vec![message("X", "inbox", 1)]);
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    let worker = tokio::spawn({
        let queue = engine.queue().clone();
        async move { queue.run().await }
    });
    engine.schedule_full_sweep().await.unwrap();
    drain(engine.queue()).await;

    assert_eq!(client.statements_containing("urn:pimsync:message:X"), 1);
    engine.queue().shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn added_event_is_indexed_ahead_of_the_backlog() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    let engine = make_engine(Arc::clone(&client), source, make_dedup(&dir).await);

    engine.handle_event(SourceEvent::Added(message("fresh", "inbox", 3)));
    assert_eq!(engine.queue().size(), 1);

    let worker = tokio::spawn({
        let queue = engine.queue().clone();
        async move { queue.run().await }
    });
    drain(engine.queue()).await;

    assert_eq!(client.statements_containing("urn:pimsync:message:fresh"), 1);
    let known = engine.dedup.lock().await.list_items("inbox").await.unwrap();
    assert_eq!(known, vec![item_iri(ItemKind::Message, "fresh")]);

    engine.queue().shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn removed_event_deletes_the_insert_iri_and_forgets_it() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    let engine = make_engine(Arc::clone(&client), source, make_dedup(&dir).await);
    let iri = item_iri(ItemKind::Message, "gone");
    engine.dedup.lock().await.remember("inbox", &iri).await.unwrap();

    engine.handle_event(SourceEvent::Removed {
        kind: ItemKind::Message,
        identifier: "gone".into(),
    });
    let worker = tokio::spawn({
        let queue = engine.queue().clone();
        async move { queue.run().await }
    });
    drain(engine.queue()).await;

    let statements = client.statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].contains(&format!("<{iri}> a rdfs:Resource")));
    assert!(engine.dedup.lock().await.list_items("inbox").await.unwrap().is_empty());

    engine.queue().shutdown();
    worker.await.unwrap();
}

#[tokio::test]
async fn reconcile_applies_the_diff() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    source.put_items("inbox", vec![message("A", "inbox", 10), message("B", "inbox", 5)]);
    client.set_snapshot(vec![snapshot_row("B", 5), snapshot_row("C", 5)]);
    let dedup = make_dedup(&dir).await;
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), dedup);
    let c_iri = item_iri(ItemKind::Message, "C");
    engine.dedup.lock().await.remember("inbox", &c_iri).await.unwrap();

    reconcile_all(
        Arc::clone(&engine.client),
        Arc::clone(&engine.source),
        Arc::clone(&engine.dedup),
    )
    .await
    .unwrap();

    assert_eq!(client.statements_containing("urn:pimsync:message:A"), 1);
    assert_eq!(client.statements_containing("urn:pimsync:message:B"), 0);
    assert_eq!(
        client.statements_containing(&format!("<{c_iri}> a rdfs:Resource")),
        1
    );
    let known = engine.dedup.lock().await.list_items("inbox").await.unwrap();
    assert_eq!(known, vec![item_iri(ItemKind::Message, "A")]);
}

#[tokio::test]
async fn reconcile_update_is_delete_then_insert_of_the_same_iri() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    source.put_items("inbox", vec![message("A", "inbox", 10)]);
    client.set_snapshot(vec![snapshot_row("A", 5)]);
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    reconcile_all(
        Arc::clone(&engine.client),
        Arc::clone(&engine.source),
        Arc::clone(&engine.dedup),
    )
    .await
    .unwrap();

    let statements = client.statements();
    let iri = item_iri(ItemKind::Message, "A");
    assert_eq!(statements.len(), 2);
    assert!(statements[0].contains(&format!("DELETE {{ <{iri}> a rdfs:Resource }}")));
    assert!(statements[1].contains(&format!("<{iri}> a nmo:Email")));
}

#[tokio::test]
async fn reconcile_aborts_entirely_when_the_snapshot_query_fails() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    client.fail_queries();
    let source = FakeSource::new(&["inbox"]);
    source.put_items("inbox", vec![message("A", "inbox", 10)]);
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    let err = reconcile_all(
        Arc::clone(&engine.client),
        Arc::clone(&engine.source),
        Arc::clone(&engine.dedup),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::Store(_)));
    assert!(client.statements().is_empty());
}

#[tokio::test]
async fn reconcile_aborts_when_local_enumeration_fails() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    client.set_snapshot(vec![snapshot_row("C", 5)]);
    let source = FakeSource::new(&["inbox"]);
    source.fail_container("inbox");
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    let err = reconcile_all(
        Arc::clone(&engine.client),
        Arc::clone(&engine.source),
        Arc::clone(&engine.dedup),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::Source(_)));
    assert!(client.statements().is_empty());
}

#[tokio::test]
async fn malformed_snapshot_row_aborts_the_reconciliation() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    client.set_snapshot(vec![vec![
        Some("urn:pimsync:message:A".into()),
        None,
        Some("1970-01-01T00:00:05Z".into()),
    ]]);
    let source = FakeSource::new(&["inbox"]);
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    let err = reconcile_all(
        Arc::clone(&engine.client),
        Arc::clone(&engine.source),
        Arc::clone(&engine.dedup),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::MalformedSnapshot(_)));
    assert!(client.statements().is_empty());
}

#[tokio::test]
async fn identical_snapshots_reconcile_to_nothing() {
    let dir = TempDir::new().unwrap();
    let client = FakeStore::new();
    let source = FakeSource::new(&["inbox"]);
    source.put_items("inbox", vec![message("A", "inbox", 10)]);
    client.set_snapshot(vec![snapshot_row("A", 10)]);
    let engine = make_engine(Arc::clone(&client), Arc::clone(&source), make_dedup(&dir).await);

    reconcile_all(
        Arc::clone(&engine.client),
        Arc::clone(&engine.source),
        Arc::clone(&engine.dedup),
    )
    .await
    .unwrap();

    assert!(client.statements().is_empty());
}

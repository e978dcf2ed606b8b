use std::collections::HashSet;
use std::sync::Arc;

use pimsync_store::{
    ItemError, LocalItem, RemoteRecord, ResultRow, StatementError, StoreClient, StoreError,
    build_delete, build_insert, declare_data_source, item_iri, parse_datetime, snapshot_query,
};
use thiserror::Error;
use tokio::sync::Mutex;

use super::dedup::{DedupError, DedupStore};
use super::queue::{Task, TaskQueue};
use super::reconcile::{ReconcilePlan, reconcile};
use crate::source::{ChangeSource, ContainerRef, SourceError, SourceEvent};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dedup store error: {0}")]
    Dedup(#[from] DedupError),
    #[error("change source error: {0}")]
    Source(#[from] SourceError),
    #[error("statement error: {0}")]
    Statement(#[from] StatementError),
    #[error("invalid item: {0}")]
    Item(#[from] ItemError),
    #[error("malformed snapshot row: {0}")]
    MalformedSnapshot(String),
}

/// The synchronization engine. Walks containers, diffs against the dedup
/// store, and pushes mutation statements through the store client. All of
/// it is serialized over one throttled task queue, so no two mutations for
/// the same item are ever in flight together.
pub struct SyncEngine {
    client: Arc<dyn StoreClient>,
    source: Arc<dyn ChangeSource>,
    dedup: Arc<Mutex<DedupStore>>,
    queue: TaskQueue,
}

impl SyncEngine {
    pub fn new(
        client: Arc<dyn StoreClient>,
        source: Arc<dyn ChangeSource>,
        dedup: DedupStore,
        queue: TaskQueue,
    ) -> Self {
        Self {
            client,
            source,
            dedup: Arc::new(Mutex::new(dedup)),
            queue,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Opens the store connection and declares the engine's data source.
    /// Any failure here aborts engine startup.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.client.open().await?;
        self.client.update(&declare_data_source(), 1).await?;
        Ok(())
    }

    /// Schedules one walk task per container. Returns how many walks were
    /// scheduled; a container listing failure is fatal since nothing can be
    /// walked without it.
    pub async fn schedule_full_sweep(&self) -> Result<usize, EngineError> {
        let containers = self.source.list_containers().await?;
        let count = containers.len();
        for container in containers {
            self.enqueue_walk(container);
        }
        Ok(count)
    }

    pub fn enqueue_walk(&self, container: ContainerRef) {
        let client = Arc::clone(&self.client);
        let source = Arc::clone(&self.source);
        let dedup = Arc::clone(&self.dedup);
        let queue = self.queue.clone();
        let label = format!("walk {}", container.key);
        self.queue.enqueue(Task::new(label, false, async move {
            walk_container(client, source, dedup, queue, container).await?;
            Ok(())
        }));
    }

    /// Schedules a full local/remote reconciliation pass.
    pub fn enqueue_reconcile(&self) {
        let client = Arc::clone(&self.client);
        let source = Arc::clone(&self.source);
        let dedup = Arc::clone(&self.dedup);
        self.queue.enqueue(Task::new("reconcile", false, async move {
            reconcile_all(client, source, dedup).await?;
            Ok(())
        }));
    }

    /// Feeds one live host notification into the queue. Events preempt any
    /// pending enumeration backlog.
    pub fn handle_event(&self, event: SourceEvent) {
        let client = Arc::clone(&self.client);
        let dedup = Arc::clone(&self.dedup);
        match event {
            SourceEvent::Added(item) => {
                let label = format!("index {}", item.identifier);
                self.queue.enqueue(Task::new(label, true, async move {
                    index_item(client, dedup, item).await?;
                    Ok(())
                }));
            }
            SourceEvent::Removed { kind, identifier } => {
                let iri = item_iri(kind, &identifier);
                let label = format!("remove {identifier}");
                self.queue.enqueue(Task::new(label, true, async move {
                    remove_item(client, dedup, iri).await?;
                    Ok(())
                }));
            }
        }
    }
}

/// Enumerates one container and schedules an index task for every item the
/// dedup store has not seen yet. An enumeration failure skips this
/// container only.
async fn walk_container(
    client: Arc<dyn StoreClient>,
    source: Arc<dyn ChangeSource>,
    dedup: Arc<Mutex<DedupStore>>,
    queue: TaskQueue,
    container: ContainerRef,
) -> Result<usize, EngineError> {
    let items = match source.list_items(&container).await {
        Ok(items) => items,
        Err(err) => {
            eprintln!("[pimsyncd] skipping container {}: {err}", container.key);
            return Ok(0);
        }
    };
    let known: HashSet<String> = dedup
        .lock()
        .await
        .list_items(&container.key)
        .await?
        .into_iter()
        .collect();

    let mut scheduled = 0;
    for item in items {
        if known.contains(&item_iri(item.kind, &item.identifier)) {
            continue;
        }
        let client = Arc::clone(&client);
        let dedup = Arc::clone(&dedup);
        let label = format!("index {}", item.identifier);
        queue.enqueue(Task::new(label, false, async move {
            index_item(client, dedup, item).await?;
            Ok(())
        }));
        scheduled += 1;
    }
    if scheduled > 0 {
        eprintln!(
            "[pimsyncd] walk {}: scheduled {scheduled} unseen items",
            container.key
        );
    }
    Ok(scheduled)
}

/// Pushes one item. The dedup store is only touched after the store
/// confirmed the update, so a failed push is retried on the next pass.
async fn index_item(
    client: Arc<dyn StoreClient>,
    dedup: Arc<Mutex<DedupStore>>,
    item: LocalItem,
) -> Result<(), EngineError> {
    let statement = build_insert(std::slice::from_ref(&item), |text| client.escape(text))?;
    client.update(&statement, 1).await?;
    dedup
        .lock()
        .await
        .remember(&item.container_id, &item_iri(item.kind, &item.identifier))
        .await?;
    Ok(())
}

async fn remove_item(
    client: Arc<dyn StoreClient>,
    dedup: Arc<Mutex<DedupStore>>,
    iri: String,
) -> Result<(), EngineError> {
    let statement = build_delete([iri.as_str()]);
    client.update(&statement, 1).await?;
    dedup.lock().await.forget(&iri).await?;
    Ok(())
}

/// Fetches both snapshots, diffs them, and applies the plan. Aborts before
/// applying anything if either snapshot cannot be fetched: a missing
/// container or an unreachable store must never be mistaken for deletions.
async fn reconcile_all(
    client: Arc<dyn StoreClient>,
    source: Arc<dyn ChangeSource>,
    dedup: Arc<Mutex<DedupStore>>,
) -> Result<(), EngineError> {
    let containers = source.list_containers().await?;
    let mut local = Vec::new();
    for container in &containers {
        local.extend(source.list_items(container).await?);
    }
    let remote = fetch_remote_snapshot(&client).await?;
    let plan = reconcile(&local, remote);
    if plan.is_empty() {
        return Ok(());
    }
    eprintln!(
        "[pimsyncd] reconcile: insert={} update={} delete={}",
        plan.to_insert.len(),
        plan.to_update.len(),
        plan.to_delete.len()
    );
    apply_plan(client, dedup, plan).await
}

async fn fetch_remote_snapshot(
    client: &Arc<dyn StoreClient>,
) -> Result<Vec<RemoteRecord>, EngineError> {
    let rows = client.query(&snapshot_query()).await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(urn), Some(identifier), Some(modified)) =
            (column(&row, 0), column(&row, 1), column(&row, 2))
        else {
            return Err(EngineError::MalformedSnapshot(
                "unbound snapshot column".into(),
            ));
        };
        let secs = parse_datetime(modified)
            .map_err(|err| EngineError::MalformedSnapshot(err.to_string()))?;
        records.push(RemoteRecord::new(urn, identifier, secs)?);
    }
    Ok(records)
}

fn column<'a>(row: &'a ResultRow, index: usize) -> Option<&'a str> {
    row.get(index).and_then(|value| value.as_deref())
}

/// Applies a reconciliation plan. Inserts and updates are submitted one
/// statement per item so a single store refusal cannot poison the rest of
/// the pass; deletes share one batched statement and one fate.
async fn apply_plan(
    client: Arc<dyn StoreClient>,
    dedup: Arc<Mutex<DedupStore>>,
    plan: ReconcilePlan,
) -> Result<(), EngineError> {
    let ReconcilePlan {
        to_insert,
        to_update,
        to_delete,
    } = plan;

    for item in to_insert {
        if let Err(err) = index_item(Arc::clone(&client), Arc::clone(&dedup), item.clone()).await {
            eprintln!(
                "[pimsyncd] insert failed for {}, will retry next pass: {err}",
                item.identifier
            );
        }
    }

    for item in to_update {
        // Update is delete-then-insert of the same IRI. Not atomic at the
        // store; a concurrent reader can observe the gap.
        let iri = item_iri(item.kind, &item.identifier);
        if let Err(err) = client.update(&build_delete([iri.as_str()]), 1).await {
            eprintln!(
                "[pimsyncd] update (delete step) failed for {}, will retry next pass: {err}",
                item.identifier
            );
            continue;
        }
        if let Err(err) = index_item(Arc::clone(&client), Arc::clone(&dedup), item.clone()).await {
            eprintln!(
                "[pimsyncd] update (insert step) failed for {}, will retry next pass: {err}",
                item.identifier
            );
        }
    }

    if !to_delete.is_empty() {
        let iris: Vec<&str> = to_delete.iter().map(|record| record.urn.as_str()).collect();
        match client.update(&build_delete(&iris), iris.len()).await {
            Ok(()) => {
                let mut dedup = dedup.lock().await;
                for record in &to_delete {
                    dedup.forget(&record.urn).await?;
                }
            }
            Err(err) => {
                eprintln!("[pimsyncd] delete batch failed, will retry next pass: {err}");
            }
        }
    }

    dedup.lock().await.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

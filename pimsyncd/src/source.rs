use async_trait::async_trait;
use pimsync_store::{ItemKind, LocalItem};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to list containers: {0}")]
    Containers(String),
    #[error("failed to enumerate {container}: {message}")]
    Enumeration { container: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// A stable reference to one local container (a mail folder, a bookmark
/// folder). `key` identifies the container in the dedup store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub key: String,
    pub display_name: String,
}

/// Live change notification from the host, delivered outside the regular
/// enumeration path.
#[derive(Debug)]
pub enum SourceEvent {
    Added(LocalItem),
    Removed { kind: ItemKind, identifier: String },
}

/// What the engine consumes from the host application. The engine never
/// enumerates local data itself; it only walks what an adapter hands over.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerRef>, SourceError>;

    async fn list_items(&self, container: &ContainerRef) -> Result<Vec<LocalItem>, SourceError>;

    /// Hands over the live event stream, once. Returns `None` on later
    /// calls and for sources without live notifications (those are covered
    /// by periodic reconciliation instead).
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>>;
}

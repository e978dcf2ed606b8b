use thiserror::Error;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item identifier is empty")]
    EmptyIdentifier,
    #[error("container id is empty")]
    EmptyContainer,
    #[error("negative local timestamp: {0}")]
    NegativeTimestamp(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Message,
    Bookmark,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Message => "message",
            ItemKind::Bookmark => "bookmark",
        }
    }
}

/// A snapshot of one local item as enumerated by the host. The engine only
/// reads these; the host owns the underlying data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalItem {
    pub kind: ItemKind,
    pub identifier: String,
    pub container_id: String,
    /// Local clock, microseconds. The remote store only keeps seconds, so
    /// comparisons go through `modified_secs`.
    pub last_modified_us: i64,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub received_us: Option<i64>,
    pub url: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

impl LocalItem {
    pub fn new(
        kind: ItemKind,
        identifier: impl Into<String>,
        container_id: impl Into<String>,
        last_modified_us: i64,
    ) -> Result<Self, ItemError> {
        let identifier = identifier.into();
        let container_id = container_id.into();
        if identifier.is_empty() {
            return Err(ItemError::EmptyIdentifier);
        }
        if container_id.is_empty() {
            return Err(ItemError::EmptyContainer);
        }
        if last_modified_us < 0 {
            return Err(ItemError::NegativeTimestamp(last_modified_us));
        }
        Ok(Self {
            kind,
            identifier,
            container_id,
            last_modified_us,
            subject: None,
            body: None,
            received_us: None,
            url: None,
            sender: None,
            recipients: Vec::new(),
        })
    }

    /// Local timestamp downsampled to the store's second resolution.
    pub fn modified_secs(&self) -> i64 {
        self.last_modified_us.div_euclid(1_000_000)
    }
}

/// One engine-owned resource as reported back by the store. Transient,
/// rebuilt on every snapshot query and never persisted locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub urn: String,
    pub identifier: String,
    /// Store-resident timestamp, second resolution.
    pub last_modified_remote: i64,
}

impl RemoteRecord {
    pub fn new(
        urn: impl Into<String>,
        identifier: impl Into<String>,
        last_modified_remote: i64,
    ) -> Result<Self, ItemError> {
        let urn = urn.into();
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(ItemError::EmptyIdentifier);
        }
        if urn.is_empty() {
            return Err(ItemError::EmptyIdentifier);
        }
        Ok(Self {
            urn,
            identifier,
            last_modified_remote,
        })
    }
}

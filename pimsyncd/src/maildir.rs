use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pimsync_store::{ItemError, ItemKind, LocalItem};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tokio::sync::mpsc;

use crate::source::{ChangeSource, ContainerRef, SourceError, SourceEvent};

/// Filesystem-backed change source: every directory under the root is a
/// container, every plain file in it is a message. Live add/remove events
/// come from a recursive `notify` watcher.
pub struct MaildirSource {
    root: PathBuf,
    _watcher: Mutex<Option<RecommendedWatcher>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent>>>,
}

impl MaildirSource {
    /// Enumeration-only source; reconciliation has to cover live changes.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            _watcher: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    pub fn with_watcher(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        let (watcher, events) = start_notify_watcher(&root)?;
        Ok(Self {
            root,
            _watcher: Mutex::new(Some(watcher)),
            events: Mutex::new(Some(events)),
        })
    }
}

#[async_trait]
impl ChangeSource for MaildirSource {
    async fn list_containers(&self) -> Result<Vec<ContainerRef>, SourceError> {
        let mut containers = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|err| SourceError::Containers(err.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| SourceError::Containers(err.to_string()))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| SourceError::Containers(err.to_string()))?;
                let path = entry.path();
                if !file_type.is_dir() || is_hidden(&path) {
                    continue;
                }
                if let Some(key) = relative_key(&self.root, &path) {
                    containers.push(ContainerRef {
                        display_name: entry.file_name().to_string_lossy().into_owned(),
                        key,
                    });
                }
                stack.push(path);
            }
        }
        containers.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(containers)
    }

    async fn list_items(&self, container: &ContainerRef) -> Result<Vec<LocalItem>, SourceError> {
        let dir = self.root.join(&container.key);
        let mut entries =
            tokio::fs::read_dir(&dir)
                .await
                .map_err(|err| SourceError::Enumeration {
                    container: container.key.clone(),
                    message: err.to_string(),
                })?;
        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| SourceError::Enumeration {
                container: container.key.clone(),
                message: err.to_string(),
            })?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| SourceError::Enumeration {
                    container: container.key.clone(),
                    message: err.to_string(),
                })?;
            let path = entry.path();
            if !file_type.is_file() || is_hidden(&path) {
                continue;
            }
            match read_message(&self.root, &path).await {
                Ok(item) => items.push(item),
                Err(err) => {
                    eprintln!(
                        "[pimsyncd] skipping unreadable message {}: {err}",
                        path.display()
                    );
                }
            }
        }
        items.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(items)
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        match self.events.lock() {
            Ok(mut events) => events.take(),
            Err(_) => None,
        }
    }
}

pub fn start_notify_watcher(
    root: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<SourceEvent>), SourceError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for source_event in map_event(&watch_root, event) {
                let _ = tx.send(source_event);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<SourceEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2 {
                let mut mapped = Vec::new();
                if let Some(identifier) = file_identifier(&event.paths[0]) {
                    mapped.push(SourceEvent::Removed {
                        kind: ItemKind::Message,
                        identifier,
                    });
                }
                if let Some(added) = load_added(root, &event.paths[1]) {
                    mapped.push(added);
                }
                return mapped;
            }
            Vec::new()
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| load_added(root, path))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| {
                let identifier = file_identifier(path)?;
                Some(SourceEvent::Removed {
                    kind: ItemKind::Message,
                    identifier,
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Reads the file behind a watcher event. Runs on the notify callback
/// thread, so plain blocking I/O is fine here.
fn load_added(root: &Path, path: &Path) -> Option<SourceEvent> {
    if is_hidden(path) {
        return None;
    }
    let container_key = relative_key(root, path.parent()?)?;
    let identifier = file_identifier(path)?;
    let raw = std::fs::read(path).ok()?;
    let metadata = std::fs::metadata(path).ok()?;
    let modified_us = modified_micros(&metadata)?;
    let text = String::from_utf8_lossy(&raw);
    build_message(&container_key, &identifier, &text, modified_us)
        .ok()
        .map(SourceEvent::Added)
}

async fn read_message(root: &Path, path: &Path) -> Result<LocalItem, SourceError> {
    let container_key = path
        .parent()
        .and_then(|parent| relative_key(root, parent))
        .ok_or_else(|| SourceError::Enumeration {
            container: String::new(),
            message: format!("message outside a container: {}", path.display()),
        })?;
    let identifier = file_identifier(path).ok_or_else(|| SourceError::Enumeration {
        container: container_key.clone(),
        message: format!("unnamed message file: {}", path.display()),
    })?;
    let raw = tokio::fs::read(path).await?;
    let metadata = tokio::fs::metadata(path).await?;
    let modified_us = modified_micros(&metadata).unwrap_or(0);
    let text = String::from_utf8_lossy(&raw);
    build_message(&container_key, &identifier, &text, modified_us).map_err(|err| {
        SourceError::Enumeration {
            container: container_key,
            message: err.to_string(),
        }
    })
}

/// Builds a message item from raw RFC 822-ish text. Header parsing is
/// deliberately shallow: subject, sender, recipients and date are lifted
/// when present, everything else stays in the body.
fn build_message(
    container_key: &str,
    identifier: &str,
    raw: &str,
    modified_us: i64,
) -> Result<LocalItem, ItemError> {
    let (headers, body) = split_message(raw);
    let mut item = LocalItem::new(ItemKind::Message, identifier, container_key, modified_us)?;
    for (name, value) in headers {
        match name.as_str() {
            "subject" => item.subject = Some(value),
            "from" => item.sender = Some(value),
            "to" => {
                item.recipients = value
                    .split(',')
                    .map(str::trim)
                    .filter(|address| !address.is_empty())
                    .map(String::from)
                    .collect();
            }
            "date" => {
                if let Ok(parsed) = OffsetDateTime::parse(&value, &Rfc2822) {
                    item.received_us = Some(parsed.unix_timestamp() * 1_000_000);
                }
            }
            _ => {}
        }
    }
    let body = body.trim();
    if !body.is_empty() {
        item.body = Some(body.to_string());
    }
    Ok(item)
}

fn split_message(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut offset = 0;
    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            offset += line.len();
            break;
        }
        if (line.starts_with(' ') || line.starts_with('\t'))
            && let Some((_, value)) = headers.last_mut()
        {
            // folded header continuation
            value.push(' ');
            value.push_str(trimmed.trim_start());
        } else if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
        }
        offset += line.len();
    }
    (headers, &raw[offset..])
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let key = relative.to_string_lossy().replace('\\', "/");
    if key.is_empty() { None } else { Some(key) }
}

fn file_identifier(path: &Path) -> Option<String> {
    Some(path.file_name()?.to_string_lossy().into_owned())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn modified_micros(metadata: &std::fs::Metadata) -> Option<i64> {
    let modified = metadata.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_micros()).ok()
}

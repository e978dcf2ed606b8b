use std::fs;
use std::path::PathBuf;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;

/// Expected on-disk layout version. Bump whenever the persisted schema
/// changes; a mismatch purges every known-item record and forces a full
/// resync instead of attempting a migration.
pub const SCHEMA_VERSION: i64 = 2;

pub const DEFAULT_BATCH_THRESHOLD: u32 = 100;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

/// Persistent record of which local items have already been pushed to the
/// store. Writes accumulate in one open transaction that is committed every
/// `batch_threshold` writes or whenever a read needs the current state.
///
/// A single engine instance owns the store exclusively; the held
/// transaction is the only mutual-exclusion mechanism.
pub struct DedupStore {
    pool: SqlitePool,
    txn: Option<Transaction<'static, Sqlite>>,
    pending: u32,
    batch_threshold: u32,
}

impl DedupStore {
    pub fn from_pool(pool: SqlitePool, batch_threshold: u32) -> Self {
        Self {
            pool,
            txn: None,
            pending: 0,
            batch_threshold,
        }
    }

    pub async fn new_default(batch_threshold: u32) -> Result<Self, DedupError> {
        Self::new_at_path(default_db_path()?, batch_threshold).await
    }

    pub async fn new_at_path(
        db_path: PathBuf,
        batch_threshold: u32,
    ) -> Result<Self, DedupError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let mut store = Self::from_pool(pool, batch_threshold);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&mut self) -> Result<(), DedupError> {
        self.init_at_version(SCHEMA_VERSION).await
    }

    async fn init_at_version(&mut self, expected: i64) -> Result<(), DedupError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS known_items (
                container_key TEXT NOT NULL,
                item_uri TEXT NOT NULL UNIQUE
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS known_items_container ON known_items (container_key)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let stored = self.stored_version().await?;
        if stored != Some(expected) {
            if let Some(previous) = stored {
                eprintln!(
                    "[pimsyncd] dedup schema version changed ({previous} -> {expected}), forcing full resync"
                );
            }
            self.purge_all().await?;
            sqlx::query(
                "INSERT INTO sync_meta (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(expected.to_string())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn stored_version(&self) -> Result<Option<i64>, DedupError> {
        let row = sqlx::query("SELECT value FROM sync_meta WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        Ok(value.parse().ok())
    }

    /// Drops every known-item record so the next enumeration pass re-pushes
    /// everything.
    pub async fn purge_all(&mut self) -> Result<(), DedupError> {
        self.flush().await?;
        sqlx::query("DELETE FROM known_items")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks an item as pushed. Unique per `item_uri`; re-remembering moves
    /// the record to the new container.
    pub async fn remember(&mut self, container_key: &str, item_uri: &str) -> Result<(), DedupError> {
        self.begin_if_needed().await?;
        if let Some(txn) = self.txn.as_mut() {
            sqlx::query(
                "INSERT INTO known_items (container_key, item_uri) VALUES (?1, ?2)
                 ON CONFLICT(item_uri) DO UPDATE SET container_key = excluded.container_key",
            )
            .bind(container_key)
            .bind(item_uri)
            .execute(&mut **txn)
            .await?;
        }
        self.note_write().await
    }

    pub async fn forget(&mut self, item_uri: &str) -> Result<(), DedupError> {
        self.begin_if_needed().await?;
        if let Some(txn) = self.txn.as_mut() {
            sqlx::query("DELETE FROM known_items WHERE item_uri = ?1")
                .bind(item_uri)
                .execute(&mut **txn)
                .await?;
        }
        self.note_write().await
    }

    /// Commits any accumulated writes.
    pub async fn flush(&mut self) -> Result<(), DedupError> {
        if let Some(txn) = self.txn.take() {
            txn.commit().await?;
        }
        self.pending = 0;
        Ok(())
    }

    /// All item URIs known for a container, ordered. Flushes first so reads
    /// always observe preceding writes.
    pub async fn list_items(&mut self, container_key: &str) -> Result<Vec<String>, DedupError> {
        self.flush().await?;
        let rows = sqlx::query(
            "SELECT item_uri FROM known_items WHERE container_key = ?1 ORDER BY item_uri ASC",
        )
        .bind(container_key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("item_uri").map_err(DedupError::from))
            .collect()
    }

    async fn begin_if_needed(&mut self) -> Result<(), DedupError> {
        if self.txn.is_none() {
            self.txn = Some(self.pool.begin().await?);
        }
        Ok(())
    }

    async fn note_write(&mut self) -> Result<(), DedupError> {
        self.pending += 1;
        if self.pending >= self.batch_threshold {
            self.flush().await?;
        }
        Ok(())
    }
}

fn default_db_path() -> Result<PathBuf, DedupError> {
    let mut path = dirs::data_dir().ok_or(DedupError::MissingDataDir)?;
    path.push("pimsync");
    path.push("dedup.db");
    Ok(path)
}

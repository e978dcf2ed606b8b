use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pimsync_store::HttpStoreClient;

use crate::maildir::MaildirSource;
use crate::source::ChangeSource;
use crate::sync::dedup::{DEFAULT_BATCH_THRESHOLD, DedupStore};
use crate::sync::engine::SyncEngine;
use crate::sync::queue::TaskQueue;

const DEFAULT_STORE_URL: &str = "http://127.0.0.1:3030/";
const DEFAULT_MAIL_DIR_NAME: &str = "Mail";
const DEFAULT_INDEX_DELAY_MS: u64 = 500;
const DEFAULT_RECONCILE_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub store_url: String,
    pub mail_root: PathBuf,
    pub db_path: Option<PathBuf>,
    pub index_delay: Duration,
    pub batch_threshold: u32,
    pub reconcile_interval: Duration,
    pub enable_watcher: bool,
    pub force_resync: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let store_url =
            std::env::var("PIMSYNC_STORE_URL").unwrap_or_else(|_| DEFAULT_STORE_URL.to_string());
        let mail_root = std::env::var("PIMSYNC_MAIL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(DEFAULT_MAIL_DIR_NAME));
        let db_path = std::env::var("PIMSYNC_DB_PATH").ok().map(PathBuf::from);
        let index_delay = Duration::from_millis(parse_u64(
            std::env::var("PIMSYNC_INDEX_DELAY_MS").ok(),
            DEFAULT_INDEX_DELAY_MS,
        ));
        let batch_threshold = parse_u64(
            std::env::var("PIMSYNC_BATCH_THRESHOLD").ok(),
            u64::from(DEFAULT_BATCH_THRESHOLD),
        ) as u32;
        let reconcile_interval = Duration::from_secs(parse_u64(
            std::env::var("PIMSYNC_RECONCILE_SECS").ok(),
            DEFAULT_RECONCILE_SECS,
        ));
        let enable_watcher = parse_bool(std::env::var("PIMSYNC_ENABLE_WATCHER").ok(), true);

        Ok(Self {
            store_url,
            mail_root,
            db_path,
            index_delay,
            batch_threshold,
            reconcile_interval,
            enable_watcher,
            force_resync: false,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    source: Arc<MaildirSource>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = Arc::new(
            HttpStoreClient::new(&config.store_url)
                .with_context(|| format!("invalid store url: {}", config.store_url))?,
        );
        let mut dedup = match &config.db_path {
            Some(path) => DedupStore::new_at_path(path.clone(), config.batch_threshold).await,
            None => DedupStore::new_default(config.batch_threshold).await,
        }
        .context("failed to initialize dedup store")?;
        if config.force_resync {
            dedup
                .purge_all()
                .await
                .context("failed to purge dedup store")?;
            eprintln!("[pimsyncd] forced full resync: all known items purged");
        }

        let source = if config.enable_watcher {
            MaildirSource::with_watcher(&config.mail_root)
                .context("failed to start mail watcher")?
        } else {
            MaildirSource::new(&config.mail_root)
        };
        let source = Arc::new(source);

        let queue = TaskQueue::new(config.index_delay);
        let engine = Arc::new(SyncEngine::new(
            client,
            Arc::clone(&source) as Arc<dyn ChangeSource>,
            dedup,
            queue,
        ));
        engine
            .initialize()
            .await
            .context("store connection failed")?;

        Ok(Self {
            config,
            engine,
            source,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[pimsyncd] started: mail_root={}, store={}, watcher={}",
            self.config.mail_root.display(),
            self.config.store_url,
            if self.config.enable_watcher {
                "enabled"
            } else {
                "disabled"
            }
        );

        let queue = self.engine.queue().clone();
        let worker = tokio::spawn(async move { queue.run().await });

        if let Some(mut events) = self.source.subscribe() {
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    engine.handle_event(event);
                }
            });
        }

        match self.engine.schedule_full_sweep().await {
            Ok(count) => eprintln!("[pimsyncd] initial sweep: {count} containers scheduled"),
            Err(err) => eprintln!("[pimsyncd] initial sweep failed: {err}"),
        }

        let engine_for_reconcile = Arc::clone(&self.engine);
        let reconcile_interval = self.config.reconcile_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reconcile_interval).await;
                engine_for_reconcile.enqueue_reconcile();
            }
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for shutdown signal")?;
        eprintln!("[pimsyncd] shutting down: finishing in-flight task");
        self.engine.queue().shutdown();
        let _ = worker.await;
        Ok(())
    }
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

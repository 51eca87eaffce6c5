//! Local-first record storage over a directory of markdown files.
//!
//! Records live in memory as typed structs and on disk as markdown files
//! with a YAML frontmatter header, one file per record. The engine keeps
//! both sides consistent while external tools (editors, `git checkout`,
//! sync clients) rewrite the files underneath it: local mutations are
//! debounced and flushed to disk, external edits are watched, coalesced
//! and folded back into memory, and concurrent edits to the same file
//! surface as explicit [`Conflict`]s for the caller to resolve.

mod codec;
mod collection;
mod coordinator;
mod errors;
mod models;
mod query;
mod store;
mod watch;

pub use codec::{decode, encode, CodecError, DecodeMode};
pub use collection::{ChangeKind, CollectionEvent, RecordCollection, Subscription};
pub use coordinator::{Conflict, Resolution, SyncCoordinator};
pub use errors::{StoreError, StoreResult};
pub use models::{Clock, Position, Record, RecordKind, RecordStatus, SystemClock};
pub use query::{count_by_status, count_by_tag, Filter};
pub use store::{FileStore, KindLoad, WriteAck};
pub use watch::{FsChange, FsEventKind, WatchConfig, WatchHandle, WatchService, WriteTracker};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Tuning knobs for [`Engine::open`]. The defaults match interactive use:
/// local edits reach disk within roughly half a second, and watcher noise
/// from editors doing write-temp-then-rename collapses into single events.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the record tree. Created if missing.
    pub root: PathBuf,
    /// Quiet period between a local mutation and its write to disk.
    pub debounce_interval: Duration,
    /// Window in which rapid watcher notifications for one path collapse.
    pub coalesce_window: Duration,
    /// How long after one of our own writes a watcher event for that path
    /// is still attributed to us and dropped.
    pub self_write_grace: Duration,
    /// Disable to run without a filesystem watcher (batch tooling, tests
    /// that drive the coordinator by hand).
    pub watch_enabled: bool,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce_interval: Duration::from_millis(500),
            coalesce_window: Duration::from_millis(200),
            self_write_grace: Duration::from_millis(1500),
            watch_enabled: true,
        }
    }
}

/// Owns the moving parts: one [`RecordCollection`] per [`RecordKind`], the
/// shared [`FileStore`], the [`SyncCoordinator`], and (when enabled) the
/// watcher plus the pump task feeding its events into the coordinator.
pub struct Engine {
    store: Arc<FileStore>,
    collections: HashMap<RecordKind, Arc<RecordCollection>>,
    coordinator: Arc<SyncCoordinator>,
    watch_handle: Option<WatchHandle>,
    pump: Option<JoinHandle<()>>,
}

impl Engine {
    /// Bring the engine up against `config.root`: ensure the directory
    /// layout, bulk-load every kind (corrupt files are logged and skipped,
    /// never fatal), then start watching for external changes.
    pub async fn open(config: EngineConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        // The native watcher reports canonical paths; the store must derive
        // the same ones or self-write suppression misses.
        let root = config.root.canonicalize()?;

        let tracker = Arc::new(WriteTracker::new(config.self_write_grace));
        let store = Arc::new(FileStore::new(root.clone(), tracker.clone()));
        store.ensure_layout()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let mut collections = HashMap::new();
        for kind in RecordKind::all() {
            let collection = RecordCollection::new(
                kind,
                store.clone(),
                clock.clone(),
                config.debounce_interval,
            );
            let load = collection.load_from_disk().await?;
            for (path, reason) in &load.skipped {
                warn!(kind = kind.as_str(), path = %path.display(), %reason, "skipping unreadable record file");
            }
            collections.insert(kind, collection);
        }

        let coordinator = Arc::new(SyncCoordinator::new(store.clone(), collections.clone()));

        let (watch_handle, pump) = if config.watch_enabled {
            let watch_config = WatchConfig {
                coalesce_window: config.coalesce_window,
                ..WatchConfig::default()
            };
            let (handle, changes) = WatchService::start(&root, tracker, watch_config)?;
            let pump = tokio::spawn(pump_changes(changes, coordinator.clone()));
            (Some(handle), Some(pump))
        } else {
            (None, None)
        };

        Ok(Self {
            store,
            collections,
            coordinator,
            watch_handle,
            pump,
        })
    }

    pub fn collection(&self, kind: RecordKind) -> &Arc<RecordCollection> {
        &self.collections[&kind]
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Flush every dirty record to disk, then stop the background tasks.
    /// The first flush failure is returned, but teardown still completes
    /// for the remaining collections.
    pub async fn shutdown(mut self) -> StoreResult<()> {
        let mut first_error = None;
        for collection in self.collections.values() {
            if let Err(err) = collection.flush_all().await {
                warn!(kind = collection.kind().as_str(), error = %err, "flush on shutdown failed");
                first_error.get_or_insert(err);
            }
        }
        if let Some(handle) = self.watch_handle.take() {
            handle.join().await;
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
        for collection in self.collections.values() {
            collection.close();
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn pump_changes(
    mut changes: mpsc::UnboundedReceiver<FsChange>,
    coordinator: Arc<SyncCoordinator>,
) {
    while let Some(change) = changes.recv().await {
        if let Err(err) = coordinator.handle_change(change).await {
            warn!(error = %err, "failed to apply external change");
        }
    }
}

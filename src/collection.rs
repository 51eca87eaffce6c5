//! The authoritative in-memory record set for one kind, with debounced
//! write-back.
//!
//! All state sits behind one tokio mutex (the collection's serializer):
//! mutations for the same record are linearized, and the flush task takes the
//! same lock, so timer state never races with edits. Write scheduling is a
//! small state machine {Idle, Scheduled(deadline)}; each mutation re-arms the
//! shared timer rather than stacking a new one, so a burst of edits produces
//! one write per touched record.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, Notify};

use crate::codec;
use crate::errors::{StoreError, StoreResult};
use crate::models::{Clock, Record, RecordKind};
use crate::query::Filter;
use crate::store::{FileStore, KindLoad};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
    Archived,
    Restored,
    /// Overwritten from disk after an external change or conflict resolution.
    Reloaded,
}

#[derive(Debug, Clone)]
pub struct CollectionEvent {
    pub kind: ChangeKind,
    pub record_id: String,
}

type Subscriber = Box<dyn Fn(&CollectionEvent) + Send + Sync>;

/// Cancellation handle for a change subscription. Dropping it without calling
/// [`Subscription::cancel`] keeps the subscription alive.
pub struct Subscription {
    id: u64,
    subscribers: Arc<StdMutex<HashMap<u64, Subscriber>>>,
}

impl Subscription {
    pub fn cancel(self) {
        let mut subscribers = self.subscribers.lock().expect("subscriber registry lock");
        subscribers.remove(&self.id);
    }
}

#[derive(Debug, Clone, Copy)]
enum DebounceState {
    Idle,
    Scheduled { deadline: tokio::time::Instant },
}

struct CollectionInner {
    records: BTreeMap<String, Record>,
    /// id -> current on-disk path, maintained across relocations.
    paths: HashMap<String, PathBuf>,
    /// ids with unflushed changes.
    dirty: BTreeSet<String>,
    /// ids excluded from flushing while a conflict on their path is open.
    /// Flushing one of these would overwrite the disk version the user may
    /// still choose to keep.
    held: BTreeSet<String>,
    debounce: DebounceState,
    /// path -> mtime of the last write this engine performed (or observed at
    /// load). The coordinator compares external mtimes against these.
    acked: HashMap<PathBuf, DateTime<Utc>>,
}

pub struct RecordCollection {
    kind: RecordKind,
    store: Arc<FileStore>,
    clock: Arc<dyn Clock>,
    debounce_interval: Duration,
    inner: Arc<Mutex<CollectionInner>>,
    rearm: Notify,
    shutdown: watch::Sender<bool>,
    subscribers: Arc<StdMutex<HashMap<u64, Subscriber>>>,
    next_subscriber: AtomicU64,
}

impl RecordCollection {
    pub fn new(
        kind: RecordKind,
        store: Arc<FileStore>,
        clock: Arc<dyn Clock>,
        debounce_interval: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let collection = Arc::new(Self {
            kind,
            store,
            clock,
            debounce_interval,
            inner: Arc::new(Mutex::new(CollectionInner {
                records: BTreeMap::new(),
                paths: HashMap::new(),
                dirty: BTreeSet::new(),
                held: BTreeSet::new(),
                debounce: DebounceState::Idle,
                acked: HashMap::new(),
            })),
            rearm: Notify::new(),
            shutdown: shutdown_tx,
            subscribers: Arc::new(StdMutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
        });

        tokio::spawn(Self::run_flush_loop(collection.clone(), shutdown_rx));
        collection
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Stop the background flush task. Pending dirty records are NOT flushed
    /// here; callers wanting durability run [`Self::flush_all`] first (the
    /// engine's shutdown does).
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Bulk load from disk. Active records become the in-memory set; archived
    /// records stay on disk only. Returns the store's skip list for corrupt
    /// files.
    pub async fn load_from_disk(&self) -> StoreResult<KindLoad> {
        let load = self.store.load_kind(self.kind)?;
        let mut inner = self.inner.lock().await;
        for (record, path) in &load.records {
            let stamp = self.store.modified_time(path)?;
            inner.acked.insert(path.clone(), stamp);
            if !record.is_archived() {
                inner.paths.insert(record.id.clone(), path.clone());
                inner.records.insert(record.id.clone(), record.clone());
            }
        }
        if !load.skipped.is_empty() {
            tracing::warn!(
                kind = self.kind.as_str(),
                skipped = load.skipped.len(),
                "bulk load skipped unparsable files"
            );
        }
        Ok(load)
    }

    /// Write every dirty record now and disarm the timer. Used at shutdown.
    pub async fn flush_all(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.debounce = DebounceState::Idle;
        self.flush_dirty_locked(&mut inner);
        // Held ids are not failures: their disk version is deliberately left
        // untouched until the open conflict is resolved.
        let stuck = inner
            .dirty
            .iter()
            .filter(|id| !inner.held.contains(*id))
            .count();
        if stuck == 0 {
            Ok(())
        } else {
            Err(StoreError::Io(format!(
                "{stuck} record(s) still dirty after forced flush"
            )))
        }
    }

    // ---- mutation ----------------------------------------------------------

    /// Insert a freshly created record. Immediately visible in memory; the
    /// file appears on the next debounce flush.
    pub async fn add(&self, record: Record) -> StoreResult<()> {
        self.check_kind(&record)?;
        let id = record.id.clone();
        {
            let mut inner = self.inner.lock().await;
            let path = self.store.record_path(&record);
            inner.paths.insert(id.clone(), path);
            inner.records.insert(id.clone(), record);
            inner.dirty.insert(id.clone());
            self.arm_locked(&mut inner);
        }
        self.emit(ChangeKind::Added, &id);
        Ok(())
    }

    /// Replace an existing record's attributes. Bumps `updated` and schedules
    /// a write.
    pub async fn update(&self, mut record: Record) -> StoreResult<()> {
        self.check_kind(&record)?;
        let id = record.id.clone();
        {
            let mut inner = self.inner.lock().await;
            if !inner.records.contains_key(&id) {
                return Err(StoreError::NotFound(format!("record '{id}' not loaded")));
            }
            record.touch(self.clock.as_ref());
            inner.records.insert(id.clone(), record);
            inner.dirty.insert(id.clone());
            self.arm_locked(&mut inner);
        }
        self.emit(ChangeKind::Updated, &id);
        Ok(())
    }

    /// Hard delete: file and entry removed. Idempotent; deleting a record
    /// that already disappeared (externally or otherwise) is Ok.
    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        let existed = {
            let mut inner = self.inner.lock().await;
            let record = inner.records.remove(id);
            inner.dirty.remove(id);
            inner.held.remove(id);
            let path = inner.paths.remove(id);
            if let Some(path) = &path {
                inner.acked.remove(path);
            }
            match (record, path) {
                (Some(_), Some(path)) => {
                    self.store.remove_path(&path)?;
                    true
                }
                (Some(record), None) => {
                    self.store.delete(&record)?;
                    true
                }
                _ => false,
            }
        };
        if existed {
            self.emit(ChangeKind::Removed, id);
        }
        Ok(())
    }

    /// Archival: relocate the file into its archive bucket, drop the entry
    /// from the active set. Runs synchronously, since a relocation must never
    /// leave both copies, so it does not ride the debounce timer.
    pub async fn archive(&self, id: &str) -> StoreResult<Record> {
        let record = {
            let mut inner = self.inner.lock().await;
            let mut record = inner
                .records
                .remove(id)
                .ok_or_else(|| StoreError::NotFound(format!("record '{id}' not loaded")))?;
            inner.dirty.remove(id);
            let old_path = inner
                .paths
                .remove(id)
                .unwrap_or_else(|| self.store.record_path(&record));
            inner.acked.remove(&old_path);

            record.archived_at = Some(self.clock.now());
            record.touch(self.clock.as_ref());
            let ack = self.store.relocate(&record, &old_path)?;
            inner.acked.insert(ack.path, ack.stamp);
            record
        };
        self.emit(ChangeKind::Archived, id);
        Ok(record)
    }

    /// Bring an archived record back into the active set.
    pub async fn restore(&self, id: &str) -> StoreResult<Record> {
        let record = {
            let mut inner = self.inner.lock().await;
            if inner.records.contains_key(id) {
                return Err(StoreError::Internal(format!("record '{id}' is not archived")));
            }
            let (mut record, old_path) = self
                .store
                .find_record(self.kind, id)?
                .ok_or_else(|| StoreError::NotFound(format!("record '{id}' not found on disk")))?;

            record.archived_at = None;
            record.touch(self.clock.as_ref());
            let ack = self.store.relocate(&record, &old_path)?;
            inner.acked.remove(&old_path);
            inner.acked.insert(ack.path.clone(), ack.stamp);
            inner.paths.insert(id.to_string(), ack.path);
            inner.records.insert(id.to_string(), record.clone());
            record
        };
        self.emit(ChangeKind::Restored, id);
        Ok(record)
    }

    /// Synchronous durable write of one record, cancelling only that record's
    /// pending timer slot. The rest of the dirty set stays scheduled.
    pub async fn save_immediately(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("record '{id}' not loaded")))?;
        let ack = self.store.write(&record)?;
        inner.dirty.remove(id);
        inner.paths.insert(id.to_string(), ack.path.clone());
        inner.acked.insert(ack.path, ack.stamp);
        if inner.dirty.is_empty() {
            inner.debounce = DebounceState::Idle;
        }
        Ok(())
    }

    // ---- reads -------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Option<Record> {
        self.inner.lock().await.records.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Record> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.records.is_empty()
    }

    pub async fn query(&self, filter: &Filter) -> Vec<Record> {
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Register a change callback. Callbacks run inline on the serializer and
    /// must not block or call back into the collection.
    pub fn subscribe(&self, callback: impl Fn(&CollectionEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().expect("subscriber registry lock");
        subscribers.insert(id, Box::new(callback));
        Subscription {
            id,
            subscribers: self.subscribers.clone(),
        }
    }

    // ---- coordinator interface --------------------------------------------

    /// Overwrite the in-memory record with a version read from disk. Clears
    /// any pending change for that id (disk is authoritative once this is
    /// called) and acknowledges the given stamp.
    pub async fn apply_external(
        &self,
        record: Record,
        path: &Path,
        stamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_kind(&record)?;
        let id = record.id.clone();
        {
            let mut inner = self.inner.lock().await;
            inner.dirty.remove(&id);
            inner.held.remove(&id);
            inner.acked.insert(path.to_path_buf(), stamp);
            inner.paths.insert(id.clone(), path.to_path_buf());
            if record.is_archived() {
                inner.records.remove(&id);
            } else {
                inner.records.insert(id.clone(), record);
            }
        }
        self.emit(ChangeKind::Reloaded, &id);
        Ok(())
    }

    /// Drop the record backed by `path` after its file disappeared
    /// externally. Unknown paths are Ok.
    pub async fn remove_external(&self, path: &Path) -> StoreResult<()> {
        let removed = {
            let mut inner = self.inner.lock().await;
            inner.acked.remove(path);
            let id = inner
                .paths
                .iter()
                .find(|(_, candidate)| candidate.as_path() == path)
                .map(|(id, _)| id.clone());
            match id {
                Some(id) => {
                    inner.paths.remove(&id);
                    inner.records.remove(&id);
                    inner.dirty.remove(&id);
                    inner.held.remove(&id);
                    Some(id)
                }
                None => None,
            }
        };
        if let Some(id) = removed {
            self.emit(ChangeKind::Removed, &id);
        }
        Ok(())
    }

    /// True when the record backed by `path` has an unflushed local change.
    pub async fn has_pending_change(&self, path: &Path) -> bool {
        let inner = self.inner.lock().await;
        inner
            .paths
            .iter()
            .any(|(id, candidate)| candidate.as_path() == path && inner.dirty.contains(id))
    }

    /// The mtime of the last write this engine made (or acknowledged) for a
    /// path.
    pub async fn acknowledged(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.inner.lock().await.acked.get(path).copied()
    }

    /// The in-memory record backed by `path` plus its encoded text, the
    /// "ours" side of a conflict.
    pub async fn pending_snapshot(&self, path: &Path) -> StoreResult<Option<(Record, String)>> {
        let inner = self.inner.lock().await;
        let id = inner
            .paths
            .iter()
            .find(|(_, candidate)| candidate.as_path() == path)
            .map(|(id, _)| id.clone());
        let Some(id) = id else { return Ok(None) };
        let Some(record) = inner.records.get(&id) else {
            return Ok(None);
        };
        let text = codec::encode(record)?;
        Ok(Some((record.clone(), text)))
    }

    /// Record a stamp for a path without touching the in-memory record. Used
    /// when an external rewrite could not be parsed: the previous version is
    /// kept, but the broken write must not re-classify forever.
    pub async fn acknowledge(&self, path: &Path, stamp: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        inner.acked.insert(path.to_path_buf(), stamp);
    }

    /// Keep the record backed by `path` out of debounce flushes while its
    /// conflict is open. The disk version must survive until a resolution
    /// decides its fate.
    pub async fn hold_pending(&self, path: &Path) {
        let mut inner = self.inner.lock().await;
        let id = inner
            .paths
            .iter()
            .find(|(_, candidate)| candidate.as_path() == path)
            .map(|(id, _)| id.clone());
        if let Some(id) = id {
            inner.held.insert(id);
        }
    }

    /// Lift a hold placed by [`Self::hold_pending`]. If the record is still
    /// dirty the timer is re-armed so the write happens on schedule.
    pub async fn release_pending(&self, path: &Path) {
        let mut inner = self.inner.lock().await;
        let id = inner
            .paths
            .iter()
            .find(|(_, candidate)| candidate.as_path() == path)
            .map(|(id, _)| id.clone());
        if let Some(id) = id {
            inner.held.remove(&id);
            if inner.dirty.contains(&id) {
                self.arm_locked(&mut inner);
            }
        }
    }

    pub async fn id_for_path(&self, path: &Path) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .paths
            .iter()
            .find(|(_, candidate)| candidate.as_path() == path)
            .map(|(id, _)| id.clone())
    }

    // ---- internals ---------------------------------------------------------

    fn check_kind(&self, record: &Record) -> StoreResult<()> {
        if record.kind != self.kind {
            return Err(StoreError::KindMismatch {
                id: record.id.clone(),
                expected: self.kind.as_str(),
                actual: record.kind.as_str(),
            });
        }
        Ok(())
    }

    /// (Re)start the shared debounce timer. Reset, never stack.
    fn arm_locked(&self, inner: &mut CollectionInner) {
        inner.debounce = DebounceState::Scheduled {
            deadline: tokio::time::Instant::now() + self.debounce_interval,
        };
        self.rearm.notify_one();
    }

    /// Write every dirty record in one pass. Failed writes stay dirty and are
    /// retried on the next scheduled flush rather than immediately. Held ids
    /// are skipped entirely; they flow again once their hold is lifted.
    fn flush_dirty_locked(&self, inner: &mut CollectionInner) {
        let ids: Vec<String> = inner.dirty.iter().cloned().collect();
        for id in ids {
            if inner.held.contains(&id) {
                continue;
            }
            let Some(record) = inner.records.get(&id).cloned() else {
                inner.dirty.remove(&id);
                continue;
            };
            match self.store.write(&record) {
                Ok(ack) => {
                    inner.dirty.remove(&id);
                    inner.paths.insert(id.clone(), ack.path.clone());
                    inner.acked.insert(ack.path, ack.stamp);
                }
                Err(error) => {
                    tracing::warn!(
                        record_id = %id,
                        error = %error,
                        "debounced write failed; will retry on next flush"
                    );
                }
            }
        }
    }

    fn emit(&self, kind: ChangeKind, record_id: &str) {
        let event = CollectionEvent {
            kind,
            record_id: record_id.to_string(),
        };
        let subscribers = self.subscribers.lock().expect("subscriber registry lock");
        for subscriber in subscribers.values() {
            subscriber(&event);
        }
    }

    async fn run_flush_loop(collection: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            // Park until a mutation arms the timer.
            let deadline = loop {
                match collection.inner.lock().await.debounce {
                    DebounceState::Scheduled { deadline } => break deadline,
                    DebounceState::Idle => {}
                }
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = collection.rearm.notified() => {}
                }
            };

            tokio::select! {
                _ = shutdown.changed() => return,
                // Deadline moved by a newer mutation; re-read it.
                _ = collection.rearm.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let mut inner = collection.inner.lock().await;
                    if let DebounceState::Scheduled { deadline } = inner.debounce {
                        if deadline <= tokio::time::Instant::now() {
                            inner.debounce = DebounceState::Idle;
                            collection.flush_dirty_locked(&mut inner);
                        }
                    }
                }
            }
        }
    }
}

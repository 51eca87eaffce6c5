//! Arbitration between external file changes and in-memory state.
//!
//! Per-path flow: an observed modify is classified against the collection's
//! last-acknowledged write stamp: older or equal is spurious, newer with no
//! pending local change reloads silently, newer with a pending change raises
//! a conflict and suspends automatic reload of that path until a resolution
//! call settles it. Creates and deletes route directly; deletes never
//! conflict (last-writer-wins for disappearance).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::codec::{self, CodecError, DecodeMode};
use crate::collection::RecordCollection;
use crate::errors::{StoreError, StoreResult};
use crate::models::{Record, RecordKind};
use crate::store::FileStore;
use crate::watch::{FsChange, FsEventKind};

/// A detected divergence: an unflushed in-memory edit versus a newer on-disk
/// version of the same record. Queued until explicitly resolved.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub id: String,
    pub record_id: String,
    pub kind: RecordKind,
    pub path: PathBuf,
    /// Serialized in-memory version (the unsaved local edit).
    pub ours: String,
    /// File content observed on disk.
    pub theirs: String,
    pub ours_modified: DateTime<Utc>,
    pub theirs_modified: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn ours_record(&self) -> Result<Record, CodecError> {
        codec::decode(&self.ours, DecodeMode::Lenient)
    }

    pub fn theirs_record(&self) -> Result<Record, CodecError> {
        codec::decode(&self.theirs, DecodeMode::Lenient)
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// Re-persist the in-memory version over disk.
    KeepMine,
    /// Load the disk version, discarding the pending local change.
    KeepDisk,
    /// Back up the unsaved local version to a timestamped sibling file, then
    /// load the disk version.
    KeepBoth,
    /// Write caller-supplied final text and load it.
    Merge(String),
}

#[derive(Default)]
struct CoordinatorState {
    conflicts: Vec<Conflict>,
    /// Paths with an open conflict: automatic reload is suspended for these.
    suspended: HashSet<PathBuf>,
}

pub struct SyncCoordinator {
    store: Arc<FileStore>,
    collections: HashMap<RecordKind, Arc<RecordCollection>>,
    state: Mutex<CoordinatorState>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<FileStore>,
        collections: HashMap<RecordKind, Arc<RecordCollection>>,
    ) -> Self {
        Self {
            store,
            collections,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    /// Route one normalized watcher event.
    pub async fn handle_change(&self, change: FsChange) -> StoreResult<()> {
        let Some(kind) = self.store.kind_for_path(&change.path) else {
            return Ok(());
        };
        let Some(collection) = self.collections.get(&kind) else {
            return Ok(());
        };

        match change.kind {
            FsEventKind::Created => self.handle_created(collection, &change.path).await,
            FsEventKind::Removed => self.handle_removed(collection, &change.path).await,
            FsEventKind::Modified => self.handle_modified(collection, kind, &change.path).await,
        }
    }

    pub async fn pending_conflicts(&self) -> Vec<Conflict> {
        self.state.lock().await.conflicts.clone()
    }

    /// Settle one queued conflict. Every variant ends with the file and the
    /// in-memory record identical, the conflict removed, and the path watched
    /// again. A failed resolution re-queues the conflict and keeps the path
    /// suspended.
    pub async fn resolve(&self, conflict_id: &str, resolution: Resolution) -> StoreResult<()> {
        let conflict = {
            let mut state = self.state.lock().await;
            let position = state
                .conflicts
                .iter()
                .position(|candidate| candidate.id == conflict_id)
                .ok_or_else(|| StoreError::NotFound(format!("conflict '{conflict_id}'")))?;
            state.conflicts.remove(position)
        };

        let result = self.apply_resolution(&conflict, &resolution).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.suspended.remove(&conflict.path);
                drop(state);
                if let Some(collection) = self.collections.get(&conflict.kind) {
                    collection.release_pending(&conflict.path).await;
                }
                tracing::info!(
                    record_id = %conflict.record_id,
                    path = %conflict.path.display(),
                    "conflict resolved"
                );
                Ok(())
            }
            Err(error) => {
                state.conflicts.push(conflict);
                Err(error)
            }
        }
    }

    async fn apply_resolution(&self, conflict: &Conflict, resolution: &Resolution) -> StoreResult<()> {
        let collection = self
            .collections
            .get(&conflict.kind)
            .ok_or_else(|| StoreError::Internal(format!("no collection for {}", conflict.kind.as_str())))?;

        match resolution {
            Resolution::KeepMine => collection.save_immediately(&conflict.record_id).await,
            Resolution::KeepDisk => self.load_disk_version(collection, &conflict.path).await,
            Resolution::KeepBoth => {
                let backup = backup_path(&conflict.path, Utc::now());
                self.store.write_text(&backup, &conflict.ours)?;
                tracing::info!(backup = %backup.display(), "local version backed up before loading the disk version");
                self.load_disk_version(collection, &conflict.path).await
            }
            Resolution::Merge(text) => {
                let record = codec::decode(text, DecodeMode::Lenient)?;
                let stamp = self.store.write_text(&conflict.path, text)?;
                collection.apply_external(record, &conflict.path, stamp).await
            }
        }
    }

    async fn handle_created(
        &self,
        collection: &Arc<RecordCollection>,
        path: &Path,
    ) -> StoreResult<()> {
        if self.state.lock().await.suspended.contains(path) {
            return Ok(());
        }
        // A create for an already-known identifier is just a modify.
        if collection.id_for_path(path).await.is_some() {
            let kind = collection.kind();
            return self.classify_modified(collection, kind, path).await;
        }
        self.insert_from_disk(collection, path).await
    }

    async fn insert_from_disk(
        &self,
        collection: &Arc<RecordCollection>,
        path: &Path,
    ) -> StoreResult<()> {
        match self.store.read_record(path) {
            Ok(record) => {
                let stamp = self.store.modified_time(path)?;
                tracing::debug!(record_id = %record.id, path = %path.display(), "external create loaded");
                collection.apply_external(record, path, stamp).await
            }
            Err(error) => {
                // The file may be mid-write or malformed; a later modify event
                // will pick it up once it parses.
                tracing::warn!(path = %path.display(), error = %error, "ignoring unparsable new file");
                Ok(())
            }
        }
    }

    async fn handle_removed(
        &self,
        collection: &Arc<RecordCollection>,
        path: &Path,
    ) -> StoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.conflicts.retain(|conflict| conflict.path != path);
            state.suspended.remove(path);
        }
        collection.remove_external(path).await
    }

    async fn handle_modified(
        &self,
        collection: &Arc<RecordCollection>,
        kind: RecordKind,
        path: &Path,
    ) -> StoreResult<()> {
        if self.state.lock().await.suspended.contains(path) {
            tracing::debug!(path = %path.display(), "reload suspended pending conflict resolution");
            return Ok(());
        }

        // A modify for a path we have never seen is a create in disguise
        // (remove-then-rename save styles coalesce that way).
        if collection.id_for_path(path).await.is_none() {
            return self.insert_from_disk(collection, path).await;
        }

        self.classify_modified(collection, kind, path).await
    }

    async fn classify_modified(
        &self,
        collection: &Arc<RecordCollection>,
        kind: RecordKind,
        path: &Path,
    ) -> StoreResult<()> {
        let disk_stamp = match self.store.modified_time(path) {
            Ok(stamp) => stamp,
            // Vanished between the event and now; the remove event follows.
            Err(_) => return Ok(()),
        };

        if let Some(acked) = collection.acknowledged(path).await {
            if disk_stamp <= acked {
                tracing::debug!(path = %path.display(), "spurious modify (not newer than acknowledged)");
                return Ok(());
            }
        }

        if collection.has_pending_change(path).await {
            return self.raise_conflict(collection, kind, path, disk_stamp).await;
        }

        match self.store.read_record(path) {
            Ok(record) => {
                tracing::debug!(record_id = %record.id, path = %path.display(), "silent reload from disk");
                collection.apply_external(record, path, disk_stamp).await
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "external rewrite unparsable; keeping previous in-memory version"
                );
                collection.acknowledge(path, disk_stamp).await;
                Ok(())
            }
        }
    }

    async fn raise_conflict(
        &self,
        collection: &Arc<RecordCollection>,
        kind: RecordKind,
        path: &Path,
        disk_stamp: DateTime<Utc>,
    ) -> StoreResult<()> {
        let Some((record, ours)) = collection.pending_snapshot(path).await? else {
            // Dirty flag without a record should not happen; fall back to a
            // plain reload rather than conflicting on nothing.
            return match self.store.read_record(path) {
                Ok(record) => collection.apply_external(record, path, disk_stamp).await,
                Err(_) => Ok(()),
            };
        };
        let theirs = self.store.read_text(path)?;

        let conflict = Conflict {
            id: Uuid::new_v4().to_string(),
            record_id: record.id.clone(),
            kind,
            path: path.to_path_buf(),
            ours,
            theirs,
            ours_modified: record.updated,
            theirs_modified: disk_stamp,
            detected_at: Utc::now(),
        };

        {
            let mut state = self.state.lock().await;
            if state.suspended.contains(path) {
                return Ok(());
            }
            state.suspended.insert(path.to_path_buf());
            tracing::warn!(
                record_id = %conflict.record_id,
                path = %path.display(),
                "external edit conflicts with unsaved local change"
            );
            state.conflicts.push(conflict);
        }
        // Freeze the local side too: the debounce timer must not overwrite
        // the disk version while the user is still deciding.
        collection.hold_pending(path).await;
        Ok(())
    }

    async fn load_disk_version(
        &self,
        collection: &Arc<RecordCollection>,
        path: &Path,
    ) -> StoreResult<()> {
        let text = self.store.read_text(path)?;
        let record = codec::decode(&text, DecodeMode::Lenient)?;
        let stamp = self.store.modified_time(path)?;
        collection.apply_external(record, path, stamp).await
    }
}

fn backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("record");
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or("md");
    path.with_file_name(format!(
        "{stem}.conflict-{}.{extension}",
        now.format("%Y%m%d%H%M%S")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_paths_are_timestamped_siblings() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 45).unwrap();
        let backup = backup_path(Path::new("/w/tasks/active/task_a.md"), now);
        assert_eq!(
            backup,
            Path::new("/w/tasks/active/task_a.conflict-20260301123045.md")
        );
    }
}

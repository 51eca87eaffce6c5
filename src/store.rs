//! On-disk layout and all filesystem access.
//!
//! Layout under the workspace root:
//!
//! ```text
//! <root>/tasks/active/<id>.md
//! <root>/tasks/archive/<YYYY-MM>/<id>.md
//! <root>/boards/active/<id>.md
//! <root>/boards/archive/<YYYY-MM>/<id>.md
//! ```
//!
//! Archive buckets key off the record's creation month to keep directory
//! sizes bounded. Every write goes through a temp file in the destination
//! directory followed by a rename, so readers never observe partial content.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec::{self, DecodeMode};
use crate::errors::{StoreError, StoreResult};
use crate::models::{Record, RecordKind};
use crate::watch::WriteTracker;

pub const RECORD_EXTENSION: &str = "md";

const ACTIVE_DIR: &str = "active";
const ARCHIVE_DIR: &str = "archive";
const CONFLICT_BACKUP_MARKER: &str = ".conflict-";

/// Result of persisting one record: where it landed and the file's
/// modification time, which becomes the acknowledged timestamp for that path.
#[derive(Debug, Clone)]
pub struct WriteAck {
    pub path: PathBuf,
    pub stamp: DateTime<Utc>,
}

/// Outcome of a bulk load. Corrupt files never abort the load; they are
/// reported here and logged.
#[derive(Debug, Default)]
pub struct KindLoad {
    pub records: Vec<(Record, PathBuf)>,
    pub skipped: Vec<(PathBuf, String)>,
}

pub struct FileStore {
    root: PathBuf,
    tracker: Arc<WriteTracker>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, tracker: Arc<WriteTracker>) -> Self {
        Self {
            root: root.into(),
            tracker,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory skeleton. Idempotent; archive month buckets are
    /// created lazily by writes.
    pub fn ensure_layout(&self) -> StoreResult<()> {
        for kind in RecordKind::all() {
            fs::create_dir_all(self.root.join(kind.dir_name()).join(ACTIVE_DIR))?;
            fs::create_dir_all(self.root.join(kind.dir_name()).join(ARCHIVE_DIR))?;
        }
        Ok(())
    }

    /// Canonical path for a record: a pure function of kind, archival state,
    /// and identity.
    pub fn record_path(&self, record: &Record) -> PathBuf {
        let partition = if record.is_archived() {
            PathBuf::from(ARCHIVE_DIR).join(record.created.format("%Y-%m").to_string())
        } else {
            PathBuf::from(ACTIVE_DIR)
        };
        self.root
            .join(record.kind.dir_name())
            .join(partition)
            .join(format!("{}.{}", sanitize_component(&record.id), RECORD_EXTENSION))
    }

    /// Which kind partition a path belongs to, if any.
    pub fn kind_for_path(&self, path: &Path) -> Option<RecordKind> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let first = relative.components().next()?.as_os_str().to_str()?;
        RecordKind::all()
            .into_iter()
            .find(|kind| kind.dir_name() == first)
    }

    /// True for paths the engine treats as record files: the recognized
    /// extension, not hidden, and not a keep-both conflict backup.
    pub fn is_record_file(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
            return false;
        };
        if name.starts_with('.') || name.contains(CONFLICT_BACKUP_MARKER) {
            return false;
        }
        path.extension().and_then(|value| value.to_str()) == Some(RECORD_EXTENSION)
    }

    /// Persist a record at its canonical path. Atomic and self-write tracked.
    pub fn write(&self, record: &Record) -> StoreResult<WriteAck> {
        let path = self.record_path(record);
        let text = codec::encode(record)?;
        let stamp = self.write_text(&path, &text)?;
        Ok(WriteAck { path, stamp })
    }

    /// Atomic tracked write of raw text (merge resolutions, conflict
    /// backups). Returns the resulting file mtime.
    pub fn write_text(&self, path: &Path, text: &str) -> StoreResult<DateTime<Utc>> {
        if !path.starts_with(&self.root) {
            return Err(StoreError::OutsideRoot(path.to_path_buf()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Internal(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let temp = parent.join(format!(".tmp-{}", Uuid::new_v4().simple()));
        fs::write(&temp, text)?;
        self.tracker.note_write(path);
        if let Err(error) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(error.into());
        }
        self.modified_time(path)
    }

    /// Remove the file backing a record. Missing file is Ok: the record may
    /// already be gone externally.
    pub fn delete(&self, record: &Record) -> StoreResult<()> {
        self.remove_path(&self.record_path(record))
    }

    pub fn remove_path(&self, path: &Path) -> StoreResult<()> {
        self.tracker.note_write(path);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Move a record to its current canonical path (archive/restore). Writes
    /// the fresh copy first, then removes the stale one, so a failure in
    /// between leaves the fresh copy authoritative.
    pub fn relocate(&self, record: &Record, old_path: &Path) -> StoreResult<WriteAck> {
        let ack = self.write(record)?;
        if ack.path != old_path {
            self.remove_path(old_path)?;
        }
        Ok(ack)
    }

    /// Bulk load every record of a kind from both partitions. Individually
    /// corrupt files are logged and skipped.
    pub fn load_kind(&self, kind: RecordKind) -> StoreResult<KindLoad> {
        let mut load = KindLoad::default();

        let active = self.root.join(kind.dir_name()).join(ACTIVE_DIR);
        self.load_dir(&active, &mut load)?;

        let archive = self.root.join(kind.dir_name()).join(ARCHIVE_DIR);
        if archive.is_dir() {
            for entry in fs::read_dir(&archive)? {
                let bucket = entry?.path();
                if bucket.is_dir() {
                    self.load_dir(&bucket, &mut load)?;
                }
            }
        }

        Ok(load)
    }

    fn load_dir(&self, dir: &Path, load: &mut KindLoad) -> StoreResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !Self::is_record_file(&path) {
                continue;
            }
            match self.read_record(&path) {
                Ok(record) => load.records.push((record, path)),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "skipping malformed record file");
                    load.skipped.push((path, error.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Locate a record of a kind by id: the active partition first, then
    /// every archive bucket.
    pub fn find_record(&self, kind: RecordKind, id: &str) -> StoreResult<Option<(Record, PathBuf)>> {
        let file_name = format!("{}.{}", sanitize_component(id), RECORD_EXTENSION);

        let active = self.root.join(kind.dir_name()).join(ACTIVE_DIR).join(&file_name);
        if active.exists() {
            return Ok(Some((self.read_record(&active)?, active)));
        }

        let archive = self.root.join(kind.dir_name()).join(ARCHIVE_DIR);
        if archive.is_dir() {
            for entry in fs::read_dir(&archive)? {
                let bucket = entry?.path();
                if !bucket.is_dir() {
                    continue;
                }
                let candidate = bucket.join(&file_name);
                if candidate.exists() {
                    return Ok(Some((self.read_record(&candidate)?, candidate)));
                }
            }
        }

        Ok(None)
    }

    pub fn read_record(&self, path: &Path) -> StoreResult<Record> {
        let text = self.read_text(path)?;
        Ok(codec::decode(&text, DecodeMode::Lenient)?)
    }

    pub fn read_text(&self, path: &Path) -> StoreResult<String> {
        Ok(fs::read_to_string(path)?)
    }

    pub fn modified_time(&self, path: &Path) -> StoreResult<DateTime<Utc>> {
        let modified = fs::metadata(path)?.modified()?;
        Ok(system_time_to_utc(modified))
    }
}

fn system_time_to_utc(value: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(value)
}

fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let cleaned = out.trim_matches('_').to_string();
    if cleaned.is_empty() {
        "record".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemClock;

    fn temp_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().expect("temp workspace root");
        let store = FileStore::new(dir.path(), Arc::new(WriteTracker::default()));
        store.ensure_layout().expect("layout");
        (dir, store)
    }

    fn sample(kind: RecordKind, title: &str) -> Record {
        Record::new(kind, title, &SystemClock)
    }

    #[test]
    fn write_then_read_round_trips_through_disk() {
        let (_dir, store) = temp_store();
        let mut record = sample(RecordKind::Task, "Fix the gutter");
        record.body = Some("Ladder is in the shed.".to_string());

        let ack = store.write(&record).expect("write");
        assert!(ack.path.ends_with(format!("tasks/active/{}.md", record.id)));

        let loaded = store.read_record(&ack.path).expect("read back");
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.updated, record.updated);
        assert_eq!(loaded.body, record.body);
    }

    #[test]
    fn no_temp_files_remain_after_write() {
        let (_dir, store) = temp_store();
        let record = sample(RecordKind::Board, "Wall");
        let ack = store.write(&record).expect("write");

        let entries: Vec<_> = fs::read_dir(ack.path.parent().unwrap())
            .expect("read dir")
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn corrupt_files_are_skipped_and_reported() {
        let (_dir, store) = temp_store();
        let good = sample(RecordKind::Task, "Keep me");
        store.write(&good).expect("write good");
        fs::write(
            store.root().join("tasks/active/broken.md"),
            "---\ntitle: no id here\n---\n",
        )
        .expect("write broken");

        let load = store.load_kind(RecordKind::Task).expect("load");
        assert_eq!(load.records.len(), 1);
        assert_eq!(load.skipped.len(), 1);
        assert!(load.skipped[0].1.contains("id"));
    }

    #[test]
    fn archive_relocation_leaves_exactly_one_file() {
        let (_dir, store) = temp_store();
        let mut record = sample(RecordKind::Task, "Old chore");
        let active_ack = store.write(&record).expect("active write");

        record.archived_at = Some(Utc::now());
        record.touch(&SystemClock);
        let archived_ack = store.relocate(&record, &active_ack.path).expect("relocate");

        assert!(!active_ack.path.exists());
        assert!(archived_ack.path.exists());
        let bucket = record.created.format("%Y-%m").to_string();
        assert!(archived_ack
            .path
            .to_string_lossy()
            .contains(&format!("archive/{bucket}")));

        let load = store.load_kind(RecordKind::Task).expect("load");
        assert_eq!(load.records.len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = temp_store();
        let record = sample(RecordKind::Task, "Transient");
        store.write(&record).expect("write");
        store.delete(&record).expect("first delete");
        store.delete(&record).expect("second delete is still Ok");
    }

    #[test]
    fn kind_is_derived_from_the_path() {
        let (_dir, store) = temp_store();
        let task = store.root().join("tasks/active/task_x.md");
        let board = store.root().join("boards/archive/2026-03/board_y.md");
        assert_eq!(store.kind_for_path(&task), Some(RecordKind::Task));
        assert_eq!(store.kind_for_path(&board), Some(RecordKind::Board));
        assert_eq!(store.kind_for_path(Path::new("/elsewhere/a.md")), None);
    }

    #[test]
    fn backups_and_hidden_files_are_not_record_files() {
        assert!(FileStore::is_record_file(Path::new("/w/tasks/active/task_a.md")));
        assert!(!FileStore::is_record_file(Path::new("/w/tasks/active/.tmp-abc")));
        assert!(!FileStore::is_record_file(Path::new(
            "/w/tasks/active/task_a.conflict-20260301120000.md"
        )));
        assert!(!FileStore::is_record_file(Path::new("/w/tasks/active/notes.txt")));
    }
}

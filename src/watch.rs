//! Directory observation. Native notifications are normalized into
//! [`FsChange`] values: bursts for the same path coalesce into one event,
//! paths the engine itself just wrote are suppressed, and only record files
//! are forwarded. If the native watcher errors out it is restarted with
//! backoff instead of leaving the workspace silently unsynchronized.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::errors::StoreResult;
use crate::store::FileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Removed,
}

/// One normalized external filesystem change. Ephemeral: consumed by the
/// coordinator and discarded.
#[derive(Debug, Clone)]
pub struct FsChange {
    pub path: PathBuf,
    pub kind: FsEventKind,
    pub observed_at: DateTime<Utc>,
}

/// Remembers paths the engine itself wrote for a short grace window so the
/// watcher does not report them back as external changes.
#[derive(Debug)]
pub struct WriteTracker {
    grace: Duration,
    recent: Mutex<HashMap<PathBuf, Instant>>,
}

impl Default for WriteTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

impl WriteTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn note_write(&self, path: &Path) {
        let mut recent = self.recent.lock().expect("write tracker lock");
        recent.insert(path.to_path_buf(), Instant::now());
    }

    pub fn is_self_write(&self, path: &Path) -> bool {
        let mut recent = self.recent.lock().expect("write tracker lock");
        let grace = self.grace;
        recent.retain(|_, noted| noted.elapsed() <= grace);
        recent.contains_key(path)
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Rapid notifications for one path inside this window collapse into one
    /// event.
    pub coalesce_window: Duration,
    pub restart_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(200),
            restart_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

pub struct WatchHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WatchHandle {
    /// Signal both background tasks to finish. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct WatchService;

impl WatchService {
    /// Watch `root` recursively. Returns a handle and the normalized event
    /// stream. The native watcher is registered before this returns, so no
    /// event in between is lost. Must be called from within a tokio runtime.
    pub fn start(
        root: &Path,
        tracker: std::sync::Arc<WriteTracker>,
        config: WatchConfig,
    ) -> StoreResult<(WatchHandle, mpsc::UnboundedReceiver<FsChange>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = create_native_watcher(root, raw_tx.clone(), error_tx.clone())?;
        let supervisor = tokio::spawn(supervise_native_watcher(
            watcher,
            root.to_path_buf(),
            raw_tx,
            error_tx,
            error_rx,
            config.clone(),
            shutdown_rx.clone(),
        ));
        let coalescer = tokio::spawn(coalesce_events(
            raw_rx,
            out_tx,
            tracker,
            config.coalesce_window,
            shutdown_rx,
        ));

        Ok((
            WatchHandle {
                shutdown: shutdown_tx,
                tasks: vec![supervisor, coalescer],
            },
            out_rx,
        ))
    }
}

/// Owns the already-registered native watcher for its lifetime and recreates
/// it with exponential backoff whenever its stream reports an error.
async fn supervise_native_watcher(
    watcher: RecommendedWatcher,
    root: PathBuf,
    raw_tx: mpsc::UnboundedSender<(PathBuf, FsEventKind)>,
    error_tx: mpsc::UnboundedSender<String>,
    mut error_rx: mpsc::UnboundedReceiver<String>,
    config: WatchConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut live = Some(watcher);
    let mut backoff = config.restart_backoff;
    loop {
        if live.is_some() {
            backoff = config.restart_backoff;
            tokio::select! {
                _ = shutdown.changed() => return,
                error = error_rx.recv() => {
                    let error = error.unwrap_or_else(|| "watch stream closed".to_string());
                    tracing::warn!(error = %error, "native watcher failed; restarting");
                    live = None;
                }
            }
        } else {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(config.max_backoff);
            match create_native_watcher(&root, raw_tx.clone(), error_tx.clone()) {
                Ok(watcher) => live = Some(watcher),
                Err(error) => {
                    tracing::warn!(error = %error, root = %root.display(), "could not restart native watcher");
                }
            }
        }
    }
}

fn create_native_watcher(
    root: &Path,
    raw_tx: mpsc::UnboundedSender<(PathBuf, FsEventKind)>,
    error_tx: mpsc::UnboundedSender<String>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                for (path, kind) in classify_native_event(event) {
                    let _ = raw_tx.send((path, kind));
                }
            }
            Err(error) => {
                let _ = error_tx.send(error.to_string());
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Flatten a native event into per-path normalized kinds. Access events and
/// metadata-only noise are dropped here.
fn classify_native_event(event: notify::Event) -> Vec<(PathBuf, FsEventKind)> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|path| (path, FsEventKind::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| (path, FsEventKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .into_iter()
            .map(|path| (path, FsEventKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .into_iter()
            .map(|path| (path, FsEventKind::Created))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            let mut paths = event.paths.into_iter();
            if let Some(from) = paths.next() {
                out.push((from, FsEventKind::Removed));
            }
            if let Some(to) = paths.next() {
                out.push((to, FsEventKind::Created));
            }
            out
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|path| (path, FsEventKind::Modified))
            .collect(),
        _ => Vec::new(),
    }
}

/// Burst semantics for one path inside the coalesce window.
fn merge_kinds(existing: FsEventKind, incoming: FsEventKind) -> FsEventKind {
    use FsEventKind::*;
    match (existing, incoming) {
        (_, Removed) => Removed,
        // The file is still new to us no matter how often it was touched.
        (Created, Modified) => Created,
        // Remove-then-create is how many editors save; the net effect is a
        // modification.
        (Removed, Created) | (Removed, Modified) => Modified,
        (_, incoming) => incoming,
    }
}

/// Debounced map path -> latest kind, flushed on its own short timer,
/// independent of the write-debounce timer.
async fn coalesce_events(
    mut raw_rx: mpsc::UnboundedReceiver<(PathBuf, FsEventKind)>,
    out_tx: mpsc::UnboundedSender<FsChange>,
    tracker: std::sync::Arc<WriteTracker>,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: HashMap<PathBuf, FsEventKind> = HashMap::new();
    loop {
        if pending.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => return,
                raw = raw_rx.recv() => match raw {
                    Some((path, kind)) => absorb(&mut pending, path, kind),
                    None => return,
                },
            }
        } else {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        flush(&mut pending, &out_tx, &tracker);
                        return;
                    }
                    _ = &mut deadline => {
                        flush(&mut pending, &out_tx, &tracker);
                        break;
                    }
                    raw = raw_rx.recv() => match raw {
                        Some((path, kind)) => absorb(&mut pending, path, kind),
                        None => {
                            flush(&mut pending, &out_tx, &tracker);
                            return;
                        }
                    },
                }
            }
        }
    }
}

fn absorb(pending: &mut HashMap<PathBuf, FsEventKind>, path: PathBuf, kind: FsEventKind) {
    if !FileStore::is_record_file(&path) {
        return;
    }
    match pending.remove(&path) {
        Some(existing) => {
            pending.insert(path, merge_kinds(existing, kind));
        }
        None => {
            pending.insert(path, kind);
        }
    }
}

fn flush(
    pending: &mut HashMap<PathBuf, FsEventKind>,
    out_tx: &mpsc::UnboundedSender<FsChange>,
    tracker: &WriteTracker,
) {
    for (path, kind) in pending.drain() {
        if tracker.is_self_write(&path) {
            tracing::debug!(path = %path.display(), "suppressing self-write event");
            continue;
        }
        let _ = out_tx.send(FsChange {
            path,
            kind,
            observed_at: Utc::now(),
        });
    }
}

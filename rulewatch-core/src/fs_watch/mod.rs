//! Watcher layer.
//!
//! A thin wrapper around `notify` that forwards raw notifications over a
//! queue to a single consumer. Each supervisor owns two hubs, one
//! over the rule tree and one over the data tree. Synthetic events re-enter
//! the pipeline through an [`EventSink`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{ChangeKind, FsEvent};

/// Whether a watch covers only the directory itself or its whole subtree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    Flat,
    Recursive,
}

impl From<WatchMode> for RecursiveMode {
    fn from(mode: WatchMode) -> Self {
        match mode {
            WatchMode::Flat => RecursiveMode::NonRecursive,
            WatchMode::Recursive => RecursiveMode::Recursive,
        }
    }
}

/// Registry of watched directories.
pub trait WatchRegistry: Send + Sync {
    /// Start watching `path`. Idempotent; returns whether a new watch was
    /// placed.
    fn add_watch(&self, path: &Path, mode: WatchMode) -> Result<bool>;

    fn is_watched(&self, path: &Path) -> bool;

    fn watch_count(&self) -> usize;
}

pub enum WatchMessage {
    Event(Event),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

#[derive(Default)]
struct WatchedSet {
    flat: HashSet<PathBuf>,
    recursive: HashSet<PathBuf>,
}

impl WatchedSet {
    fn covers(&self, path: &Path) -> bool {
        self.flat.contains(path) || self.recursive.iter().any(|root| path.starts_with(root))
    }
}

/// Receiving half of a [`WatchHub`].
#[derive(Debug)]
pub struct WatchReceiver {
    rx: mpsc::UnboundedReceiver<WatchMessage>,
    backlog: Arc<AtomicUsize>,
}

impl WatchReceiver {
    pub async fn recv(&mut self) -> Option<WatchMessage> {
        let message = self.rx.recv().await?;
        self.backlog.fetch_sub(1, Ordering::Relaxed);
        Some(message)
    }

    /// Notifications queued but not yet received.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }
}

/// One `notify` watcher plus the set of paths it covers.
///
/// The notify callback never waits on the consumer: `Watcher::watch` is
/// answered by the same notify thread, so a blocked callback would stall
/// every `add_watch` until the queue drains.
pub struct WatchHub {
    label: &'static str,
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<WatchedSet>,
}

impl fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHub")
            .field("label", &self.label)
            .field("watch_count", &self.watch_count())
            .finish()
    }
}

impl WatchHub {
    /// Create a hub whose notifications arrive on the returned receiver. A
    /// warning is logged each time the queue grows past `backlog_warning`.
    pub fn spawn(label: &'static str, backlog_warning: usize) -> Result<(Arc<Self>, WatchReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel::<WatchMessage>();
        let backlog = Arc::new(AtomicUsize::new(0));
        let queued = Arc::clone(&backlog);
        let warn_at = backlog_warning.max(1);
        let forward = move |message: WatchMessage| {
            let depth = queued.fetch_add(1, Ordering::Relaxed) + 1;
            if depth == warn_at {
                warn!(target: "rulewatch::events", hub = label, depth, "watch queue is backing up");
            }
            if let Err(err) = tx.send(message) {
                queued.fetch_sub(1, Ordering::Relaxed);
                warn!(target: "rulewatch::events", hub = label, message = ?err.0, "watch channel closed; dropping notification");
            }
        };
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => forward(WatchMessage::Event(event)),
                Err(err) => forward(WatchMessage::Error(err.to_string())),
            },
            NotifyConfig::default(),
        )?;

        let hub = Arc::new(Self {
            label,
            watcher: Mutex::new(watcher),
            watched: Mutex::new(WatchedSet::default()),
        });
        Ok((hub, WatchReceiver { rx, backlog }))
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl WatchRegistry for WatchHub {
    fn add_watch(&self, path: &Path, mode: WatchMode) -> Result<bool> {
        let mut watched = self.watched.lock();
        let already = match mode {
            WatchMode::Flat => watched.covers(path),
            WatchMode::Recursive => {
                watched.recursive.iter().any(|root| path.starts_with(root))
            }
        };
        if already {
            return Ok(false);
        }

        self.watcher
            .lock()
            .watch(path, mode.into())
            .map_err(|err| err.add_path(path.to_path_buf()))?;

        match mode {
            WatchMode::Flat => {
                watched.flat.insert(path.to_path_buf());
            }
            WatchMode::Recursive => {
                watched.flat.remove(path);
                watched.recursive.insert(path.to_path_buf());
            }
        }
        debug!(target: "rulewatch::events", hub = self.label, path = %path.display(), ?mode, "added watch");
        Ok(true)
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.watched.lock().covers(path)
    }

    fn watch_count(&self) -> usize {
        let watched = self.watched.lock();
        watched.flat.len() + watched.recursive.len()
    }
}

/// Install flat watches on every path in `dirs`, logging and skipping the
/// ones that fail. Returns the number of new watches.
pub fn install_watches(registry: &dyn WatchRegistry, dirs: &[PathBuf]) -> usize {
    let mut added = 0;
    for dir in dirs {
        match registry.add_watch(dir, WatchMode::Flat) {
            Ok(true) => added += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(target: "rulewatch::supervisor", path = %dir.display(), error = %err, "failed to add data watch");
            }
        }
    }
    added
}

/// Places watches from a separate task so the consumer of a hub never waits
/// on notify.
#[derive(Clone, Debug)]
pub struct WatchRequests {
    tx: mpsc::UnboundedSender<(PathBuf, WatchMode)>,
}

impl WatchRequests {
    /// Start the placement task. It ends once every handle is dropped.
    pub fn spawn(registry: Arc<dyn WatchRegistry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(PathBuf, WatchMode)>();
        tokio::spawn(async move {
            while let Some((path, mode)) = rx.recv().await {
                let registry = Arc::clone(&registry);
                let placed = tokio::task::spawn_blocking(move || {
                    let result = registry.add_watch(&path, mode);
                    (path, result)
                })
                .await;
                match placed {
                    Ok((_, Ok(_))) => {}
                    Ok((path, Err(err))) => {
                        warn!(target: "rulewatch::events", path = %path.display(), error = %err, "failed to add watch");
                    }
                    Err(err) => {
                        warn!(target: "rulewatch::events", error = %err, "watch placement task failed");
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue a watch; returns false once the placement task has stopped.
    pub fn request(&self, path: impl Into<PathBuf>, mode: WatchMode) -> bool {
        self.tx.send((path.into(), mode)).is_ok()
    }
}

/// Sender half used by action handlers to feed synthetic events back into
/// the event core.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<FsEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FsEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `event`; returns false once the event core has stopped.
    pub fn dispatch(&self, event: FsEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Translate one notify event into engine events.
///
/// Renames arrive from notify as a `From` half and a `To` half (plus a
/// combined `Both` notification when the halves pair up). The halves become
/// `deleted(src)` and `created(dst)`; the combined notification is dropped so
/// a move is never seen as a single event. Access notifications are ignored.
pub fn decompose(event: &Event) -> Vec<FsEvent> {
    let change = match event.kind {
        EventKind::Create(kind) => Some((ChangeKind::Created, folder_hint(kind == CreateKind::Folder, kind == CreateKind::File))),
        EventKind::Remove(kind) => Some((ChangeKind::Deleted, folder_hint(kind == RemoveKind::Folder, kind == RemoveKind::File))),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some((ChangeKind::Deleted, None)),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some((ChangeKind::Created, None)),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => None,
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .iter()
                .map(|path| {
                    let kind = if path.symlink_metadata().is_ok() {
                        ChangeKind::Created
                    } else {
                        ChangeKind::Deleted
                    };
                    FsEvent::new(path.clone(), kind, is_dir(path))
                })
                .collect();
        }
        EventKind::Modify(_) => Some((ChangeKind::Modified, None)),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    };

    if event.need_rescan() {
        warn!(target: "rulewatch::events", "watcher queue overflowed; events may have been lost");
    }

    let Some((kind, hint)) = change else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .map(|path| {
            let is_directory = hint.unwrap_or_else(|| kind != ChangeKind::Deleted && is_dir(path));
            FsEvent::new(path.clone(), kind, is_directory)
        })
        .collect()
}

fn folder_hint(folder: bool, file: bool) -> Option<bool> {
    if folder {
        Some(true)
    } else if file {
        Some(false)
    } else {
        None
    }
}

fn is_dir(path: &Path) -> bool {
    path.symlink_metadata().is_ok_and(|meta| meta.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::error::EngineError;
    use notify::event::{AccessKind, DataChange};
    use tempfile::tempdir;

    fn kinds(events: &[FsEvent]) -> Vec<(PathBuf, ChangeKind)> {
        events
            .iter()
            .map(|event| (event.path.clone(), event.kind))
            .collect()
    }

    #[test]
    fn move_halves_become_delete_then_create() {
        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path("/d/x".into());
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path("/d/y".into());
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/d/x".into())
            .add_path("/d/y".into());

        let mut events = decompose(&from);
        events.extend(decompose(&both));
        events.extend(decompose(&to));
        assert_eq!(
            kinds(&events),
            vec![
                (PathBuf::from("/d/x"), ChangeKind::Deleted),
                (PathBuf::from("/d/y"), ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn create_modify_remove_and_access() {
        let create = Event::new(EventKind::Create(CreateKind::Folder)).add_path("/d/new".into());
        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path("/d/f".into());
        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/d/f".into());
        let access = Event::new(EventKind::Access(AccessKind::Read)).add_path("/d/f".into());

        let created = decompose(&create);
        assert_eq!(created.len(), 1);
        assert!(created[0].is_directory);
        assert_eq!(created[0].kind, ChangeKind::Created);
        assert_eq!(decompose(&modify)[0].kind, ChangeKind::Modified);
        let removed = decompose(&remove);
        assert_eq!(removed[0].kind, ChangeKind::Deleted);
        assert!(!removed[0].is_directory);
        assert!(decompose(&access).is_empty());
    }

    #[test]
    fn hub_watches_are_idempotent() {
        let tmp = tempdir().unwrap();
        let nested = tmp.path().join("a");
        std::fs::create_dir_all(&nested).unwrap();

        let (hub, _rx) = WatchHub::spawn("test", 16).unwrap();
        assert!(hub.add_watch(tmp.path(), WatchMode::Flat).unwrap());
        assert!(!hub.add_watch(tmp.path(), WatchMode::Flat).unwrap());
        assert!(!hub.is_watched(&nested));

        assert!(hub.add_watch(tmp.path(), WatchMode::Recursive).unwrap());
        assert!(hub.is_watched(&nested));
        assert!(!hub.add_watch(&nested, WatchMode::Flat).unwrap());
        assert_eq!(hub.watch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn undrained_queue_does_not_stall_new_watches() {
        let tmp = tempdir().unwrap();
        let (hub, mut rx) = WatchHub::spawn("test", 4).unwrap();
        assert!(hub.add_watch(tmp.path(), WatchMode::Flat).unwrap());
        for n in 0..64 {
            std::fs::write(tmp.path().join(format!("f{n}.txt")), b"x").unwrap();
        }
        let fresh = tmp.path().join("fresh");
        std::fs::create_dir(&fresh).unwrap();

        let registry = Arc::clone(&hub);
        let target = fresh.clone();
        let placed = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || registry.add_watch(&target, WatchMode::Flat)),
        )
        .await
        .expect("add_watch returns while the queue is full")
        .unwrap()
        .unwrap();
        assert!(placed);
        assert!(hub.is_watched(&fresh));

        let mut created = HashSet::new();
        let collected = tokio::time::timeout(Duration::from_secs(5), async {
            while created.len() < 64 {
                let Some(WatchMessage::Event(event)) = rx.recv().await else {
                    continue;
                };
                for fs_event in decompose(&event) {
                    if fs_event.kind == ChangeKind::Created && !fs_event.is_directory {
                        created.insert(fs_event.path);
                    }
                }
            }
        })
        .await;
        assert!(collected.is_ok(), "only {} creations delivered", created.len());
    }

    #[tokio::test]
    async fn watch_requests_are_placed_off_the_caller() {
        let tmp = tempdir().unwrap();
        let (hub, _rx) = WatchHub::spawn("test", 16).unwrap();
        let requests = WatchRequests::spawn(Arc::clone(&hub) as Arc<dyn WatchRegistry>);
        assert!(requests.request(tmp.path(), WatchMode::Flat));

        let watched = tokio::time::timeout(Duration::from_secs(5), async {
            while !hub.is_watched(tmp.path()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(watched.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn real_rename_arrives_as_delete_then_create() {
        let tmp = tempdir().unwrap();
        let (hub, mut rx) = WatchHub::spawn("test", 16).unwrap();
        let from = tmp.path().join("a.dat");
        let to = tmp.path().join("b.dat");
        std::fs::write(&from, b"x").unwrap();
        assert!(hub.add_watch(tmp.path(), WatchMode::Flat).unwrap());
        std::fs::rename(&from, &to).unwrap();

        let mut seen = Vec::new();
        let collected = tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.contains(&(to.clone(), ChangeKind::Created)) {
                let Some(message) = rx.recv().await else {
                    break;
                };
                if let WatchMessage::Event(event) = message {
                    seen.extend(kinds(&decompose(&event)));
                }
            }
        })
        .await;
        assert!(collected.is_ok(), "saw {seen:?}");

        let deleted = seen.iter().position(|entry| *entry == (from.clone(), ChangeKind::Deleted));
        let created = seen.iter().position(|entry| *entry == (to.clone(), ChangeKind::Created));
        assert!(deleted.is_some(), "no delete for the old name in {seen:?}");
        assert!(deleted < created);
    }

    #[tokio::test]
    async fn missing_directory_surfaces_as_watch_error() {
        let tmp = tempdir().unwrap();
        let (hub, _rx) = WatchHub::spawn("test", 16).unwrap();
        let missing = tmp.path().join("gone");

        let err = hub.add_watch(&missing, WatchMode::Flat).unwrap_err();
        assert!(matches!(err, EngineError::Watch(_)), "unexpected error {err:?}");
        assert!(!hub.is_watched(&missing));
        assert_eq!(hub.watch_count(), 0);
    }

    #[test]
    fn sink_reports_closed_core() {
        let (sink, rx) = EventSink::channel();
        assert!(sink.dispatch(FsEvent::new("/d/a", ChangeKind::Created, false)));
        drop(rx);
        assert!(!sink.dispatch(FsEvent::new("/d/a", ChangeKind::Created, false)));
    }
}

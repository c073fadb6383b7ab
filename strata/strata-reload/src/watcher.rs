//! Keeping cached snapshots honest about the files they were loaded from.
//!
//! [`ChangeWatcher`] tracks, per cache key, the files a published snapshot
//! depends on and the directories containing them. File events come from the
//! OS watcher (when enabled) or are injected with
//! [`ChangeWatcher::handle_event`]. [`EditTracker`] carries the host's
//! "has unsaved edits" state per file.

use crate::cache::CacheKey;
use crate::data::FileChangeKind;
use crate::events::{Listeners, Subscription};
use crate::snapshot::StateSnapshot;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use strata_core::{Result, StrataError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A change observed for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileEvent {
    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileChangeKind::Modified,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileChangeKind::Deleted,
        }
    }

    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FileChangeKind::Created,
        }
    }

    fn from_notify(event: Event) -> Vec<FileEvent> {
        let kind = match event.kind {
            EventKind::Create(_) => FileChangeKind::Created,
            EventKind::Modify(_) => FileChangeKind::Modified,
            EventKind::Remove(_) => FileChangeKind::Deleted,
            _ => return Vec::new(),
        };
        event
            .paths
            .into_iter()
            .map(|path| FileEvent { path, kind })
            .collect()
    }
}

/// Unsaved-edit toggle for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub path: PathBuf,
    pub modified: bool,
}

/// Saves a file's pending edits.
pub type SaveHook = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

/// Which files have unsaved edits, as reported by the host.
pub struct EditTracker {
    modified: RwLock<BTreeSet<PathBuf>>,
    listeners: Arc<Listeners<EditEvent>>,
    save_hook: RwLock<Option<SaveHook>>,
}

impl EditTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            modified: RwLock::new(BTreeSet::new()),
            listeners: Listeners::new(),
            save_hook: RwLock::new(None),
        })
    }

    /// Record the edit state of `path`; subscribers hear about actual
    /// toggles only.
    pub fn set_modified(&self, path: impl Into<PathBuf>, modified: bool) {
        let path = path.into();
        let toggled = {
            let mut files = self.modified.write();
            if modified {
                files.insert(path.clone())
            } else {
                files.remove(&path)
            }
        };
        if toggled {
            trace!("Edit state of {} is now {}", path.display(), modified);
            self.listeners.emit(&EditEvent { path, modified });
        }
    }

    pub fn is_modified(&self, path: &Path) -> bool {
        self.modified.read().contains(path)
    }

    pub fn modified_files(&self) -> BTreeSet<PathBuf> {
        self.modified.read().clone()
    }

    pub fn set_save_hook(&self, hook: SaveHook) {
        *self.save_hook.write() = Some(hook);
    }

    /// Save every edited file among `paths`. Returns the number of saved
    /// files.
    pub fn save<'a, I>(&self, paths: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let pending: Vec<PathBuf> = {
            let modified = self.modified.read();
            paths
                .into_iter()
                .filter(|path| modified.contains(*path))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let Some(hook) = self.save_hook.read().clone() else {
            warn!("{} edited files but no save hook installed", pending.len());
            return Ok(0);
        };

        for path in &pending {
            hook(path)?;
            self.set_modified(path.clone(), false);
        }
        info!("Saved {} edited files", pending.len());
        Ok(pending.len())
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EditEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }
}

struct Watched {
    snapshot: Weak<StateSnapshot>,
    files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<CacheKey, Watched>,
    dir_refs: HashMap<PathBuf, usize>,
}

/// Marks snapshots inconsistent when their files change.
pub struct ChangeWatcher {
    registry: Mutex<Registry>,
    backend: Mutex<Option<RecommendedWatcher>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    edits: Arc<EditTracker>,
    _edit_link: Subscription,
}

impl ChangeWatcher {
    /// Watcher fed only by injected events.
    pub fn new(edits: Arc<EditTracker>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<ChangeWatcher>| {
            let me = me.clone();
            let edit_link = edits.subscribe(move |event| {
                if let Some(watcher) = me.upgrade() {
                    watcher.on_edit(event);
                }
            });
            Self {
                registry: Mutex::new(Registry::default()),
                backend: Mutex::new(None),
                pump: Mutex::new(None),
                edits,
                _edit_link: edit_link,
            }
        })
    }

    /// Watcher backed by the OS file watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be created
    pub fn with_filesystem(edits: Arc<EditTracker>) -> Result<Arc<Self>> {
        let watcher = Self::new(edits);
        let (tx, mut rx) = mpsc::unbounded_channel::<FileEvent>();

        let backend = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in FileEvent::from_notify(event) {
                    let _ = tx.send(file_event);
                }
            }
            Err(e) => warn!("File watcher error: {}", e),
        })
        .map_err(|e| StrataError::watcher(format!("Failed to create watcher: {}", e)))?;
        *watcher.backend.lock() = Some(backend);

        let weak = Arc::downgrade(&watcher);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match weak.upgrade() {
                    Some(watcher) => watcher.handle_event(&event),
                    None => break,
                }
            }
            debug!("File event pump stopped");
        });
        *watcher.pump.lock() = Some(pump);

        info!("Filesystem watcher started");
        Ok(watcher)
    }

    pub fn edits(&self) -> &Arc<EditTracker> {
        &self.edits
    }

    /// Start watching the files of `snapshot` under `key`, replacing
    /// whatever was watched for the key. Only the difference is applied to
    /// the OS watcher.
    pub fn attach(&self, key: &CacheKey, snapshot: &Arc<StateSnapshot>) {
        let files = snapshot.loaded_files().clone();
        let dirs: BTreeSet<PathBuf> = files
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();

        let (watch, unwatch) = {
            let mut registry = self.registry.lock();
            let mut removed: Vec<PathBuf> = Vec::new();
            let dead: Vec<CacheKey> = registry
                .by_key
                .iter()
                .filter(|(k, w)| *k != key && w.snapshot.strong_count() == 0)
                .map(|(k, _)| k.clone())
                .collect();
            for dead_key in dead {
                if let Some(w) = registry.by_key.remove(&dead_key) {
                    removed.extend(w.dirs);
                }
            }

            let previous = registry.by_key.insert(
                key.clone(),
                Watched {
                    snapshot: Arc::downgrade(snapshot),
                    files,
                    dirs: dirs.clone(),
                },
            );
            let old_dirs = previous.map(|w| w.dirs).unwrap_or_default();
            let added: Vec<PathBuf> = dirs.difference(&old_dirs).cloned().collect();
            removed.extend(old_dirs.difference(&dirs).cloned());
            Self::apply_diff(&mut registry, added, removed)
        };

        if !watch.is_empty() || !unwatch.is_empty() {
            debug!(
                "Watch set for {} changed: +{} -{} directories",
                key,
                watch.len(),
                unwatch.len()
            );
        }
        self.update_backend(&watch, &unwatch);
    }

    /// Stop watching for `key`.
    pub fn detach(&self, key: &CacheKey) {
        let (_, unwatch) = {
            let mut registry = self.registry.lock();
            let Some(previous) = registry.by_key.remove(key) else {
                return;
            };
            Self::apply_diff(&mut registry, Vec::new(), previous.dirs.into_iter().collect())
        };
        trace!("Detached watcher from {}", key);
        self.update_backend(&[], &unwatch);
    }

    /// Adjust directory reference counts; returns directories whose count
    /// became non-zero and those whose count dropped to zero.
    fn apply_diff(
        registry: &mut Registry,
        added: Vec<PathBuf>,
        removed: Vec<PathBuf>,
    ) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let mut watch = Vec::new();
        for dir in added {
            let count = registry.dir_refs.entry(dir.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                watch.push(dir);
            }
        }

        let mut unwatch = Vec::new();
        for dir in removed {
            if let Some(count) = registry.dir_refs.get_mut(&dir) {
                *count -= 1;
                if *count == 0 {
                    registry.dir_refs.remove(&dir);
                    unwatch.push(dir);
                }
            }
        }
        (watch, unwatch)
    }

    fn update_backend(&self, watch: &[PathBuf], unwatch: &[PathBuf]) {
        let mut backend = self.backend.lock();
        let Some(backend) = backend.as_mut() else {
            return;
        };
        for dir in unwatch {
            if let Err(e) = backend.unwatch(dir) {
                trace!("Failed to unwatch {}: {}", dir.display(), e);
            }
        }
        for dir in watch {
            if let Err(e) = backend.watch(dir, RecursiveMode::NonRecursive) {
                warn!("Failed to watch {}: {}", dir.display(), e);
            }
        }
    }

    /// Whether any snapshot depends on `path`.
    pub fn is_watching(&self, path: &Path) -> bool {
        self.registry
            .lock()
            .by_key
            .values()
            .any(|w| w.files.contains(path))
    }

    /// Directories currently watched.
    pub fn watched_dirs(&self) -> BTreeSet<PathBuf> {
        self.registry.lock().dir_refs.keys().cloned().collect()
    }

    /// React to a file event.
    ///
    /// A loaded file modified after the snapshot timestamp, a deleted loaded
    /// file, or a new file in a watched directory marks the snapshot
    /// inconsistent. The event is then forwarded to the participant data
    /// owning the file.
    pub fn handle_event(&self, event: &FileEvent) {
        let parent = event.path.parent();
        let affected: Vec<Arc<StateSnapshot>> = {
            let registry = self.registry.lock();
            registry
                .by_key
                .values()
                .filter(|w| match event.kind {
                    FileChangeKind::Modified
                    | FileChangeKind::Deleted
                    | FileChangeKind::Edited => w.files.contains(&event.path),
                    FileChangeKind::Created => {
                        w.files.contains(&event.path) || parent.is_some_and(|p| w.dirs.contains(p))
                    }
                })
                .filter_map(|w| w.snapshot.upgrade())
                .collect()
        };

        for snapshot in affected {
            if event.kind == FileChangeKind::Modified
                && !modified_since(&event.path, snapshot.timestamp())
            {
                trace!("Ignoring stale event for {}", event.path.display());
                continue;
            }
            debug!(
                "{:?} {} makes snapshot {} inconsistent",
                event.kind,
                event.path.display(),
                snapshot.id()
            );
            snapshot.mark_inconsistent([event.path.clone()]);
            for (_, data) in snapshot.parts() {
                if data.owns(&event.path) {
                    data.notify_file_changed(&event.path, event.kind);
                }
            }
        }
    }

    fn on_edit(&self, event: &EditEvent) {
        if !event.modified {
            return;
        }
        let affected: Vec<Arc<StateSnapshot>> = self
            .registry
            .lock()
            .by_key
            .values()
            .filter(|w| w.files.contains(&event.path))
            .filter_map(|w| w.snapshot.upgrade())
            .collect();
        for snapshot in affected {
            debug!("{} edited, snapshot {} inconsistent", event.path.display(), snapshot.id());
            snapshot.mark_edited(&event.path);
            for (_, data) in snapshot.parts() {
                if data.owns(&event.path) {
                    data.notify_file_changed(&event.path, FileChangeKind::Edited);
                }
            }
        }
    }

    /// Stop the OS watcher and the event pump.
    pub fn shutdown(&self) {
        self.backend.lock().take();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// A file whose metadata cannot be read is treated as changed.
fn modified_since(path: &Path, timestamp: Option<SystemTime>) -> bool {
    let Some(timestamp) = timestamp else {
        return true;
    };
    match std::fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(mtime) => mtime > timestamp,
        Err(_) => true,
    }
}

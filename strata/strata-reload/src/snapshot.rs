//! Published project states.
//!
//! A [`StateSnapshot`] is the aggregate of one reload across all
//! participants. Its composition never changes after publication; only its
//! validity and consistency flags and the changed/edited file sets move, and
//! every such move is announced to subscribers through the project's gate.

use crate::cache::CacheKey;
use crate::data::{DataEvent, ParticipantData};
use crate::events::{Listeners, Subscription};
use crate::gate::OperationGates;
use crate::identity::TokenGuard;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use strata_core::{ProjectId, Quality, SnapshotId};
use tracing::debug;

/// Notification emitted by a [`StateSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEvent {
    /// The snapshot's consistency changed (files changed, edited or data
    /// reported itself stale).
    Changed { snapshot: SnapshotId, consistent: bool },
    /// The snapshot must no longer be used.
    Invalidated { snapshot: SnapshotId },
}

/// Everything a snapshot is assembled from.
pub(crate) struct SnapshotParts {
    pub project: ProjectId,
    pub key: CacheKey,
    pub parts: Vec<(String, Arc<ParticipantData>)>,
    pub consulted: Vec<String>,
    pub tokens: Vec<TokenGuard>,
    pub predecessor: Option<Arc<StateSnapshot>>,
    pub edited: BTreeSet<PathBuf>,
}

/// An immutable aggregate of participant data for one cache key.
pub struct StateSnapshot {
    id: SnapshotId,
    project: ProjectId,
    key: CacheKey,
    quality: Quality,
    timestamp: Option<SystemTime>,
    loaded_files: BTreeSet<PathBuf>,
    parts: Vec<(String, Arc<ParticipantData>)>,
    consulted: Vec<String>,
    synthetic: bool,
    predecessor: Weak<StateSnapshot>,
    predecessor_id: Option<SnapshotId>,
    _tokens: Vec<TokenGuard>,
    valid: AtomicBool,
    consistent: AtomicBool,
    changed_files: Mutex<BTreeSet<PathBuf>>,
    edited_files: Mutex<BTreeSet<PathBuf>>,
    listeners: Arc<Listeners<SnapshotEvent>>,
    links: Mutex<Vec<Subscription>>,
    gates: Arc<OperationGates>,
    me: Weak<StateSnapshot>,
}

impl StateSnapshot {
    /// Synthetic placeholder for a key that was never loaded.
    pub(crate) fn empty(project: ProjectId, key: CacheKey, gates: Arc<OperationGates>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: SnapshotId::next(),
            project,
            key,
            quality: Quality::EMPTY,
            timestamp: None,
            loaded_files: BTreeSet::new(),
            parts: Vec::new(),
            consulted: Vec::new(),
            synthetic: true,
            predecessor: Weak::new(),
            predecessor_id: None,
            _tokens: Vec::new(),
            valid: AtomicBool::new(true),
            consistent: AtomicBool::new(true),
            changed_files: Mutex::new(BTreeSet::new()),
            edited_files: Mutex::new(BTreeSet::new()),
            listeners: Listeners::new(),
            links: Mutex::new(Vec::new()),
            gates,
            me: me.clone(),
        })
    }

    pub(crate) fn assemble(input: SnapshotParts, gates: Arc<OperationGates>) -> Arc<Self> {
        let SnapshotParts {
            project,
            key,
            parts,
            consulted,
            tokens,
            predecessor,
            edited,
        } = input;

        let quality = Quality::worst(parts.iter().map(|(_, data)| data.quality()));
        let timestamp = parts.iter().map(|(_, data)| data.timestamp()).min();
        let loaded_files: BTreeSet<PathBuf> = parts
            .iter()
            .flat_map(|(_, data)| data.files().iter().cloned())
            .collect();
        let valid = parts.iter().all(|(_, data)| data.is_valid());

        let edited: BTreeSet<PathBuf> = loaded_files.intersection(&edited).cloned().collect();
        let changed: BTreeSet<PathBuf> = match timestamp {
            Some(ts) => loaded_files
                .iter()
                .filter(|path| modified_after(path, ts))
                .cloned()
                .collect(),
            None => BTreeSet::new(),
        };
        let consistent = parts.iter().all(|(_, data)| data.is_consistent())
            && edited.is_empty()
            && changed.is_empty();

        Arc::new_cyclic(|me: &Weak<StateSnapshot>| {
            let links = parts
                .iter()
                .map(|(_, data)| {
                    let me = me.clone();
                    data.subscribe(move |event| {
                        if let Some(snapshot) = me.upgrade() {
                            snapshot.on_data_event(event);
                        }
                    })
                })
                .collect();

            Self {
                id: SnapshotId::next(),
                project,
                key,
                quality,
                timestamp,
                loaded_files,
                parts,
                consulted,
                synthetic: false,
                predecessor_id: predecessor.as_ref().map(|p| p.id()),
                predecessor: predecessor.as_ref().map(Arc::downgrade).unwrap_or_default(),
                _tokens: tokens,
                valid: AtomicBool::new(valid),
                consistent: AtomicBool::new(consistent),
                changed_files: Mutex::new(changed),
                edited_files: Mutex::new(edited),
                listeners: Listeners::new(),
                links: Mutex::new(links),
                gates,
                me: me.clone(),
            }
        })
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Worst quality among the participant data, or [`Quality::EMPTY`].
    pub fn quality(&self) -> Quality {
        self.quality
    }

    /// Oldest participant data timestamp.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent.load(Ordering::Acquire)
    }

    /// Whether this is the placeholder handed out before any load.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn loaded_files(&self) -> &BTreeSet<PathBuf> {
        &self.loaded_files
    }

    /// Loaded files that changed on disk after the snapshot was built.
    pub fn changed_files(&self) -> BTreeSet<PathBuf> {
        self.changed_files.lock().clone()
    }

    /// Loaded files with unsaved edits.
    pub fn edited_files(&self) -> BTreeSet<PathBuf> {
        self.edited_files.lock().clone()
    }

    /// Participant data in registration order.
    pub fn parts(&self) -> &[(String, Arc<ParticipantData>)] {
        &self.parts
    }

    pub fn data_for(&self, participant: &str) -> Option<&Arc<ParticipantData>> {
        self.parts
            .iter()
            .find(|(name, _)| name == participant)
            .map(|(_, data)| data)
    }

    /// First capability of type `T` exposed by any participant data.
    pub fn lookup<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.parts.iter().find_map(|(_, data)| data.capability::<T>())
    }

    /// Participants the snapshot was built from, in registration order.
    pub fn consulted(&self) -> &[String] {
        &self.consulted
    }

    /// The snapshot this one superseded, while it is still alive.
    pub fn predecessor(&self) -> Option<Arc<StateSnapshot>> {
        self.predecessor.upgrade()
    }

    pub fn predecessor_id(&self) -> Option<SnapshotId> {
        self.predecessor_id
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SnapshotEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Record externally changed files and mark the snapshot inconsistent.
    pub fn mark_inconsistent<I>(&self, files: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.changed_files.lock().extend(files);
        self.consistent.store(false, Ordering::Release);
        self.post_changed();
    }

    /// Record that `path` has unsaved edits.
    pub fn mark_edited(&self, path: &Path) {
        self.edited_files.lock().insert(path.to_path_buf());
        self.consistent.store(false, Ordering::Release);
        self.post_changed();
    }

    /// Mark the snapshot obsolete.
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            debug!("Invalidated snapshot {} of {}", self.id, self.project);
            self.post_changed();
        }
    }

    /// Keep `subscription` alive as long as this snapshot. Links whose
    /// source has been dropped are pruned.
    pub(crate) fn link(&self, subscription: Subscription) {
        let mut links = self.links.lock();
        links.retain(Subscription::is_live);
        links.push(subscription);
    }

    fn on_data_event(&self, event: &DataEvent) {
        if let DataEvent::Changed {
            invalid,
            inconsistent,
        } = event
        {
            if *invalid {
                self.valid.store(false, Ordering::Release);
            }
            if *inconsistent {
                self.consistent.store(false, Ordering::Release);
            }
            if *invalid || *inconsistent {
                self.post_changed();
            }
        }
    }

    /// Queue one delivery of the current state; repeated posts while the
    /// project is busy collapse into one.
    fn post_changed(&self) {
        let me = self.me.clone();
        self.gates.post_event(
            &self.project,
            self.id.as_u64(),
            Box::new(move || {
                if let Some(snapshot) = me.upgrade() {
                    snapshot.deliver();
                }
            }),
        );
    }

    fn deliver(&self) {
        let event = if self.is_valid() {
            SnapshotEvent::Changed {
                snapshot: self.id,
                consistent: self.is_consistent(),
            }
        } else {
            SnapshotEvent::Invalidated { snapshot: self.id }
        };
        self.listeners.emit(&event);
    }
}

fn modified_after(path: &Path, timestamp: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .is_ok_and(|mtime| mtime > timestamp)
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("quality", &self.quality)
            .field("valid", &self.is_valid())
            .field("consistent", &self.is_consistent())
            .field("synthetic", &self.synthetic)
            .field("parts", &self.consulted)
            .field("predecessor", &self.predecessor_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier;
    use std::time::Duration;

    fn gates() -> (Notifier, Arc<OperationGates>) {
        let (notifier, _handle) = Notifier::spawn();
        let gates = OperationGates::new(notifier.clone());
        (notifier, gates)
    }

    fn assemble(
        gates: &Arc<OperationGates>,
        project: ProjectId,
        parts: Vec<(&str, Arc<ParticipantData>)>,
    ) -> Arc<StateSnapshot> {
        let parts: Vec<(String, Arc<ParticipantData>)> = parts
            .into_iter()
            .map(|(name, data)| (name.to_string(), data))
            .collect();
        StateSnapshot::assemble(
            SnapshotParts {
                project,
                key: CacheKey::plain(project),
                consulted: parts.iter().map(|(name, _)| name.clone()).collect(),
                parts,
                tokens: Vec::new(),
                predecessor: None,
                edited: BTreeSet::new(),
            },
            Arc::clone(gates),
        )
    }

    #[tokio::test]
    async fn test_aggregates_worst_quality_and_oldest_timestamp() {
        let (_n, gates) = gates();
        let project = ProjectId::new();
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let new = old + Duration::from_secs(60);

        let snap = assemble(
            &gates,
            project,
            vec![
                (
                    "a",
                    ParticipantData::builder(Quality::Resolved)
                        .timestamp(new)
                        .file("/nonexistent/a")
                        .build(),
                ),
                (
                    "b",
                    ParticipantData::builder(Quality::Simple)
                        .timestamp(old)
                        .file("/nonexistent/b")
                        .build(),
                ),
            ],
        );

        assert_eq!(snap.quality(), Quality::Simple);
        assert_eq!(snap.timestamp(), Some(old));
        assert_eq!(snap.loaded_files().len(), 2);
        assert!(snap.is_valid());
        assert!(snap.is_consistent());
        assert!(!snap.is_synthetic());
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let (_n, gates) = gates();
        let project = ProjectId::new();
        let snap = StateSnapshot::empty(project, CacheKey::plain(project), gates);
        assert!(snap.is_synthetic());
        assert_eq!(snap.quality(), Quality::EMPTY);
        assert!(snap.timestamp().is_none());
    }

    #[tokio::test]
    async fn test_edited_loaded_file_makes_inconsistent() {
        let (_n, gates) = gates();
        let project = ProjectId::new();
        let data = ParticipantData::builder(Quality::Loaded)
            .file("/nonexistent/pom.xml")
            .build();
        let parts = vec![("maven".to_string(), data)];

        let snap = StateSnapshot::assemble(
            SnapshotParts {
                project,
                key: CacheKey::plain(project),
                consulted: vec!["maven".to_string()],
                parts,
                tokens: Vec::new(),
                predecessor: None,
                edited: [PathBuf::from("/nonexistent/pom.xml"), PathBuf::from("/other")]
                    .into_iter()
                    .collect(),
            },
            gates,
        );

        assert!(!snap.is_consistent());
        assert_eq!(snap.edited_files().len(), 1);
    }

    #[tokio::test]
    async fn test_data_change_marks_snapshot_and_notifies() {
        let (notifier, gates) = gates();
        let project = ProjectId::new();
        let data = ParticipantData::builder(Quality::Loaded).build();
        let snap = assemble(&gates, project, vec![("p", Arc::clone(&data))]);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = snap.subscribe(move |e| sink.lock().push(e.clone()));

        data.fire_changed(false, true);
        assert!(!snap.is_consistent());
        notifier.flush().await;

        assert_eq!(
            events.lock().as_slice(),
            &[SnapshotEvent::Changed {
                snapshot: snap.id(),
                consistent: false
            }]
        );
    }

    #[tokio::test]
    async fn test_events_coalesce_while_gate_held() {
        let (notifier, gates) = gates();
        let project = ProjectId::new();
        let snap = assemble(
            &gates,
            project,
            vec![("p", ParticipantData::builder(Quality::Loaded).build())],
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = snap.subscribe(move |e| sink.lock().push(e.clone()));

        let ticket = gates.enter(&project);
        snap.mark_inconsistent([PathBuf::from("/a")]);
        snap.mark_edited(Path::new("/b"));
        snap.invalidate();
        notifier.flush().await;
        assert!(events.lock().is_empty());

        drop(ticket);
        notifier.flush().await;
        assert_eq!(
            events.lock().as_slice(),
            &[SnapshotEvent::Invalidated { snapshot: snap.id() }]
        );
        assert_eq!(snap.changed_files().len(), 1);
    }

    #[tokio::test]
    async fn test_links_to_dropped_sources_are_pruned() {
        let (_n, gates) = gates();
        let project = ProjectId::new();
        let snap = assemble(
            &gates,
            project,
            vec![("p", ParticipantData::builder(Quality::Loaded).build())],
        );
        assert_eq!(snap.links.lock().len(), 1);

        for _ in 0..5 {
            let discarded = ParticipantData::builder(Quality::Loaded).build();
            snap.link(discarded.subscribe(|_| {}));
        }
        assert_eq!(snap.links.lock().len(), 2, "own data plus the latest link");

        let held = ParticipantData::builder(Quality::Loaded).build();
        snap.link(held.subscribe(|_| {}));
        snap.link(ParticipantData::builder(Quality::Loaded).build().subscribe(|_| {}));
        assert_eq!(snap.links.lock().len(), 3);
    }
}

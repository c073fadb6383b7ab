//! Participant data: one participant's slice of a project state.
//!
//! Data objects are shared between snapshots and in-flight reloads. Their
//! quality, validity and consistency may change after publication; such
//! changes become observable only through [`ParticipantData::fire_changed`],
//! which notifies subscribers (snapshots, forwarders, the participant).

use crate::events::{Listeners, Subscription};
use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use strata_core::Quality;

/// Kind of change observed for a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeKind {
    Modified,
    Deleted,
    Created,
    /// The host reports unsaved edits.
    Edited,
}

/// Notification emitted by a [`ParticipantData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    /// The data became invalid and/or inconsistent.
    Changed { invalid: bool, inconsistent: bool },
    /// A file owned by the data changed on disk or got unsaved edits.
    FileChanged { path: PathBuf, kind: FileChangeKind },
}

type Shared = Arc<dyn Any + Send + Sync>;

/// Data produced by one participant reload.
pub struct ParticipantData {
    quality: AtomicU8,
    valid: AtomicBool,
    consistent: AtomicBool,
    timestamp: SystemTime,
    files: BTreeSet<PathBuf>,
    payload: Option<Shared>,
    capabilities: HashMap<TypeId, Shared>,
    listeners: Arc<Listeners<DataEvent>>,
}

impl ParticipantData {
    pub fn builder(quality: Quality) -> DataBuilder {
        DataBuilder {
            quality,
            valid: true,
            consistent: true,
            timestamp: None,
            files: BTreeSet::new(),
            payload: None,
            capabilities: HashMap::new(),
        }
    }

    /// Stand-in for a participant whose reload failed.
    ///
    /// Keeps the previous data's files and payload but lowers its quality to
    /// [`Quality::Broken`]; without previous data the result carries the lowest
    /// synthesized quality, [`Quality::Fallback`].
    pub fn degraded(previous: Option<&ParticipantData>) -> Arc<ParticipantData> {
        match previous {
            Some(prev) => {
                let quality = prev.quality().min(Quality::Broken);
                Arc::new(ParticipantData {
                    quality: AtomicU8::new(quality.to_index()),
                    valid: AtomicBool::new(true),
                    consistent: AtomicBool::new(prev.is_consistent()),
                    timestamp: prev.timestamp,
                    files: prev.files.clone(),
                    payload: prev.payload.clone(),
                    capabilities: prev.capabilities.clone(),
                    listeners: Listeners::new(),
                })
            }
            None => ParticipantData::builder(Quality::Fallback).build(),
        }
    }

    pub fn quality(&self) -> Quality {
        Quality::from_u8(self.quality.load(Ordering::Acquire))
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent.load(Ordering::Acquire)
    }

    /// Moment the data was produced; files modified later make it stale.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn files(&self) -> &BTreeSet<PathBuf> {
        &self.files
    }

    pub fn owns(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    /// Participant-private payload, downcast to `T`.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }

    /// Capability exposed to other participants and clients, by type.
    pub fn capability<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.capabilities
            .get(&TypeId::of::<T>())
            .and_then(|cap| cap.downcast_ref::<T>())
    }

    pub fn has_capability(&self, type_id: TypeId) -> bool {
        self.capabilities.contains_key(&type_id)
    }

    /// Lower (or raise) the quality in place. Not observable until
    /// [`ParticipantData::fire_changed`] is called.
    pub fn set_quality(&self, quality: Quality) {
        self.quality.store(quality.to_index(), Ordering::Release);
    }

    /// Record that the data became invalid and/or inconsistent and notify
    /// subscribers.
    pub fn fire_changed(&self, invalidate: bool, inconsistent: bool) {
        if invalidate {
            self.valid.store(false, Ordering::Release);
        }
        if inconsistent {
            self.consistent.store(false, Ordering::Release);
        }
        self.listeners.emit(&DataEvent::Changed {
            invalid: invalidate,
            inconsistent,
        });
    }

    /// Tell subscribers that an owned file changed on disk.
    pub fn notify_file_changed(&self, path: &Path, kind: FileChangeKind) {
        self.listeners.emit(&DataEvent::FileChanged {
            path: path.to_path_buf(),
            kind,
        });
    }

    /// Re-emit an event that originated on another data object.
    pub(crate) fn relay(&self, event: &DataEvent) {
        match event {
            DataEvent::Changed {
                invalid,
                inconsistent,
            } => self.fire_changed(*invalid, *inconsistent),
            DataEvent::FileChanged { path, kind } => self.notify_file_changed(path, *kind),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Structural equivalence: same grades, timestamp and files, and the
    /// very same payload object.
    pub fn same_content(&self, other: &ParticipantData) -> bool {
        let payload_eq = match (&self.payload, &other.payload) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        payload_eq
            && self.quality() == other.quality()
            && self.is_valid() == other.is_valid()
            && self.is_consistent() == other.is_consistent()
            && self.timestamp == other.timestamp
            && self.files == other.files
    }
}

impl fmt::Debug for ParticipantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantData")
            .field("quality", &self.quality())
            .field("valid", &self.is_valid())
            .field("consistent", &self.is_consistent())
            .field("files", &self.files)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

/// Builder for [`ParticipantData`].
pub struct DataBuilder {
    quality: Quality,
    valid: bool,
    consistent: bool,
    timestamp: Option<SystemTime>,
    files: BTreeSet<PathBuf>,
    payload: Option<Shared>,
    capabilities: HashMap<TypeId, Shared>,
}

impl DataBuilder {
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.insert(path.into());
        self
    }

    pub fn files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    pub fn consistent(mut self, consistent: bool) -> Self {
        self.consistent = consistent;
        self
    }

    /// Defaults to the moment [`DataBuilder::build`] is called.
    pub fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Share an existing payload object, keeping its identity.
    pub fn shared_payload(mut self, payload: Arc<dyn Any + Send + Sync>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn capability<T: Any + Send + Sync>(mut self, capability: T) -> Self {
        self.capabilities
            .insert(TypeId::of::<T>(), Arc::new(capability));
        self
    }

    pub fn build(self) -> Arc<ParticipantData> {
        Arc::new(ParticipantData {
            quality: AtomicU8::new(self.quality.to_index()),
            valid: AtomicBool::new(self.valid),
            consistent: AtomicBool::new(self.consistent),
            timestamp: self.timestamp.unwrap_or_else(SystemTime::now),
            files: self.files,
            payload: self.payload,
            capabilities: self.capabilities,
            listeners: Listeners::new(),
        })
    }
}

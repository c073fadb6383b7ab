//! The contract implemented by pluggable data sources.

use crate::data::ParticipantData;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_core::{ProjectId, RequestContext, StateRequest};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure of a single participant reload.
#[derive(Error, Debug)]
pub enum ParticipantError {
    /// The reload produced usable but incomplete data.
    #[error("Partial load: {source}")]
    PartialLoad {
        data: Arc<ParticipantData>,
        #[source]
        source: anyhow::Error,
    },

    #[error("Participant reload cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ParticipantError {
    pub fn partial(data: Arc<ParticipantData>, source: impl Into<anyhow::Error>) -> Self {
        Self::PartialLoad {
            data,
            source: source.into(),
        }
    }
}

/// A data source contributing one slice of a project state.
///
/// Participants are consulted in registration order, one at a time, during
/// every reload round that needs them.
#[async_trait]
pub trait Participant: Send + Sync + 'static {
    /// Stable name, unique among the participants of a project.
    fn name(&self) -> &str;

    /// Produce fresh data for `project`.
    ///
    /// `Ok(None)` means the participant does not contribute this time; its
    /// last known data, if any, stays in the state.
    async fn reload(
        &self,
        project: &ProjectId,
        request: &StateRequest,
        ctx: &mut LoadContext,
    ) -> Result<Option<Arc<ParticipantData>>, ParticipantError>;

    /// Whether cached `data` still satisfies `request`, beyond its quality
    /// and consistency.
    fn check_state(&self, _request: &StateRequest, _data: &ParticipantData) -> bool {
        true
    }

    /// Variant hint derived from the request context; contributes to the
    /// cache key.
    fn create_variant(&self, _context: &RequestContext) -> Option<String> {
        None
    }

    /// Called once no live state references `data` any more.
    fn project_data_released(&self, _data: &ParticipantData) {}

    /// Whether `new` may be replaced by `old` without observers noticing.
    fn is_equivalent(&self, old: &ParticipantData, new: &ParticipantData) -> bool {
        old.same_content(new)
    }
}

/// Data produced so far in the current reload, by participant.
#[derive(Clone, Default)]
pub struct PartialState {
    parts: Vec<(String, Arc<ParticipantData>)>,
}

impl PartialState {
    pub(crate) fn from_parts(parts: Vec<(String, Arc<ParticipantData>)>) -> Self {
        Self { parts }
    }

    pub fn data_for(&self, participant: &str) -> Option<&Arc<ParticipantData>> {
        self.parts
            .iter()
            .find(|(name, _)| name == participant)
            .map(|(_, data)| data)
    }

    /// First capability of type `T` exposed by any participant's data.
    pub fn lookup<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.parts.iter().find_map(|(_, data)| data.capability::<T>())
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

pub(crate) type Scratch = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Per-call context handed to [`Participant::reload`].
pub struct LoadContext {
    participant: String,
    round: usize,
    previous: Option<Arc<ParticipantData>>,
    partial: PartialState,
    retry: bool,
    marked: Vec<TypeId>,
    scratch: Scratch,
    cancel: CancellationToken,
}

impl LoadContext {
    pub(crate) fn new(
        participant: impl Into<String>,
        round: usize,
        previous: Option<Arc<ParticipantData>>,
        partial: PartialState,
        scratch: Scratch,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            participant: participant.into(),
            round,
            previous,
            partial,
            retry: false,
            marked: Vec::new(),
            scratch,
            cancel,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    /// Zero-based reload round.
    pub fn round(&self) -> usize {
        self.round
    }

    /// Data this participant contributed the last time.
    pub fn previous(&self) -> Option<&Arc<ParticipantData>> {
        self.previous.as_ref()
    }

    pub fn partial_state(&self) -> &PartialState {
        &self.partial
    }

    /// Ask for another round after this one.
    pub fn retry_reload(&mut self) {
        self.retry = true;
    }

    /// Ask for another round for every participant whose data exposes
    /// capability `T`.
    pub fn mark_for_reload<T: Any>(&mut self) {
        let id = TypeId::of::<T>();
        if !self.marked.contains(&id) {
            self.marked.push(id);
        }
    }

    /// Participant scratch preserved across the rounds of one reload.
    pub fn ensure_load_context<T, F>(&mut self, init: F) -> &mut T
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let id = TypeId::of::<T>();
        if !self.scratch.get(&id).is_some_and(|slot| slot.is::<T>()) {
            self.scratch.insert(id, Box::new(init()));
        }
        match self.scratch.get_mut(&id).and_then(|slot| slot.downcast_mut::<T>()) {
            Some(value) => value,
            None => unreachable!("scratch slot is keyed by its own type"),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn into_outcome(self) -> LoadOutcome {
        LoadOutcome {
            retry: self.retry,
            marked: self.marked,
            scratch: self.scratch,
        }
    }
}

impl fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadContext")
            .field("participant", &self.participant)
            .field("round", &self.round)
            .field("retry", &self.retry)
            .field("marked", &self.marked.len())
            .finish()
    }
}

/// What a participant asked for during one call.
pub(crate) struct LoadOutcome {
    pub retry: bool,
    pub marked: Vec<TypeId>,
    pub scratch: Scratch,
}

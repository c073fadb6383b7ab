//! Strata reload engine.
//!
//! Keeps memoized project states assembled from pluggable participants and
//! orchestrates their reloads:
//!
//! - [`StateCache`]: keyed states with a timed hard hold
//! - [`OperationGates`]: per-project operation counting, deferred
//!   notifications and the reload queue
//! - reloader: the multi-round reload protocol with loop detection
//! - [`IdentityTracker`]: deterministic release of participant data
//! - [`forwarder`] and [`ChangeWatcher`]: keeping cached states honest
//!
//! # Example
//!
//! ```no_run
//! use strata_core::{ProjectId, StateRequest, StrataConfig};
//! use strata_reload::ProjectStateService;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let service = ProjectStateService::new(&StrataConfig::default())?;
//! let project = ProjectId::new();
//! // service.register_participant(project, Arc::new(MyParticipant))?;
//! let state = service.request_state(project, StateRequest::load()).await;
//! # let _ = state;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod data;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod gate;
pub mod identity;
pub mod notifier;
pub mod participant;
mod reloader;
pub mod service;
pub mod snapshot;
pub mod watcher;

pub use cache::{CacheKey, StateCache, StateRef};
pub use data::{DataBuilder, DataEvent, FileChangeKind, ParticipantData};
pub use error::{OperationState, ParticipantFailure, ReloadError, ReloadResult};
pub use events::Subscription;
pub use gate::{OperationGates, OperationTicket};
pub use identity::{IdentityTracker, TokenGuard};
pub use notifier::Notifier;
pub use participant::{LoadContext, Participant, ParticipantError, PartialState};
pub use reloader::ReloadPhase;
pub use service::{ProjectStateService, StateFuture};
pub use snapshot::{SnapshotEvent, StateSnapshot};
pub use watcher::{ChangeWatcher, EditEvent, EditTracker, FileEvent, SaveHook};

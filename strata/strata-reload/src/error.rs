//! Terminal outcomes of a state request.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{ProjectId, Quality};
use thiserror::Error;

/// Result type for state requests.
pub type ReloadResult<T> = std::result::Result<T, ReloadError>;

/// Coarse category of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Unsupported,
    OutOfSync,
    Broken,
    Error,
    Cancelled,
}

/// A participant failure recorded during a reload.
#[derive(Clone)]
pub struct ParticipantFailure {
    pub participant: String,
    pub error: Arc<anyhow::Error>,
}

impl ParticipantFailure {
    pub fn new(participant: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            participant: participant.into(),
            error: Arc::new(error),
        }
    }
}

impl fmt::Debug for ParticipantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantFailure")
            .field("participant", &self.participant)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

impl fmt::Display for ParticipantFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.participant, self.error)
    }
}

impl std::error::Error for ParticipantFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Why a state request did not produce a snapshot.
///
/// Cloned to every waiter of a coalesced reload.
#[derive(Error, Debug, Clone)]
pub enum ReloadError {
    #[error("No participants can satisfy {requested} for project {project}")]
    Unsupported { project: ProjectId, requested: Quality },

    #[error("Project {project} changed during reload ({} files)", files.len())]
    OutOfSync { project: ProjectId, files: Vec<PathBuf> },

    #[error("Project {project} loaded at {actual}, {requested} requested")]
    Broken {
        project: ProjectId,
        actual: Quality,
        requested: Quality,
        #[source]
        cause: Option<ParticipantFailure>,
        suppressed: Vec<ParticipantFailure>,
    },

    #[error("Repeated reload loop in project {project}: {}", participants.join(", "))]
    ReloadLoop {
        project: ProjectId,
        participants: Vec<String>,
    },

    #[error("Reload of project {project} was cancelled")]
    Cancelled { project: ProjectId },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReloadError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn state(&self) -> OperationState {
        match self {
            Self::Unsupported { .. } => OperationState::Unsupported,
            Self::OutOfSync { .. } => OperationState::OutOfSync,
            Self::Broken { .. } => OperationState::Broken,
            Self::ReloadLoop { .. } | Self::Internal(_) => OperationState::Error,
            Self::Cancelled { .. } => OperationState::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Every participant failure carried by the error, cause first.
    pub fn failures(&self) -> Vec<&ParticipantFailure> {
        match self {
            Self::Broken {
                cause, suppressed, ..
            } => cause.iter().chain(suppressed.iter()).collect(),
            _ => Vec::new(),
        }
    }
}

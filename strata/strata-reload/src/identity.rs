//! Identity tracking for participant data.
//!
//! Every snapshot and in-flight reload holding a piece of participant data
//! holds a [`TokenGuard`] for it. When the last guard for a token is dropped
//! the release is scheduled through the project's gate, so it is deferred
//! while an operation is active. The release job checks, under the registry
//! lock, that the data has not been registered again under a newer token
//! before notifying the owning participant.

use crate::data::ParticipantData;
use crate::gate::OperationGates;
use crate::participant::Participant;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_core::{DataToken, ProjectId};
use tracing::{debug, trace};

struct Entry {
    project: ProjectId,
    participant: Arc<dyn Participant>,
    data: Arc<ParticipantData>,
    refs: usize,
}

#[derive(Default)]
struct Registry {
    by_data: HashMap<usize, DataToken>,
    entries: HashMap<DataToken, Entry>,
}

fn address(data: &Arc<ParticipantData>) -> usize {
    Arc::as_ptr(data) as usize
}

/// Assigns stable tokens to participant data and reports their release.
pub struct IdentityTracker {
    gates: Arc<OperationGates>,
    registry: Arc<Mutex<Registry>>,
}

impl IdentityTracker {
    pub fn new(gates: Arc<OperationGates>) -> Arc<Self> {
        Arc::new(Self {
            gates,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    /// Take a reference on `data`, registering it if needed.
    pub fn acquire(
        self: &Arc<Self>,
        project: &ProjectId,
        participant: &Arc<dyn Participant>,
        data: &Arc<ParticipantData>,
    ) -> TokenGuard {
        let mut registry = self.registry.lock();
        let key = address(data);

        let token = match registry.by_data.get(&key).copied() {
            Some(token) => {
                if let Some(entry) = registry.entries.get_mut(&token) {
                    entry.refs += 1;
                }
                token
            }
            None => {
                let token = DataToken::next();
                registry.by_data.insert(key, token);
                registry.entries.insert(
                    token,
                    Entry {
                        project: *project,
                        participant: Arc::clone(participant),
                        data: Arc::clone(data),
                        refs: 1,
                    },
                );
                trace!("Registered {} data as {}", participant.name(), token);
                token
            }
        };

        TokenGuard {
            tracker: Arc::clone(self),
            token,
        }
    }

    /// Current token of `data`, if it is referenced by anything.
    pub fn identity_for(&self, data: &Arc<ParticipantData>) -> Option<DataToken> {
        self.registry.lock().by_data.get(&address(data)).copied()
    }

    /// Number of registered tokens, including ones awaiting release.
    pub fn tracked(&self) -> usize {
        self.registry.lock().entries.len()
    }

    fn release(&self, token: DataToken) {
        let project = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.entries.get_mut(&token) else {
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return;
            }
            let key = address(&entry.data);
            let project = entry.project;
            if registry.by_data.get(&key) == Some(&token) {
                registry.by_data.remove(&key);
            }
            project
        };

        let registry = Arc::clone(&self.registry);
        self.gates.defer_cleanup(
            &project,
            Box::new(move || release_unreferenced(&registry, token)),
        );
    }
}

fn release_unreferenced(registry: &Mutex<Registry>, token: DataToken) {
    let entry = {
        let mut registry = registry.lock();
        match registry.entries.get(&token) {
            Some(entry) if entry.refs == 0 => {}
            _ => return,
        }
        let Some(entry) = registry.entries.remove(&token) else {
            return;
        };
        let revived = registry
            .by_data
            .get(&address(&entry.data))
            .is_some_and(|current| *current != token);
        if revived {
            debug!("{} was registered again, skipping release", token);
            return;
        }
        entry
    };

    debug!("Releasing {} data {}", entry.participant.name(), token);
    entry.participant.project_data_released(&entry.data);
}

/// A counted reference on a tracked piece of data.
pub struct TokenGuard {
    tracker: Arc<IdentityTracker>,
    token: DataToken,
}

impl TokenGuard {
    pub fn token(&self) -> DataToken {
        self.token
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.tracker.release(self.token);
    }
}

impl fmt::Debug for TokenGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TokenGuard").field(&self.token).finish()
    }
}

//! Per-project operation gate.
//!
//! A gate is entered by every operation touching a project's state and left
//! when the operation ends. While at least one operation is active, release
//! callbacks, completions of client futures and listener events are queued
//! instead of dispatched. When the last operation leaves, queued work is
//! handed to the notifier in this order: cleanups, continuations, events.
//!
//! The gate also owns the project's reload queue: at most one load runs per
//! project, later loads wait in FIFO order, and a new request joins a queued
//! or running load whose request already covers it.

use crate::cache::CacheKey;
use crate::notifier::{Job, Notifier};
use crate::participant::Participant;
use crate::service::PendingLoad;
use crate::snapshot::StateSnapshot;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strata_core::{ProjectId, StateRequest};
use tracing::{debug, trace};

#[derive(Default)]
struct GateState {
    active: usize,
    cleanups: Vec<Job>,
    continuations: Vec<Job>,
    events: Vec<(u64, Job)>,
    queued: VecDeque<Arc<PendingLoad>>,
    running: Option<Arc<PendingLoad>>,
    driver: bool,
}

impl GateState {
    fn is_idle(&self) -> bool {
        self.active == 0
            && !self.driver
            && self.running.is_none()
            && self.queued.is_empty()
            && self.cleanups.is_empty()
            && self.continuations.is_empty()
            && self.events.is_empty()
    }
}

/// Registry of per-project gates.
pub struct OperationGates {
    notifier: Notifier,
    gates: Mutex<HashMap<ProjectId, GateState>>,
}

impl OperationGates {
    pub fn new(notifier: Notifier) -> Arc<Self> {
        Arc::new(Self {
            notifier,
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Start an operation on `project`.
    pub fn enter(self: &Arc<Self>, project: &ProjectId) -> OperationTicket {
        let mut gates = self.gates.lock();
        let gate = gates.entry(*project).or_default();
        gate.active += 1;
        trace!("Entered gate for {} (active: {})", project, gate.active);

        OperationTicket {
            gates: Arc::clone(self),
            project: *project,
            left: false,
        }
    }

    fn leave_project(&self, project: &ProjectId) {
        let jobs = {
            let mut gates = self.gates.lock();
            let Some(gate) = gates.get_mut(project) else {
                return;
            };
            gate.active = gate.active.saturating_sub(1);
            trace!("Left gate for {} (active: {})", project, gate.active);
            if gate.active > 0 {
                return;
            }

            let mut jobs: Vec<Job> = std::mem::take(&mut gate.cleanups);
            jobs.append(&mut gate.continuations);
            jobs.extend(gate.events.drain(..).map(|(_, job)| job));

            if gate.is_idle() {
                gates.remove(project);
            }
            jobs
        };

        if !jobs.is_empty() {
            debug!("Flushing {} deferred jobs for {}", jobs.len(), project);
            self.notifier.submit_all(jobs);
        }
    }

    /// Whether any operation is active on `project`.
    pub fn is_active(&self, project: &ProjectId) -> bool {
        self.gates
            .lock()
            .get(project)
            .is_some_and(|gate| gate.active > 0)
    }

    /// Schedule the release of participant data.
    pub fn defer_cleanup(&self, project: &ProjectId, job: Job) {
        let job = {
            let mut gates = self.gates.lock();
            match gates.get_mut(project) {
                Some(gate) if gate.active > 0 => {
                    gate.cleanups.push(job);
                    return;
                }
                _ => job,
            }
        };
        self.notifier.submit(job);
    }

    /// Schedule work that must observe the outcome of the current operation
    /// (typically completing a client future).
    pub fn defer_continuation(&self, project: &ProjectId, job: Job) {
        let job = {
            let mut gates = self.gates.lock();
            match gates.get_mut(project) {
                Some(gate) if gate.active > 0 => {
                    gate.continuations.push(job);
                    return;
                }
                _ => job,
            }
        };
        self.notifier.submit(job);
    }

    /// Deliver a listener event, postponing it while the project is busy.
    ///
    /// Postponed events with the same `key` are coalesced into the first
    /// one; the job is expected to read current state when it runs.
    pub fn post_event(&self, project: &ProjectId, key: u64, job: Job) {
        let job = {
            let mut gates = self.gates.lock();
            match gates.get_mut(project) {
                Some(gate) if gate.active > 0 => {
                    if gate.events.iter().any(|(queued, _)| *queued == key) {
                        trace!("Coalesced event {} for {}", key, project);
                    } else {
                        gate.events.push((key, job));
                    }
                    return;
                }
                _ => job,
            }
        };
        self.notifier.submit(job);
    }

    /// Find a queued or running load for `key` whose request covers
    /// `request`.
    ///
    /// A running load is never joined by a forced request: it may already
    /// have consulted participants before the request was made.
    pub(crate) fn find_covering(
        &self,
        project: &ProjectId,
        key: &CacheKey,
        request: &StateRequest,
    ) -> Option<Arc<PendingLoad>> {
        let gates = self.gates.lock();
        let gate = gates.get(project)?;

        let joinable = |load: &Arc<PendingLoad>| {
            load.key() == key && !load.is_cancelled() && load.request().covers(request)
        };

        if let Some(running) = &gate.running {
            if !request.is_forced() && joinable(running) {
                return Some(Arc::clone(running));
            }
        }
        gate.queued.iter().find(|load| joinable(load)).cloned()
    }

    /// Queue a load. Returns `true` when the caller must start a driver for
    /// the project.
    pub(crate) fn enqueue(&self, project: &ProjectId, load: Arc<PendingLoad>) -> bool {
        let mut gates = self.gates.lock();
        let gate = gates.entry(*project).or_default();
        gate.queued.push_back(load);
        if gate.driver {
            false
        } else {
            gate.driver = true;
            true
        }
    }

    /// Take the next queued load for `project`, marking it as running. When
    /// the queue is empty the driver is released and `None` is returned.
    pub(crate) fn next_load(&self, project: &ProjectId) -> Option<Arc<PendingLoad>> {
        let mut gates = self.gates.lock();
        let gate = gates.get_mut(project)?;
        match gate.queued.pop_front() {
            Some(load) => {
                gate.running = Some(Arc::clone(&load));
                Some(load)
            }
            None => {
                gate.running = None;
                gate.driver = false;
                if gate.is_idle() {
                    gates.remove(project);
                }
                None
            }
        }
    }

    /// Number of loads waiting behind the running one.
    pub fn queued_loads(&self, project: &ProjectId) -> usize {
        self.gates
            .lock()
            .get(project)
            .map(|gate| gate.queued.len())
            .unwrap_or(0)
    }
}

/// Proof of an active operation; leaving happens on drop.
pub struct OperationTicket {
    gates: Arc<OperationGates>,
    project: ProjectId,
    left: bool,
}

impl OperationTicket {
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Leave the gate now.
    pub fn leave(mut self) {
        self.left = true;
        self.gates.leave_project(&self.project);
    }
}

impl Drop for OperationTicket {
    fn drop(&mut self) {
        if !self.left {
            self.gates.leave_project(&self.project);
        }
    }
}

/// Freshness check: can `snapshot` be handed out for `request` without a
/// reload?
///
/// The snapshot must be valid, good enough, consistent if required, built
/// from exactly the registered participants, and accepted by each of them.
/// A forced request is never satisfied by a cached state. The synthetic
/// empty state only satisfies requests for projects without participants.
pub fn satisfies(
    snapshot: &StateSnapshot,
    request: &StateRequest,
    participants: &[Arc<dyn Participant>],
) -> bool {
    if request.is_forced() || !snapshot.is_valid() {
        return false;
    }
    if snapshot.is_synthetic() {
        return participants.is_empty() && request.min_quality() <= snapshot.quality();
    }
    if snapshot.quality() < request.min_quality() {
        return false;
    }
    if request.requires_consistency() && !snapshot.is_consistent() {
        return false;
    }

    let consulted = snapshot.consulted();
    if consulted.len() != participants.len()
        || consulted
            .iter()
            .zip(participants)
            .any(|(name, p)| name.as_str() != p.name())
    {
        return false;
    }

    participants.iter().all(|participant| {
        snapshot
            .data_for(participant.name())
            .is_none_or(|data| participant.check_state(request, data))
    })
}

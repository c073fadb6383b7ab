//! The multi-round reload protocol for one project.
//!
//! ```text
//! Init -> Round(0) -> Retry(1) -> Round(1) -> ... -> Done
//!                                               \-> Failed | Cancelled
//! ```
//!
//! Participants are called one at a time in registration order. A failing
//! participant contributes degraded data and the round continues. After a
//! round the retry set is computed from explicit requests, stale fresh data
//! and capability marks. Only the retry set is called again in the next
//! round; everyone else keeps the data it has. A retry set that comes back
//! unchanged twice in a row is a reload loop.

use crate::data::ParticipantData;
use crate::error::{ParticipantFailure, ReloadError};
use crate::identity::{IdentityTracker, TokenGuard};
use crate::participant::{LoadContext, Participant, ParticipantError, PartialState, Scratch};
use crate::snapshot::StateSnapshot;
use crate::watcher::EditTracker;
use std::any::TypeId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{ProjectId, StateRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Phase of a running reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    Init,
    Round(usize),
    Retry(usize),
    Done,
    Failed,
    Cancelled,
}

/// Data gathered by a reload.
pub(crate) struct ReloadRun {
    /// Final data per participant, registration order.
    pub parts: Vec<(String, Arc<ParticipantData>)>,
    /// Data produced by participant calls of this reload.
    pub fresh: Vec<(String, Arc<ParticipantData>)>,
    pub consulted: Vec<String>,
    pub tokens: Vec<TokenGuard>,
    pub failures: Vec<ParticipantFailure>,
    pub rounds: usize,
}

pub(crate) enum ReloadOutcome {
    Done(ReloadRun),
    Failed(ReloadError),
    Cancelled(ReloadRun),
}

struct Slot {
    participant: Arc<dyn Participant>,
    current: Option<Arc<ParticipantData>>,
    produced_in: Option<usize>,
    succeeded: bool,
    failure: Option<ParticipantFailure>,
    scratch: Scratch,
}

impl Slot {
    fn name(&self) -> &str {
        self.participant.name()
    }
}

/// Runs the reload protocol against the participants of one project.
pub(crate) struct Reloader<'a> {
    project: ProjectId,
    request: &'a StateRequest,
    baseline: &'a StateSnapshot,
    tracker: &'a Arc<IdentityTracker>,
    edits: &'a EditTracker,
    cancel: CancellationToken,
    max_rounds: usize,
    slots: Vec<Slot>,
    guards: Vec<TokenGuard>,
    phase: ReloadPhase,
    rounds: usize,
    rerun: BTreeSet<String>,
    stale: BTreeSet<String>,
    failure: Option<ReloadError>,
}

impl<'a> Reloader<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: ProjectId,
        request: &'a StateRequest,
        participants: &[Arc<dyn Participant>],
        baseline: &'a StateSnapshot,
        tracker: &'a Arc<IdentityTracker>,
        edits: &'a EditTracker,
        cancel: CancellationToken,
        max_rounds: usize,
    ) -> Self {
        Self {
            project,
            request,
            baseline,
            tracker,
            edits,
            cancel,
            max_rounds,
            slots: participants
                .iter()
                .map(|participant| Slot {
                    participant: Arc::clone(participant),
                    current: None,
                    produced_in: None,
                    succeeded: false,
                    failure: None,
                    scratch: Scratch::new(),
                })
                .collect(),
            guards: Vec::new(),
            phase: ReloadPhase::Init,
            rounds: 0,
            rerun: BTreeSet::new(),
            stale: BTreeSet::new(),
            failure: None,
        }
    }

    fn transition(&mut self, next: ReloadPhase) {
        trace!("Reload of {}: {:?} -> {:?}", self.project, self.phase, next);
        self.phase = next;
    }

    pub async fn run(mut self) -> ReloadOutcome {
        let mut previous_retry: Option<BTreeSet<String>> = None;
        let mut repeats = 0;

        loop {
            match self.phase {
                ReloadPhase::Init => {
                    self.init();
                    self.transition(ReloadPhase::Round(0));
                }
                ReloadPhase::Round(round) => {
                    let Some(requested) = self.round(round).await else {
                        self.transition(ReloadPhase::Cancelled);
                        continue;
                    };
                    let retry = self.retry_set(round, requested);
                    if previous_retry.as_ref() == Some(&retry) {
                        repeats += 1;
                    } else {
                        repeats = 0;
                    }
                    if retry.is_empty() {
                        self.transition(ReloadPhase::Done);
                    } else if repeats >= 2 || round + 1 >= self.max_rounds {
                        warn!(
                            "Reload loop in {} after {} rounds: {:?}",
                            self.project,
                            round + 1,
                            retry
                        );
                        self.failure = Some(ReloadError::ReloadLoop {
                            project: self.project,
                            participants: retry.into_iter().collect(),
                        });
                        self.transition(ReloadPhase::Failed);
                    } else {
                        debug!("Reload of {} retrying for {:?}", self.project, retry);
                        self.rerun = retry.clone();
                        previous_retry = Some(retry);
                        self.transition(ReloadPhase::Retry(round + 1));
                    }
                }
                ReloadPhase::Retry(round) => {
                    if self.cancel.is_cancelled() {
                        self.transition(ReloadPhase::Cancelled);
                    } else {
                        self.transition(ReloadPhase::Round(round));
                    }
                }
                ReloadPhase::Done => {
                    let run = self.finish(true);
                    info!(
                        "Reloaded {} in {} rounds ({} participants, {} failures)",
                        self.project,
                        run.rounds,
                        run.consulted.len(),
                        run.failures.len()
                    );
                    return ReloadOutcome::Done(run);
                }
                ReloadPhase::Cancelled => {
                    info!("Reload of {} cancelled", self.project);
                    return ReloadOutcome::Cancelled(self.finish(false));
                }
                ReloadPhase::Failed => {
                    let error = self
                        .failure
                        .take()
                        .unwrap_or_else(|| ReloadError::internal("reload failed without cause"));
                    return ReloadOutcome::Failed(error);
                }
            }
        }
    }

    /// Seed every slot with its last known data and save edits if asked.
    fn init(&mut self) {
        for slot in &mut self.slots {
            slot.current = self.baseline.data_for(slot.participant.name()).cloned();
        }
        self.stale = self.unexplained_changes();
        if !self.stale.is_empty() {
            debug!(
                "Snapshot {} of {} changed outside its data, reloading {:?}",
                self.baseline.id(),
                self.project,
                self.stale
            );
        }

        if self.request.saves_modifications() {
            let files = self.baseline.loaded_files();
            match self.edits.save(files.iter()) {
                Ok(0) => {}
                Ok(saved) => debug!("Saved {} files before reloading {}", saved, self.project),
                Err(e) => warn!("Failed to save edits of {}: {}", self.project, e),
            }
        }
    }

    /// Participants that must be called because the baseline lost
    /// consistency in a way none of their data records: a new file next to
    /// theirs, or a change nobody owns. Without an owner in sight everyone
    /// is called.
    fn unexplained_changes(&self) -> BTreeSet<String> {
        let baseline = self.baseline;
        if baseline.is_synthetic() || baseline.is_consistent() {
            return BTreeSet::new();
        }

        let changed = baseline.changed_files();
        let owned = baseline.loaded_files();
        let stray: Vec<&PathBuf> = changed
            .iter()
            .filter(|path| !owned.contains(*path))
            .collect();
        let explained = !changed.is_empty()
            || !baseline.edited_files().is_empty()
            || baseline.parts().iter().any(|(_, data)| !data.is_consistent());
        if stray.is_empty() && explained {
            return BTreeSet::new();
        }

        let mut names: BTreeSet<String> = BTreeSet::new();
        for dir in stray.iter().filter_map(|path| path.parent()) {
            for slot in &self.slots {
                let neighbour = slot.current.as_ref().is_some_and(|data| {
                    data.files().iter().any(|file| file.parent() == Some(dir))
                });
                if neighbour {
                    names.insert(slot.name().to_string());
                }
            }
        }
        if names.is_empty() {
            names = self.slots.iter().map(|slot| slot.name().to_string()).collect();
        }
        names
    }

    /// Whether last known data can stand in for a participant call.
    fn reusable(&self, slot: &Slot, changed: &BTreeSet<PathBuf>) -> bool {
        let Some(data) = &slot.current else {
            return false;
        };
        data.is_valid()
            && data.is_consistent()
            && data.quality() >= self.request.min_quality()
            && !data.files().iter().any(|f| changed.contains(f))
            && !files_changed_since(data)
            && slot.participant.check_state(self.request, data)
    }

    /// Whether the slot at `index` must be called in `round`. The first
    /// round calls everyone without reusable data; retry rounds call exactly
    /// the participants scheduled for retry.
    fn needs_call(&self, round: usize, index: usize, changed: &BTreeSet<PathBuf>) -> bool {
        let slot = &self.slots[index];
        if round > 0 {
            return self.rerun.contains(slot.name());
        }
        self.request.is_forced()
            || self.stale.contains(slot.name())
            || !self.reusable(slot, changed)
    }

    /// Run one round. Returns the participants that asked for another
    /// round, or `None` when the reload was cancelled.
    async fn round(&mut self, round: usize) -> Option<BTreeSet<String>> {
        self.rounds = round + 1;
        let changed = self.baseline.changed_files();
        let mut retry: BTreeSet<String> = BTreeSet::new();
        let mut marked: Vec<TypeId> = Vec::new();

        for index in 0..self.slots.len() {
            if self.cancel.is_cancelled() {
                return None;
            }
            if !self.needs_call(round, index, &changed) {
                trace!("{} keeps its data in round {}", self.slots[index].name(), round);
                continue;
            }

            let partial = PartialState::from_parts(
                self.slots[..index]
                    .iter()
                    .filter_map(|s| s.current.clone().map(|d| (s.name().to_string(), d)))
                    .collect(),
            );
            let slot = &mut self.slots[index];
            let participant = Arc::clone(&slot.participant);
            let mut ctx = LoadContext::new(
                participant.name(),
                round,
                slot.current.clone(),
                partial,
                std::mem::take(&mut slot.scratch),
                self.cancel.clone(),
            );

            debug!("Round {}: reloading {}", round, participant.name());
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = participant.reload(&self.project, self.request, &mut ctx) => Some(result),
            };

            let outcome = ctx.into_outcome();
            slot.scratch = outcome.scratch;
            if outcome.retry {
                retry.insert(participant.name().to_string());
            }
            marked.extend(outcome.marked);

            let fresh = match result {
                None | Some(Err(ParticipantError::Cancelled)) => return None,
                Some(Ok(Some(data))) => {
                    slot.failure = None;
                    slot.succeeded = true;
                    Some(data)
                }
                Some(Ok(None)) => {
                    trace!("{} did not participate", participant.name());
                    slot.failure = None;
                    None
                }
                Some(Err(ParticipantError::PartialLoad { data, source })) => {
                    warn!("{} loaded partially: {:#}", participant.name(), source);
                    slot.failure = Some(ParticipantFailure::new(participant.name(), source));
                    slot.succeeded = true;
                    Some(data)
                }
                Some(Err(ParticipantError::Failed(error))) => {
                    warn!("{} failed to reload: {:#}", participant.name(), error);
                    slot.failure = Some(ParticipantFailure::new(participant.name(), error));
                    slot.succeeded = false;
                    Some(ParticipantData::degraded(slot.current.as_deref()))
                }
            };

            if let Some(data) = fresh {
                self.guards
                    .push(self.tracker.acquire(&self.project, &participant, &data));
                slot.current = Some(data);
                slot.produced_in = Some(round);
            }
        }

        for name in self.names_with_capabilities(&marked) {
            retry.insert(name);
        }
        Some(retry)
    }

    /// Explicit retry requests plus participants whose data from this round
    /// is already stale: invalid, inconsistent, or older than its files.
    fn retry_set(&self, round: usize, mut retry: BTreeSet<String>) -> BTreeSet<String> {
        for slot in &self.slots {
            if slot.produced_in != Some(round) || !slot.succeeded {
                continue;
            }
            let Some(data) = &slot.current else {
                continue;
            };
            if !data.is_valid() || !data.is_consistent() {
                retry.insert(slot.name().to_string());
            } else if files_changed_since(data) {
                debug!("{} data modified during load", slot.name());
                data.fire_changed(false, true);
                retry.insert(slot.name().to_string());
            }
        }
        retry
    }

    fn names_with_capabilities(&self, marked: &[TypeId]) -> Vec<String> {
        if marked.is_empty() {
            return Vec::new();
        }
        self.slots
            .iter()
            .filter(|slot| {
                slot.current
                    .as_ref()
                    .is_some_and(|data| marked.iter().any(|id| data.has_capability(*id)))
            })
            .map(|slot| slot.name().to_string())
            .collect()
    }

    /// Collect the result. Final data gets its own guards; the guards taken
    /// for intermediate data are dropped with the reloader.
    fn finish(&mut self, done: bool) -> ReloadRun {
        let mut parts = Vec::new();
        let mut fresh = Vec::new();
        let mut tokens = Vec::new();
        let mut failures = Vec::new();

        for slot in &mut self.slots {
            if let Some(data) = &slot.current {
                if slot.produced_in.is_some() {
                    fresh.push((slot.name().to_string(), Arc::clone(data)));
                }
                if done {
                    tokens.push(self.tracker.acquire(&self.project, &slot.participant, data));
                    parts.push((slot.name().to_string(), Arc::clone(data)));
                }
            }
            if let Some(failure) = slot.failure.take() {
                failures.push(failure);
            }
        }

        ReloadRun {
            parts,
            fresh,
            consulted: self.slots.iter().map(|s| s.name().to_string()).collect(),
            tokens,
            failures,
            rounds: self.rounds,
        }
    }
}

/// Whether any owned file changed on disk after the data was produced.
fn files_changed_since(data: &ParticipantData) -> bool {
    let timestamp = data.timestamp();
    data.files().iter().any(|path| {
        std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .is_ok_and(|mtime| mtime > timestamp)
    })
}

/// Final check of an assembled result against the request.
pub(crate) fn verify(
    candidate: &StateSnapshot,
    request: &StateRequest,
    failures: &[ParticipantFailure],
) -> Result<(), ReloadError> {
    if request.requires_consistency() && !candidate.is_consistent() {
        let mut files: Vec<PathBuf> = candidate.changed_files().into_iter().collect();
        files.extend(candidate.edited_files());
        return Err(ReloadError::OutOfSync {
            project: *candidate.project(),
            files,
        });
    }
    if candidate.quality() < request.min_quality() {
        let mut failures = failures.iter().cloned();
        return Err(ReloadError::Broken {
            project: *candidate.project(),
            actual: candidate.quality(),
            requested: request.min_quality(),
            cause: failures.next(),
            suppressed: failures.collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::gate::OperationGates;
    use crate::notifier::Notifier;
    use crate::snapshot::SnapshotParts;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::Quality;

    struct Counting {
        name: &'static str,
        calls: AtomicUsize,
        retries: usize,
        fail: bool,
    }

    impl Counting {
        fn new(name: &'static str, retries: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                retries,
                fail: false,
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                retries: 0,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Participant for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn reload(
            &self,
            _project: &ProjectId,
            _request: &StateRequest,
            ctx: &mut LoadContext,
        ) -> Result<Option<Arc<ParticipantData>>, ParticipantError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow::anyhow!("{} exploded", self.name).into());
            }
            if ctx.round() < self.retries {
                ctx.retry_reload();
            }
            Ok(Some(ParticipantData::builder(Quality::Loaded).build()))
        }
    }

    struct Harness {
        project: ProjectId,
        gates: Arc<OperationGates>,
        tracker: Arc<IdentityTracker>,
        edits: Arc<EditTracker>,
        baseline: Arc<StateSnapshot>,
    }

    impl Harness {
        fn new() -> Self {
            let (notifier, _handle) = Notifier::spawn();
            let gates = OperationGates::new(notifier);
            let project = ProjectId::new();
            Self {
                project,
                tracker: IdentityTracker::new(Arc::clone(&gates)),
                edits: EditTracker::new(),
                baseline: StateSnapshot::empty(project, CacheKey::plain(project), Arc::clone(&gates)),
                gates,
            }
        }

        async fn run(
            &self,
            participants: &[Arc<dyn Participant>],
            request: &StateRequest,
            cancel: CancellationToken,
        ) -> ReloadOutcome {
            Reloader::new(
                self.project,
                request,
                participants,
                &self.baseline,
                &self.tracker,
                &self.edits,
                cancel,
                16,
            )
            .run()
            .await
        }
    }

    #[tokio::test]
    async fn test_retry_round_calls_only_retry_set() {
        let h = Harness::new();
        let a = Counting::new("a", 1);
        let b = Counting::new("b", 0);
        let participants: Vec<Arc<dyn Participant>> = vec![a.clone() as Arc<dyn Participant>, b.clone()];

        let ReloadOutcome::Done(run) = h
            .run(&participants, &StateRequest::load(), CancellationToken::new())
            .await
        else {
            panic!("reload should finish");
        };

        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 1);
        assert_eq!(run.rounds, 2);
        assert_eq!(run.consulted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(run.parts.len(), 2);
    }

    #[tokio::test]
    async fn test_always_retrying_participant_loops_after_two_extra_rounds() {
        let h = Harness::new();
        let a = Counting::new("a", usize::MAX);
        let participants: Vec<Arc<dyn Participant>> = vec![a.clone() as Arc<dyn Participant>];

        let outcome = h
            .run(&participants, &StateRequest::load(), CancellationToken::new())
            .await;
        match outcome {
            ReloadOutcome::Failed(ReloadError::ReloadLoop { participants, .. }) => {
                assert_eq!(participants, vec!["a".to_string()]);
            }
            _ => panic!("expected a reload loop"),
        }
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test]
    async fn test_failure_degrades_and_round_continues() {
        let h = Harness::new();
        let a = Counting::failing("a");
        let b = Counting::new("b", 0);
        let participants: Vec<Arc<dyn Participant>> = vec![a.clone() as Arc<dyn Participant>, b.clone()];
        let request = StateRequest::load();

        let ReloadOutcome::Done(run) = h
            .run(&participants, &request, CancellationToken::new())
            .await
        else {
            panic!("a participant failure must not abort the round");
        };
        assert_eq!(b.calls(), 1);
        assert_eq!(run.parts[0].1.quality(), Quality::Fallback);
        assert_eq!(run.parts[1].1.quality(), Quality::Loaded);
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].participant, "a");

        let failures = run.failures.clone();
        let candidate = StateSnapshot::assemble(
            SnapshotParts {
                project: h.project,
                key: CacheKey::plain(h.project),
                parts: run.parts,
                consulted: run.consulted,
                tokens: run.tokens,
                predecessor: None,
                edited: BTreeSet::new(),
            },
            Arc::clone(&h.gates),
        );
        match verify(&candidate, &request, &failures) {
            Err(ReloadError::Broken {
                actual,
                cause,
                suppressed,
                ..
            }) => {
                assert_eq!(actual, Quality::Fallback);
                assert_eq!(cause.map(|c| c.participant), Some("a".to_string()));
                assert!(suppressed.is_empty());
            }
            other => panic!("expected a broken result, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let h = Harness::new();
        let a = Counting::new("a", 0);
        let participants: Vec<Arc<dyn Participant>> = vec![a.clone() as Arc<dyn Participant>];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.run(&participants, &StateRequest::load(), cancel).await;
        assert!(matches!(outcome, ReloadOutcome::Cancelled(_)));
        assert_eq!(a.calls(), 0);
    }
}

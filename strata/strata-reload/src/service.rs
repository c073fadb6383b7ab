//! Client-facing project state service.
//!
//! [`ProjectStateService`] owns the cache, the gates, the identity tracker
//! and the watcher, and drives reloads. A request either resolves right away
//! from the cache, joins a queued or running load whose request covers it,
//! or queues a new load. Each project has at most one driver task working
//! through its queue; drivers share a bounded pool of reload slots.

use crate::cache::{CacheKey, StateCache, StateRef};
use crate::data::ParticipantData;
use crate::error::{ReloadError, ReloadResult};
use crate::forwarder;
use crate::gate::{self, OperationGates};
use crate::identity::IdentityTracker;
use crate::notifier::Notifier;
use crate::participant::Participant;
use crate::reloader::{self, ReloadOutcome, ReloadRun, Reloader};
use crate::snapshot::{SnapshotParts, StateSnapshot};
use crate::watcher::{ChangeWatcher, EditTracker};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use strata_core::{
    ProjectId, Quality, ReloadConfig, RequestContext, Result, StateRequest, StrataConfig,
    StrataError,
};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type SharedResult = Shared<BoxFuture<'static, ReloadResult<Arc<StateSnapshot>>>>;

/// A load waiting in, or running from, a project's queue.
pub(crate) struct PendingLoad {
    id: u64,
    key: CacheKey,
    request: StateRequest,
    cancel: CancellationToken,
    sender: Mutex<Option<oneshot::Sender<ReloadResult<Arc<StateSnapshot>>>>>,
    result: SharedResult,
}

impl PendingLoad {
    fn new(id: u64, key: CacheKey, request: StateRequest) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        let result = rx
            .map(|received| {
                received.unwrap_or_else(|_| Err(ReloadError::internal("load dropped before completion")))
            })
            .boxed()
            .shared();

        Arc::new(Self {
            id,
            key,
            request,
            cancel: CancellationToken::new(),
            sender: Mutex::new(Some(tx)),
            result,
        })
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn request(&self) -> &StateRequest {
        &self.request
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn future(&self) -> StateFuture {
        StateFuture {
            inner: self.result.clone(),
            cancel: Some(self.cancel.clone()),
            load_id: Some(self.id),
        }
    }

    fn complete(&self, result: ReloadResult<Arc<StateSnapshot>>) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(result);
        }
    }
}

/// Eventual result of a state request.
///
/// Every request coalesced onto the same load receives a future for the same
/// result. Cancelling through any of them cancels the load.
#[must_use = "futures do nothing unless awaited"]
pub struct StateFuture {
    inner: SharedResult,
    cancel: Option<CancellationToken>,
    load_id: Option<u64>,
}

impl StateFuture {
    fn ready(result: ReloadResult<Arc<StateSnapshot>>) -> Self {
        Self {
            inner: futures::future::ready(result).boxed().shared(),
            cancel: None,
            load_id: None,
        }
    }

    /// Request cancellation of the underlying load.
    pub fn cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Id of the load serving this request; `None` when the request was
    /// answered from the cache.
    pub fn load_id(&self) -> Option<u64> {
        self.load_id
    }

    /// Result if already available.
    pub fn peek(&self) -> Option<ReloadResult<Arc<StateSnapshot>>> {
        self.inner.peek().cloned()
    }
}

impl Clone for StateFuture {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel: self.cancel.clone(),
            load_id: self.load_id,
        }
    }
}

impl Future for StateFuture {
    type Output = ReloadResult<Arc<StateSnapshot>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for StateFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFuture")
            .field("load_id", &self.load_id)
            .field("ready", &self.inner.peek().is_some())
            .finish()
    }
}

/// The project state cache and reload orchestrator.
pub struct ProjectStateService {
    config: ReloadConfig,
    participants: RwLock<HashMap<ProjectId, Vec<Arc<dyn Participant>>>>,
    cache: Arc<StateCache>,
    gates: Arc<OperationGates>,
    tracker: Arc<IdentityTracker>,
    watcher: Arc<ChangeWatcher>,
    edits: Arc<EditTracker>,
    pool: Arc<Semaphore>,
    notifier: Notifier,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_load: AtomicU64,
    me: Weak<ProjectStateService>,
}

impl ProjectStateService {
    /// Create the service and start its background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher is enabled but cannot be
    /// started
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(config: &StrataConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (notifier, _notifier_task) = Notifier::spawn();
        let gates = OperationGates::new(notifier.clone());
        let tracker = IdentityTracker::new(Arc::clone(&gates));
        let cache = StateCache::new(config.reload.state_timeout());
        let edits = EditTracker::new();
        let watcher = if config.watcher.filesystem {
            ChangeWatcher::with_filesystem(Arc::clone(&edits))?
        } else {
            ChangeWatcher::new(Arc::clone(&edits))
        };

        let evicted_watcher = Arc::downgrade(&watcher);
        let eviction_task = cache.spawn_eviction(move |keys| {
            if let Some(watcher) = evicted_watcher.upgrade() {
                for key in keys {
                    watcher.detach(key);
                }
            }
        });

        info!(
            "Project state service started (workers: {}, hold: {:?})",
            config.reload.worker_pool_size,
            config.reload.state_timeout()
        );

        Ok(Arc::new_cyclic(|me| Self {
            config: config.reload.clone(),
            participants: RwLock::new(HashMap::new()),
            cache,
            gates,
            tracker,
            watcher,
            edits,
            pool: Arc::new(Semaphore::new(config.reload.worker_pool_size)),
            notifier,
            tasks: Mutex::new(vec![eviction_task]),
            next_load: AtomicU64::new(1),
            me: me.clone(),
        }))
    }

    /// Register a participant for `project`. Participants are consulted in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if a participant with the same name is already
    /// registered for the project
    pub fn register_participant(
        &self,
        project: ProjectId,
        participant: Arc<dyn Participant>,
    ) -> Result<()> {
        let mut registered = self.participants.write();
        let list = registered.entry(project).or_default();
        if list.iter().any(|p| p.name() == participant.name()) {
            return Err(StrataError::invalid_input(format!(
                "Participant '{}' already registered for {}",
                participant.name(),
                project
            )));
        }
        debug!("Registered participant {} for {}", participant.name(), project);
        list.push(participant);
        Ok(())
    }

    pub fn participants(&self, project: &ProjectId) -> Vec<Arc<dyn Participant>> {
        self.participants
            .read()
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    /// Cache key of `context` for `project`.
    pub fn key_for(&self, project: ProjectId, context: &RequestContext) -> CacheKey {
        CacheKey::for_context(project, &self.participants(&project), context)
    }

    /// Cached state of `project` in the default context. Never blocks and
    /// never reloads.
    pub fn get_current_state(&self, project: ProjectId) -> Arc<StateSnapshot> {
        self.get_or_create(project, &RequestContext::default()).1
    }

    /// Cached ref and state for `context`, creating an empty placeholder
    /// when nothing is cached. Never reloads.
    pub fn get_or_create(
        &self,
        project: ProjectId,
        context: &RequestContext,
    ) -> (Arc<StateRef>, Arc<StateSnapshot>) {
        let key = self.key_for(project, context);
        self.get_or_create_key(&key)
    }

    fn get_or_create_key(&self, key: &CacheKey) -> (Arc<StateRef>, Arc<StateSnapshot>) {
        self.cache.get_or_create(key, || {
            trace!("Creating empty state for {}", key);
            StateSnapshot::empty(*key.project(), key.clone(), Arc::clone(&self.gates))
        })
    }

    /// Shorthand for [`ProjectStateService::request_state`].
    pub fn with_state(&self, project: ProjectId, request: StateRequest) -> StateFuture {
        self.request_state(project, request)
    }

    /// Obtain a state of `project` satisfying `request`, reloading if the
    /// cached one does not.
    pub fn request_state(&self, project: ProjectId, request: StateRequest) -> StateFuture {
        let _ticket = self.gates.enter(&project);
        let participants = self.participants(&project);
        let key = CacheKey::for_context(project, &participants, request.request_context());
        let (_, current) = self.get_or_create_key(&key);

        if participants.is_empty() {
            if request.min_quality() > Quality::EMPTY {
                debug!("No participants for {}, {} unsupported", project, request);
                return StateFuture::ready(Err(ReloadError::Unsupported {
                    project,
                    requested: request.min_quality(),
                }));
            }
            return StateFuture::ready(Ok(current));
        }

        if gate::satisfies(&current, &request, &participants) {
            trace!("Cached state {} satisfies {}", current.id(), request);
            return StateFuture::ready(Ok(current));
        }

        if let Some(load) = self.gates.find_covering(&project, &key, &request) {
            debug!("Request {} joins load {} for {}", request, load.id, key);
            return load.future();
        }

        let load = PendingLoad::new(self.next_load.fetch_add(1, Ordering::Relaxed), key, request);
        let future = load.future();
        debug!("Queued load {} ({}) for {}", load.id, load.request, load.key);

        if self.gates.enqueue(&project, Arc::clone(&load)) {
            match self.me.upgrade() {
                Some(service) => {
                    tokio::spawn(async move { service.drive(project).await });
                }
                None => load.complete(Err(ReloadError::internal("service is shutting down"))),
            }
        }
        future
    }

    /// Work through the load queue of `project`.
    async fn drive(self: Arc<Self>, project: ProjectId) {
        while let Some(load) = self.gates.next_load(&project) {
            let permit = match Arc::clone(&self.pool).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    load.complete(Err(ReloadError::internal("reload pool closed")));
                    continue;
                }
            };
            self.run_load(project, &load).await;
            drop(permit);
        }
        trace!("Driver for {} finished", project);
    }

    async fn run_load(&self, project: ProjectId, load: &Arc<PendingLoad>) {
        let ticket = self.gates.enter(&project);

        let result = self.execute(project, load).await;
        match &result {
            Ok(snapshot) => debug!("Load {} finished with {}", load.id, snapshot.id()),
            Err(e) => debug!("Load {} failed: {}", load.id, e),
        }

        let completed = Arc::clone(load);
        self.gates
            .defer_continuation(&project, Box::new(move || completed.complete(result)));
        drop(ticket);
    }

    async fn execute(
        &self,
        project: ProjectId,
        load: &Arc<PendingLoad>,
    ) -> ReloadResult<Arc<StateSnapshot>> {
        if load.is_cancelled() {
            return Err(ReloadError::Cancelled { project });
        }

        let request = load.request();
        let participants = self.participants(&project);
        let (state_ref, current) = self.get_or_create_key(load.key());

        if participants.is_empty() {
            if request.min_quality() > Quality::EMPTY {
                return Err(ReloadError::Unsupported {
                    project,
                    requested: request.min_quality(),
                });
            }
            return Ok(current);
        }
        if gate::satisfies(&current, request, &participants) {
            return Ok(current);
        }

        let reloader = Reloader::new(
            project,
            request,
            &participants,
            &current,
            &self.tracker,
            &self.edits,
            load.cancel.clone(),
            self.config.max_rounds,
        );

        match reloader.run().await {
            ReloadOutcome::Done(run) => self.publish(load, &state_ref, current, &participants, run),
            ReloadOutcome::Failed(error) => Err(error),
            ReloadOutcome::Cancelled(run) => {
                let pairs = surviving_pairs(&current, &run.fresh);
                forwarder::forward_data(&current, &pairs);
                Err(ReloadError::Cancelled { project })
            }
        }
    }

    /// Merge the reload result into the cached state if nothing observable
    /// changed, otherwise supersede the cached state.
    fn publish(
        &self,
        load: &PendingLoad,
        state_ref: &StateRef,
        current: Arc<StateSnapshot>,
        participants: &[Arc<dyn Participant>],
        run: ReloadRun,
    ) -> ReloadResult<Arc<StateSnapshot>> {
        let ReloadRun {
            parts,
            consulted,
            tokens,
            failures,
            rounds,
            ..
        } = run;
        let project = *load.key().project();

        let candidate = StateSnapshot::assemble(
            SnapshotParts {
                project,
                key: load.key().clone(),
                parts,
                consulted,
                tokens,
                predecessor: (!current.is_synthetic()).then(|| Arc::clone(&current)),
                edited: self.edits.modified_files(),
            },
            Arc::clone(&self.gates),
        );
        reloader::verify(&candidate, load.request(), &failures)?;

        if can_merge(&current, &candidate, participants, load.request()) {
            let pairs = surviving_pairs(&current, candidate.parts());
            forwarder::forward_data(&current, &pairs);
            state_ref.get();
            info!(
                "Reload of {} merged into snapshot {} after {} rounds",
                load.key(),
                current.id(),
                rounds
            );
            return Ok(current);
        }

        self.cache.publish(load.key(), &candidate);
        self.watcher.attach(load.key(), &candidate);
        current.invalidate();
        info!(
            "Snapshot {} supersedes {} for {} ({})",
            candidate.id(),
            current.id(),
            load.key(),
            candidate.quality()
        );
        Ok(candidate)
    }

    /// Host-reported unsaved edits.
    pub fn edits(&self) -> &Arc<EditTracker> {
        &self.edits
    }

    pub fn watcher(&self) -> &Arc<ChangeWatcher> {
        &self.watcher
    }

    pub fn cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<IdentityTracker> {
        &self.tracker
    }

    /// Whether an operation is in progress on `project`.
    pub fn is_busy(&self, project: &ProjectId) -> bool {
        self.gates.is_active(project)
    }

    /// Wait until every notification queued so far has been delivered.
    pub async fn flush(&self) {
        self.notifier.flush().await;
    }

    /// Stop the eviction task and the filesystem watcher. Queued
    /// notifications are still delivered.
    pub fn shutdown(&self) {
        self.watcher.shutdown();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.pool.close();
        info!("Project state service stopped");
    }
}

impl Drop for ProjectStateService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Pairs each produced data object with the cached data of the same
/// participant.
fn surviving_pairs(
    current: &StateSnapshot,
    produced: &[(String, Arc<ParticipantData>)],
) -> Vec<(Arc<ParticipantData>, Arc<ParticipantData>)> {
    produced
        .iter()
        .filter_map(|(name, data)| {
            current
                .data_for(name)
                .map(|surviving| (Arc::clone(data), Arc::clone(surviving)))
        })
        .collect()
}

/// A reload result may replace nothing observable only when every check
/// agrees: same grades, timestamp and participants, and every participant
/// finds its old data equivalent and still acceptable.
fn can_merge(
    current: &StateSnapshot,
    candidate: &StateSnapshot,
    participants: &[Arc<dyn Participant>],
    request: &StateRequest,
) -> bool {
    if current.is_synthetic()
        || current.is_valid() != candidate.is_valid()
        || current.is_consistent() != candidate.is_consistent()
        || current.quality() != candidate.quality()
        || current.timestamp() != candidate.timestamp()
        || current.consulted() != candidate.consulted()
        || current.parts().len() != candidate.parts().len()
    {
        return false;
    }

    participants.iter().all(|participant| {
        match (
            current.data_for(participant.name()),
            candidate.data_for(participant.name()),
        ) {
            (Some(old), Some(new)) => {
                Arc::ptr_eq(old, new)
                    || (participant.is_equivalent(old, new) && participant.check_state(request, old))
            }
            (None, None) => true,
            _ => false,
        }
    })
}

impl fmt::Debug for ProjectStateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectStateService")
            .field("projects", &self.participants.read().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Drop for PendingLoad {
    fn drop(&mut self) {
        if self.sender.get_mut().is_some() {
            warn!("Load {} dropped without a result", self.id);
        }
    }
}

//! Keyed cache of project states with a timed hard hold.
//!
//! Each key maps to one [`StateRef`]. A ref holds its snapshot strongly for a
//! while after every access; once idle for half the hold window it keeps only
//! a weak reference, and when that is gone the row is evicted. Publishing a
//! new snapshot for a key always replaces the ref's content.

use crate::participant::Participant;
use crate::snapshot::StateSnapshot;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use strata_core::{ProjectId, RequestContext};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Project identity plus the variant hints participants derived from a
/// request context. Variant order does not matter.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    project: ProjectId,
    variants: Vec<(String, String)>,
}

impl CacheKey {
    pub fn new<I, N, V>(project: ProjectId, variants: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut variants: Vec<(String, String)> = variants
            .into_iter()
            .map(|(name, variant)| (name.into(), variant.into()))
            .collect();
        variants.sort();
        variants.dedup();
        Self { project, variants }
    }

    /// Key without variants.
    pub fn plain(project: ProjectId) -> Self {
        Self {
            project,
            variants: Vec::new(),
        }
    }

    /// Key for a request context, asking every participant for its variant.
    pub fn for_context(
        project: ProjectId,
        participants: &[Arc<dyn Participant>],
        context: &RequestContext,
    ) -> Self {
        Self::new(
            project,
            participants.iter().filter_map(|participant| {
                participant
                    .create_variant(context)
                    .map(|variant| (participant.name().to_string(), variant))
            }),
        )
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn variants(&self) -> &[(String, String)] {
        &self.variants
    }

    pub fn is_plain(&self) -> bool {
        self.variants.is_empty()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.project)?;
        for (name, variant) in &self.variants {
            write!(f, "[{}={}]", name, variant)?;
        }
        Ok(())
    }
}

struct Slot {
    hard: Option<Arc<StateSnapshot>>,
    weak: Weak<StateSnapshot>,
    touched: Instant,
}

/// Timed reference to the most recent snapshot of one key.
pub struct StateRef {
    key: CacheKey,
    slot: Mutex<Slot>,
}

impl StateRef {
    fn new(key: CacheKey, snapshot: &Arc<StateSnapshot>) -> Self {
        Self {
            key,
            slot: Mutex::new(Slot {
                hard: Some(Arc::clone(snapshot)),
                weak: Arc::downgrade(snapshot),
                touched: Instant::now(),
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current snapshot, extending the hold.
    pub fn get(&self) -> Option<Arc<StateSnapshot>> {
        let mut slot = self.slot.lock();
        let snapshot = slot.weak.upgrade()?;
        slot.hard = Some(Arc::clone(&snapshot));
        slot.touched = Instant::now();
        Some(snapshot)
    }

    /// Current snapshot without touching the hold.
    pub fn peek(&self) -> Option<Arc<StateSnapshot>> {
        self.slot.lock().weak.upgrade()
    }

    /// Publish `snapshot`, returning the one it replaces.
    pub fn replace(&self, snapshot: &Arc<StateSnapshot>) -> Option<Arc<StateSnapshot>> {
        let mut slot = self.slot.lock();
        let previous = slot.weak.upgrade();
        slot.hard = Some(Arc::clone(snapshot));
        slot.weak = Arc::downgrade(snapshot);
        slot.touched = Instant::now();
        previous
    }

    /// Current snapshot, or `fallback` published in its place when the
    /// previous one was reclaimed.
    fn get_or_replace(&self, fallback: &Arc<StateSnapshot>) -> Arc<StateSnapshot> {
        let mut slot = self.slot.lock();
        let snapshot = slot.weak.upgrade().unwrap_or_else(|| {
            slot.weak = Arc::downgrade(fallback);
            Arc::clone(fallback)
        });
        slot.hard = Some(Arc::clone(&snapshot));
        slot.touched = Instant::now();
        snapshot
    }

    /// Whether the snapshot is held strongly by the cache.
    pub fn is_held(&self) -> bool {
        self.slot.lock().hard.is_some()
    }

    /// Drop the hard hold when idle for at least `idle`. Returns `false` when
    /// the snapshot is gone.
    fn age(&self, now: Instant, idle: Duration) -> bool {
        let snapshot = {
            let mut slot = self.slot.lock();
            if slot.hard.is_some() && now.duration_since(slot.touched) >= idle {
                trace!("Releasing hard hold of {}", self.key);
                slot.hard.take()
            } else {
                None
            }
        };
        // The snapshot may run its own teardown, keep it outside the lock.
        drop(snapshot);
        self.slot.lock().weak.strong_count() > 0
    }
}

/// Cache of project states keyed by [`CacheKey`].
pub struct StateCache {
    entries: DashMap<CacheKey, Arc<StateRef>>,
    hold: Duration,
}

impl StateCache {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            hold,
        })
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Cached snapshot for `key`, extending its hold.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<StateSnapshot>> {
        let state_ref = self.entries.get(key).map(|entry| Arc::clone(entry.value()))?;
        state_ref.get()
    }

    /// Cached ref and snapshot for `key`, publishing `make_empty()` when the
    /// key has no live snapshot. Never reloads.
    pub fn get_or_create<F>(&self, key: &CacheKey, make_empty: F) -> (Arc<StateRef>, Arc<StateSnapshot>)
    where
        F: FnOnce() -> Arc<StateSnapshot>,
    {
        if let Some(state_ref) = self.state_ref(key) {
            if let Some(snapshot) = state_ref.get() {
                return (state_ref, snapshot);
            }
        }

        let empty = make_empty();
        let state_ref = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(StateRef::new(key.clone(), &empty)))
            .value()
            .clone();
        let snapshot = state_ref.get_or_replace(&empty);
        (state_ref, snapshot)
    }

    /// Publish `snapshot` for `key`, returning the replaced snapshot.
    pub fn publish(&self, key: &CacheKey, snapshot: &Arc<StateSnapshot>) -> Option<Arc<StateSnapshot>> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().replace(snapshot),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(StateRef::new(key.clone(), snapshot)));
                None
            }
        }
    }

    pub fn state_ref(&self, key: &CacheKey) -> Option<Arc<StateRef>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Release idle hard holds and remove rows whose snapshot is gone.
    /// Returns the evicted keys.
    pub fn evict_expired(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let idle = self.hold / 2;

        let refs: Vec<Arc<StateRef>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = Vec::new();
        for state_ref in refs {
            if state_ref.age(now, idle) {
                continue;
            }
            let removed = self
                .entries
                .remove_if(state_ref.key(), |_, current| {
                    Arc::ptr_eq(current, &state_ref) && current.peek().is_none()
                })
                .is_some();
            if removed {
                debug!("Evicted cache entry {}", state_ref.key());
                evicted.push(state_ref.key().clone());
            }
        }
        evicted
    }

    /// Run [`StateCache::evict_expired`] every half hold window until the cache
    /// is dropped, passing evicted keys to `on_evict`.
    pub fn spawn_eviction<F>(self: &Arc<Self>, on_evict: F) -> JoinHandle<()>
    where
        F: Fn(&[CacheKey]) + Send + Sync + 'static,
    {
        let cache = Arc::downgrade(self);
        let period = (self.hold / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let evicted = cache.evict_expired();
                if !evicted.is_empty() {
                    on_evict(&evicted);
                }
            }
            debug!("Cache eviction task stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys currently cached for `project`.
    pub fn keys_for(&self, project: &ProjectId) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key().project() == project)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

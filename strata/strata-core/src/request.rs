//! State requests: the minimum bar a client needs a project state to meet.

use crate::quality::Quality;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque context handed to participants along with a request.
///
/// Items are looked up by type, so unrelated participants can each find the
/// hint they understand. Participants may derive a cache variant from it.
#[derive(Clone, Default)]
pub struct RequestContext {
    items: Vec<Arc<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item to the context.
    pub fn with<T: Any + Send + Sync>(mut self, item: T) -> Self {
        self.items.push(Arc::new(item));
        self
    }

    /// First item of type `T`, if any.
    pub fn lookup<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.items.iter().find_map(|item| item.downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("items", &self.items.len())
            .finish()
    }
}

/// A request for project state.
///
/// Requests compare by their flags only; the context participates in the
/// cache key instead, so two requests for different variants never meet.
#[derive(Clone, Debug)]
pub struct StateRequest {
    min_quality: Quality,
    consistent: bool,
    offline: bool,
    save_modifications: bool,
    force_reload: bool,
    context: RequestContext,
}

impl StateRequest {
    /// Load the project to at least [`Quality::Simple`]; an already loaded
    /// but inconsistent state is acceptable.
    pub fn load() -> Self {
        Self {
            min_quality: Quality::Simple,
            consistent: false,
            offline: false,
            save_modifications: false,
            force_reload: false,
            context: RequestContext::default(),
        }
    }

    /// Bring the state in sync with the files on disk, at any quality.
    pub fn refresh() -> Self {
        Self {
            min_quality: Quality::None,
            consistent: true,
            ..Self::load()
        }
    }

    /// Reload unconditionally.
    pub fn reload() -> Self {
        Self {
            consistent: true,
            force_reload: true,
            ..Self::load()
        }
    }

    pub fn to_quality(mut self, quality: Quality) -> Self {
        self.min_quality = quality;
        self
    }

    pub fn consistent(mut self) -> Self {
        self.consistent = true;
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn save_modifications(mut self) -> Self {
        self.save_modifications = true;
        self
    }

    pub fn force_reload(mut self) -> Self {
        self.force_reload = true;
        self
    }

    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn min_quality(&self) -> Quality {
        self.min_quality
    }

    pub fn requires_consistency(&self) -> bool {
        self.consistent
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn saves_modifications(&self) -> bool {
        self.save_modifications
    }

    pub fn is_forced(&self) -> bool {
        self.force_reload
    }

    pub fn request_context(&self) -> &RequestContext {
        &self.context
    }

    /// Whether a state produced for `self` also satisfies everything `other`
    /// asks for.
    pub fn covers(&self, other: &StateRequest) -> bool {
        self.min_quality >= other.min_quality
            && (self.consistent || !other.consistent)
            && (self.save_modifications || !other.save_modifications)
            && (!self.offline || other.offline)
            && (self.force_reload || !other.force_reload)
    }
}

impl Default for StateRequest {
    fn default() -> Self {
        Self::load()
    }
}

impl PartialEq for StateRequest {
    fn eq(&self, other: &Self) -> bool {
        self.min_quality == other.min_quality
            && self.consistent == other.consistent
            && self.offline == other.offline
            && self.save_modifications == other.save_modifications
            && self.force_reload == other.force_reload
    }
}

impl Eq for StateRequest {}

impl fmt::Display for StateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.min_quality)?;
        if self.consistent {
            f.write_str("+consistent")?;
        }
        if self.offline {
            f.write_str("+offline")?;
        }
        if self.save_modifications {
            f.write_str("+save")?;
        }
        if self.force_reload {
            f.write_str("+force")?;
        }
        Ok(())
    }
}

//! Shared fixtures for the reload integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use filetime::FileTime;
use parking_lot::Mutex;
use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};
use strata_core::{ProjectId, Quality, RequestContext, StateRequest, StrataConfig};
use strata_reload::{
    LoadContext, Participant, ParticipantData, ParticipantError, ProjectStateService,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Defaults with the OS watcher disabled; file events are injected.
pub fn test_config() -> StrataConfig {
    let mut config = StrataConfig::default();
    config.watcher.filesystem = false;
    config
}

pub fn service() -> Arc<ProjectStateService> {
    service_with(test_config())
}

pub fn service_with(config: StrataConfig) -> Arc<ProjectStateService> {
    init_tracing();
    ProjectStateService::new(&config).expect("service should start")
}

/// Fixed production time, so repeated loads yield equal timestamps.
pub fn epoch() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

/// Capability exposed by participants that provide a classpath.
#[derive(Debug, Clone, PartialEq)]
pub struct Classpath(pub Vec<&'static str>);

/// Request context item selecting a build profile.
#[derive(Debug, Clone)]
pub struct Profile(pub &'static str);

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Error(&'static str),
    Partial(&'static str),
}

/// Tracks how many participant calls overlap.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Active<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Active(self)
    }
}

struct Active<'a>(&'a Gauge);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What the next reload of a [`Mock`] produces.
#[derive(Clone)]
pub struct Behavior {
    pub quality: Quality,
    pub timestamp: SystemTime,
    pub files: Vec<PathBuf>,
    pub payload: Arc<dyn Any + Send + Sync>,
    pub delay: Option<Duration>,
    pub retry_rounds: usize,
    pub failure: Option<Failure>,
    pub wait_for_cancel: bool,
    pub classpath: bool,
    pub marks_classpath: bool,
    pub profile_variant: bool,
    /// Contribute nothing; last known data stays.
    pub abstain: bool,
    /// While loading in the first round, move the mtime of the owned files
    /// this far past `timestamp`. Later rounds produce data twice as far
    /// past it.
    pub touch_files: Option<Duration>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            quality: Quality::Loaded,
            timestamp: epoch(),
            files: Vec::new(),
            payload: Arc::new(String::from("model")),
            delay: None,
            retry_rounds: 0,
            failure: None,
            wait_for_cancel: false,
            classpath: false,
            marks_classpath: false,
            profile_variant: false,
            abstain: false,
            touch_files: None,
        }
    }
}

/// Scripted participant recording every interaction.
pub struct Mock {
    name: String,
    behavior: Mutex<Behavior>,
    gauge: Arc<Gauge>,
    calls: AtomicUsize,
    released: AtomicUsize,
    produced: Mutex<Option<Arc<ParticipantData>>>,
}

impl Mock {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_gauge(name, Arc::new(Gauge::default()))
    }

    pub fn with_gauge(name: &str, gauge: Arc<Gauge>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior: Mutex::new(Behavior::default()),
            gauge,
            calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            produced: Mutex::new(None),
        })
    }

    pub fn configure(&self, change: impl FnOnce(&mut Behavior)) {
        change(&mut self.behavior.lock());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn gauge(&self) -> &Arc<Gauge> {
        &self.gauge
    }

    /// Data returned by the most recent call.
    pub fn last_produced(&self) -> Option<Arc<ParticipantData>> {
        self.produced.lock().clone()
    }
}

#[async_trait]
impl Participant for Mock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reload(
        &self,
        _project: &ProjectId,
        _request: &StateRequest,
        ctx: &mut LoadContext,
    ) -> Result<Option<Arc<ParticipantData>>, ParticipantError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        let _active = self.gauge.enter();

        if behavior.wait_for_cancel {
            ctx.cancellation().cancelled().await;
            return Err(ParticipantError::Cancelled);
        }
        if let Some(delay) = behavior.delay {
            tokio::time::sleep(delay).await;
        }
        if ctx.round() < behavior.retry_rounds {
            ctx.retry_reload();
        }
        if behavior.marks_classpath && ctx.round() == 0 {
            ctx.mark_for_reload::<Classpath>();
        }
        if behavior.abstain {
            return Ok(None);
        }

        let timestamp = match behavior.touch_files {
            Some(step) if ctx.round() == 0 => {
                let mtime = FileTime::from_system_time(behavior.timestamp + step);
                for file in &behavior.files {
                    filetime::set_file_mtime(file, mtime).expect("touch owned file");
                }
                behavior.timestamp
            }
            Some(step) => behavior.timestamp + step * 2,
            None => behavior.timestamp,
        };

        let mut builder = ParticipantData::builder(behavior.quality)
            .timestamp(timestamp)
            .files(behavior.files.clone())
            .shared_payload(Arc::clone(&behavior.payload));
        if behavior.classpath {
            builder = builder.capability(Classpath(vec!["core.jar"]));
        }
        let data = builder.build();
        *self.produced.lock() = Some(Arc::clone(&data));

        match behavior.failure {
            None => Ok(Some(data)),
            Some(Failure::Partial(reason)) => {
                Err(ParticipantError::partial(data, anyhow::anyhow!(reason)))
            }
            Some(Failure::Error(reason)) => Err(anyhow::anyhow!(reason).into()),
        }
    }

    fn create_variant(&self, context: &RequestContext) -> Option<String> {
        if !self.behavior.lock().profile_variant {
            return None;
        }
        context.lookup::<Profile>().map(|profile| profile.0.to_string())
    }

    fn project_data_released(&self, _data: &ParticipantData) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Register `mocks` for a fresh project.
pub fn project_with(service: &ProjectStateService, mocks: &[&Arc<Mock>]) -> ProjectId {
    let project = ProjectId::new();
    for mock in mocks {
        let participant: Arc<dyn Participant> = Arc::clone(*mock) as Arc<dyn Participant>;
        service
            .register_participant(project, participant)
            .expect("participant names are unique");
    }
    project
}

//! # Vigil
//!
//! An event-driven scheduling core for a personal AI agent. A [`Scheduler`]
//! owns one instance of every moving part and wires them together:
//!
//! - an [`EventBus`] carrying triggers, perception changes and results
//! - an [`AsyncKeyedLock`] serializing writes to file-backed state
//! - a [`PerceptionStreamManager`] probing the environment on cadences
//! - a [`Dispatcher`] routing requests through the fast and full lanes
//! - a [`DelegationExecutor`] running multi-turn background tasks
//!
//! Nothing is global. Two schedulers in one process share no state.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn run(brain: Arc<dyn vigil::Brain>) -> Result<(), vigil::BuildError> {
//! let config = vigil::VigilConfig::load()?;
//! let scheduler = vigil::Scheduler::builder(brain)
//!     .config(config)
//!     .file_memory()
//!     .build()?;
//! scheduler.start();
//! scheduler.bus().emit("trigger:cli", serde_json::json!({ "content": "hello" }));
//! # Ok(())
//! # }
//! ```

pub mod telemetry;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use vigil_config::{ConfigError, VigilConfig};
pub use vigil_core::{
    AsyncKeyedLock, Brain, BrainReply, DispatchError, Event, EventBus, EventPattern,
    MemoryStore, PerceptionError, SubscriptionId, handler,
};
pub use vigil_delegation::{
    CommandRunner, DelegateRunner, DelegationExecutor, DelegationLimits, DelegationTask, TaskId,
    TaskSpec, TaskStatus,
};
pub use vigil_dispatch::{
    Classifier, DispatchRequest, DispatchResponse, Dispatcher, LaneKind, LaneStats,
    PatternClassifier, TriageDecision,
};
pub use vigil_memory::{FileMemory, InMemoryStore};
pub use vigil_perception::{
    Cadence, CommandSource, FnSource, PerceptionSource, PerceptionStreamManager, SourceSpec,
    SourceStats,
};

/// How often finished delegations past their retention window are evicted.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Buffer for async bus observers.
const BUS_CAPACITY: usize = 256;

/// Errors while assembling a [`Scheduler`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Perception setup failed: {0}")]
    Perception(#[from] PerceptionError),
}

enum MemorySetup {
    None,
    Store(Arc<dyn MemoryStore>),
    File,
}

/// Assembles a [`Scheduler`] from a brain, a configuration and optional
/// collaborators.
pub struct SchedulerBuilder {
    brain: Arc<dyn Brain>,
    config: VigilConfig,
    classifier: Option<Arc<dyn Classifier>>,
    memory: MemorySetup,
    runner: Option<Arc<dyn DelegateRunner>>,
    sources: Vec<SourceSpec>,
    workdir: Option<PathBuf>,
}

impl SchedulerBuilder {
    fn new(brain: Arc<dyn Brain>) -> Self {
        Self {
            brain,
            config: VigilConfig::default(),
            classifier: Some(Arc::new(PatternClassifier)),
            memory: MemorySetup::None,
            runner: None,
            sources: Vec::new(),
            workdir: None,
        }
    }

    pub fn config(mut self, config: VigilConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default pattern classifier.
    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Send every request to the full lane.
    pub fn no_classifier(mut self) -> Self {
        self.classifier = None;
        self
    }

    pub fn memory(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory = MemorySetup::Store(store);
        self
    }

    /// Use the file-backed store in the configured memory directory,
    /// sharing the scheduler's lock registry.
    pub fn file_memory(mut self) -> Self {
        self.memory = MemorySetup::File;
        self
    }

    /// Replace the configured delegate CLI.
    pub fn runner(mut self, runner: Arc<dyn DelegateRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Register a source in addition to those in the configuration.
    pub fn source(mut self, spec: SourceSpec) -> Self {
        self.sources.push(spec);
        self
    }

    /// Working directory for delegations (defaults to the process cwd).
    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        let config = self.config;
        config.validate()?;

        let bus = Arc::new(EventBus::new(BUS_CAPACITY));
        let locks = AsyncKeyedLock::new();

        let perception = PerceptionStreamManager::with_default_timeout(
            Arc::clone(&bus),
            Duration::from_millis(config.perception.default_timeout_ms),
        );
        if config.perception.enabled {
            for source in &config.perception.sources {
                perception.register(SourceSpec::from_config(
                    source,
                    config.perception.workdir.clone(),
                ))?;
            }
        }
        for spec in self.sources {
            perception.register(spec)?;
        }

        let mut limits = DelegationLimits::from(&config.delegation);
        if let Some(workdir) = self.workdir {
            limits = limits.with_workdir(workdir);
        }
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(CommandRunner::from_config(&config.delegation)));
        let delegation = DelegationExecutor::new(Arc::clone(&bus), runner, limits);

        let memory: Option<Arc<dyn MemoryStore>> = match self.memory {
            MemorySetup::None => None,
            MemorySetup::Store(store) => Some(store),
            MemorySetup::File => Some(Arc::new(
                FileMemory::new(config.memory_dir(), locks.clone()).with_limits(
                    config.memory.minimal_context_chars,
                    config.memory.full_context_chars,
                ),
            )),
        };

        let mut dispatcher =
            Dispatcher::from_config(Arc::clone(&bus), self.brain, &config.dispatch)
                .with_delegation(delegation.clone());
        if let Some(classifier) = self.classifier {
            dispatcher = dispatcher.with_classifier(classifier);
        }
        if let Some(memory) = memory {
            dispatcher = dispatcher.with_memory(memory);
        }

        info!(
            sources = perception.source_names().len(),
            max_delegations = delegation.limits().max_concurrent,
            trigger_pattern = %config.dispatch.trigger_pattern,
            "Scheduler assembled"
        );

        Ok(Scheduler {
            config,
            bus,
            locks,
            perception,
            delegation,
            dispatcher: Arc::new(dispatcher),
            running: Mutex::new(None),
        })
    }
}

/// Handles held only while the scheduler is running.
struct Running {
    triggers: SubscriptionId,
    cleanup: JoinHandle<()>,
}

/// Point-in-time view of the whole scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub version: &'static str,
    pub running: bool,
    pub lanes: Vec<LaneStats>,
    pub perception_version: u64,
    pub perception: Vec<SourceStats>,
    pub delegations_running: usize,
    pub delegations_pending: usize,
    pub locked_keys: usize,
}

pub struct Scheduler {
    config: VigilConfig,
    bus: Arc<EventBus>,
    locks: AsyncKeyedLock,
    perception: PerceptionStreamManager,
    delegation: DelegationExecutor,
    dispatcher: Arc<Dispatcher>,
    running: Mutex<Option<Running>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn builder(brain: Arc<dyn Brain>) -> SchedulerBuilder {
        SchedulerBuilder::new(brain)
    }

    /// Start perception and begin dispatching trigger events. Calling
    /// `start` on a running scheduler does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = guard(&self.running);
        if running.is_some() {
            debug!("Scheduler already running");
            return;
        }

        self.perception.start();
        let triggers = self
            .dispatcher
            .attach_triggers(self.config.dispatch.trigger_pattern.as_str());

        let delegation = self.delegation.clone();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = delegation.cleanup();
                if evicted > 0 {
                    debug!(evicted, "Expired delegations evicted");
                }
            }
        });

        *running = Some(Running { triggers, cleanup });
        info!(
            trigger_pattern = %self.config.dispatch.trigger_pattern,
            sources = self.perception.source_names().len(),
            "Scheduler started"
        );
    }

    /// Stop perception and trigger handling, refuse queued and new
    /// requests, and cancel every delegation. Requests already executing
    /// finish normally.
    pub fn shutdown(&self) {
        if let Some(running) = guard(&self.running).take() {
            self.bus.unsubscribe(running.triggers);
            running.cleanup.abort();
        }
        self.perception.stop();
        self.dispatcher.close();
        let cancelled = self.delegation.cancel_all();
        info!(cancelled_delegations = cancelled, "Scheduler shut down");
    }

    pub fn is_running(&self) -> bool {
        guard(&self.running).is_some()
    }

    /// Dispatch a request directly, bypassing the bus.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        self.dispatcher.dispatch(request).await
    }

    /// Hand a task to the delegation executor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn delegate(&self, spec: TaskSpec) -> TaskId {
        self.delegation.spawn(spec)
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn locks(&self) -> &AsyncKeyedLock {
        &self.locks
    }

    pub fn perception(&self) -> &PerceptionStreamManager {
        &self.perception
    }

    pub fn delegation(&self) -> &DelegationExecutor {
        &self.delegation
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            version: env!("CARGO_PKG_VERSION"),
            running: self.is_running(),
            lanes: self.dispatcher.lane_stats(),
            perception_version: self.perception.version(),
            perception: self.perception.stats(),
            delegations_running: self.delegation.running_count(),
            delegations_pending: self.delegation.pending_count(),
            locked_keys: self.locks.active_keys(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(running) = guard(&self.running).take() {
            self.bus.unsubscribe(running.triggers);
            running.cleanup.abort();
        }
        self.perception.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vigil_config::SourceConfig;
    use vigil_core::error::BrainError;

    struct Echo;

    #[async_trait]
    impl Brain for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            prompt: &str,
            _context: &str,
            _timeout: Duration,
        ) -> Result<BrainReply, BrainError> {
            Ok(BrainReply::text(format!("echo: {prompt}")))
        }
    }

    fn echo() -> Arc<dyn Brain> {
        Arc::new(Echo)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = VigilConfig::default();
        config.dispatch.fast.limit = 0;
        let err = Scheduler::builder(echo()).config(config).build().err().unwrap();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn duplicate_sources_are_rejected() {
        let mut config = VigilConfig::default();
        for _ in 0..2 {
            config.perception.sources.push(SourceConfig {
                name: "git".into(),
                command: "git status --short".into(),
                cadence: Default::default(),
                timeout_ms: None,
                enabled: true,
            });
        }
        let err = Scheduler::builder(echo()).config(config).build().err().unwrap();
        assert!(matches!(err, BuildError::Perception(_)));
    }

    #[test]
    fn disabled_perception_skips_configured_sources() {
        let mut config = VigilConfig::default();
        config.perception.enabled = false;
        config.perception.sources.push(SourceConfig {
            name: "git".into(),
            command: "git status --short".into(),
            cadence: Default::default(),
            timeout_ms: None,
            enabled: true,
        });
        let scheduler = Scheduler::builder(echo()).config(config).build().unwrap();
        assert!(scheduler.perception().source_names().is_empty());
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let scheduler = Scheduler::builder(echo()).build().unwrap();
        assert!(!scheduler.is_running());

        scheduler.start();
        let subscribers = scheduler.bus().subscriber_count();
        scheduler.start();
        assert_eq!(scheduler.bus().subscriber_count(), subscribers);
        assert!(scheduler.status().running);

        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.bus().subscriber_count(), subscribers - 1);
    }

    #[tokio::test]
    async fn schedulers_share_nothing() {
        let a = Scheduler::builder(echo()).build().unwrap();
        let b = Scheduler::builder(echo()).build().unwrap();
        a.start();

        a.bus().emit("trigger:cli", serde_json::json!({ "content": "hi" }));
        let reply = b
            .dispatch(DispatchRequest::new("hello", "test"))
            .await
            .unwrap();

        assert_eq!(reply.content, "echo: hello");
        assert!(!Arc::ptr_eq(a.bus(), b.bus()));
        assert_eq!(b.bus().subscriber_count(), 0);
        a.shutdown();
    }

    #[tokio::test]
    async fn status_serializes() {
        let scheduler = Scheduler::builder(echo()).no_classifier().build().unwrap();
        let reply = scheduler
            .dispatch(DispatchRequest::new("ok", "test"))
            .await
            .unwrap();
        assert_eq!(reply.lane, LaneKind::Full);

        let status = serde_json::to_value(scheduler.status()).unwrap();
        assert_eq!(status["lanes"][1]["name"], "full");
        assert_eq!(status["lanes"][1]["completed"], 1);
        assert_eq!(status["delegations_running"], 0);
        assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    }
}

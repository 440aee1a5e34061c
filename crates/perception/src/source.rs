//! Perception sources: the probes a stream manager schedules.
//!
//! A source produces a string snapshot of some part of the world. It knows
//! nothing about scheduling, hashing, or the event bus.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;
use vigil_config::{CadenceConfig, SourceConfig};
use vigil_core::error::PerceptionError;

/// Lower bound for adjusted intervals.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound for adjusted intervals.
pub const MAX_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Captured stderr is cut to this many bytes in errors.
const STDERR_LIMIT: usize = 500;

#[async_trait]
pub trait PerceptionSource: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the current snapshot.
    async fn run(&self) -> Result<String, PerceptionError>;
}

/// When a source runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Workspace state (git, tasks, inboxes): every 30 seconds.
    Workspace,
    /// Browser state: every 2 minutes.
    Browser,
    /// Slow-moving environment: every 30 minutes.
    Heartbeat,
    /// Fixed interval. Not clamped, so tests can use short periods.
    Custom(Duration),
    /// On every event matching `trigger`, with no timer.
    EventDriven { trigger: String },
}

impl Cadence {
    /// The timer period, or `None` for event-driven sources.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Cadence::Workspace => Some(Duration::from_secs(30)),
            Cadence::Browser => Some(Duration::from_secs(120)),
            Cadence::Heartbeat => Some(Duration::from_secs(30 * 60)),
            Cadence::Custom(period) => Some(*period),
            Cadence::EventDriven { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Cadence::Workspace => "workspace",
            Cadence::Browser => "browser",
            Cadence::Heartbeat => "heartbeat",
            Cadence::Custom(_) => "custom",
            Cadence::EventDriven { .. } => "event",
        }
    }
}

impl From<&CadenceConfig> for Cadence {
    fn from(config: &CadenceConfig) -> Self {
        match config {
            CadenceConfig::Workspace => Cadence::Workspace,
            CadenceConfig::Browser => Cadence::Browser,
            CadenceConfig::Heartbeat => Cadence::Heartbeat,
            CadenceConfig::Interval { interval_ms } => {
                Cadence::Custom(Duration::from_millis(*interval_ms))
            }
            CadenceConfig::Event { trigger } => Cadence::EventDriven {
                trigger: trigger.clone(),
            },
        }
    }
}

/// A source together with its scheduling parameters.
#[derive(Clone)]
pub struct SourceSpec {
    pub source: Arc<dyn PerceptionSource>,
    pub cadence: Cadence,
    /// Per-run timeout; the manager default applies when unset
    pub timeout: Option<Duration>,
    pub enabled: bool,
}

impl SourceSpec {
    pub fn new(source: impl PerceptionSource + 'static, cadence: Cadence) -> Self {
        Self {
            source: Arc::new(source),
            cadence,
            timeout: None,
            enabled: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Build a shell-command source from its configuration entry.
    pub fn from_config(config: &SourceConfig, workdir: Option<PathBuf>) -> Self {
        Self {
            source: Arc::new(CommandSource::new(&config.name, &config.command).in_dir(workdir)),
            cadence: Cadence::from(&config.cadence),
            timeout: config.timeout_ms.map(Duration::from_millis),
            enabled: config.enabled,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }
}

/// Runs `sh -c <command>` and returns stdout. A non-zero exit is a failure.
pub struct CommandSource {
    name: String,
    command: String,
    workdir: Option<PathBuf>,
}

impl CommandSource {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            workdir: None,
        }
    }

    pub fn in_dir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }
}

#[async_trait]
impl PerceptionSource for CommandSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<String, PerceptionError> {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.command);
            c
        };
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        // The manager drops this future on timeout; take the child with it.
        command.kill_on_drop(true);

        let output = command.output().await.map_err(|e| PerceptionError::Failed {
            source_name: self.name.clone(),
            reason: format!("failed to spawn: {e}"),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut stderr = stderr.trim().to_string();
            if stderr.len() > STDERR_LIMIT {
                let cut = (0..=STDERR_LIMIT)
                    .rev()
                    .find(|i| stderr.is_char_boundary(*i))
                    .unwrap_or(0);
                stderr.truncate(cut);
            }
            return Err(PerceptionError::CommandFailed {
                source_name: self.name.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        debug!(source = %self.name, bytes = output.stdout.len(), "Command source ran");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

type SnapshotFn = Box<dyn Fn() -> BoxFuture<'static, Result<String, PerceptionError>> + Send + Sync>;

/// Wraps an async closure as a source.
pub struct FnSource {
    name: String,
    f: SnapshotFn,
}

impl FnSource {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, PerceptionError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl PerceptionSource for FnSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<String, PerceptionError> {
        (self.f)().await
    }
}

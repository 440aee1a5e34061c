//! Delegation executor: bounded-concurrency background tasks.
//!
//! `spawn` returns a task id immediately. Up to `max_concurrent` tasks run at
//! once; the rest wait in a FIFO queue and are promoted whenever a running
//! task reaches a terminal state. Each running task is driven turn by turn by
//! its own tokio task, under a per-turn budget, a turn cap, and a hard
//! wall-clock deadline. Lifecycle transitions are published on the bus as
//! `delegation:*` events.

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};
use vigil_config::DelegationConfig;
use vigil_core::event::EventBus;

use crate::runner::{
    DELEGATION_MARKER, DelegateEnvironment, DelegateRequest, DelegateRunner, Turn,
};
use crate::task::{DelegationTask, TaskId, TaskSpec, TaskStatus, VerifyResult, new_task_id};

/// Transcript characters kept per task.
const TRANSCRIPT_LIMIT: usize = 5_000;

/// Verification command output kept per command.
const VERIFY_OUTPUT_LIMIT: usize = 2_000;

/// Time allowed for each verification command.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource caps for the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegationLimits {
    pub max_concurrent: usize,
    pub default_turns: u32,
    pub max_turns: u32,
    pub default_deadline: Duration,
    pub max_deadline: Duration,
    /// Soft budget for a single turn
    pub turn_budget: Duration,
    /// Finished tasks kept for `status`
    pub history_limit: usize,
    /// Age after which `cleanup` evicts finished tasks
    pub retention: Duration,
    /// Tools a delegate may use; requests are narrowed to this list
    pub allowed_tools: Vec<String>,
    /// Variables copied from this process into the delegate's environment
    pub env_allowlist: Vec<String>,
    /// Working directory for tasks that don't name one
    pub workdir: PathBuf,
}

impl DelegationLimits {
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }
}

impl From<&DelegationConfig> for DelegationLimits {
    fn from(config: &DelegationConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            default_turns: config.default_turns,
            max_turns: config.max_turns,
            default_deadline: Duration::from_millis(config.default_deadline_ms),
            max_deadline: Duration::from_millis(config.max_deadline_ms),
            turn_budget: Duration::from_millis(config.turn_budget_ms),
            history_limit: config.history_limit,
            retention: Duration::from_secs(config.retention_hours * 3_600),
            allowed_tools: config.allowed_tools.clone(),
            env_allowlist: config.env_allowlist.clone(),
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl Default for DelegationLimits {
    fn default() -> Self {
        Self::from(&DelegationConfig::default())
    }
}

/// How a driven task ended.
#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(String),
    TimedOut(String),
    Cancelled,
}

/// Everything a driver needs to run one task.
struct Launch {
    id: TaskId,
    request: DelegateRequest,
    env: DelegateEnvironment,
    deadline: Duration,
    verify: Vec<String>,
    cancel: oneshot::Receiver<()>,
}

struct Entry {
    task: DelegationTask,
    verify: Vec<String>,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Entry>,
    pending: VecDeque<TaskId>,
    running: usize,
    finished: VecDeque<TaskId>,
}

struct Inner {
    bus: Arc<EventBus>,
    runner: Arc<dyn DelegateRunner>,
    limits: DelegationLimits,
    state: Mutex<State>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve a requested working directory under `root`. Relative paths are
/// taken from `root`; anything that would leave it is refused.
fn confine_workdir(root: &Path, requested: &Path) -> Option<PathBuf> {
    let resolved = root.join(requested);
    if resolved
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    resolved.starts_with(root).then_some(resolved)
}

/// Keep at most `max` trailing characters of `text`.
fn keep_tail(text: &mut String, max: usize) {
    let excess = text.chars().count().saturating_sub(max);
    if excess > 0 {
        let cut = text
            .char_indices()
            .nth(excess)
            .map_or(text.len(), |(idx, _)| idx);
        text.drain(..cut);
    }
}

#[derive(Clone)]
pub struct DelegationExecutor {
    inner: Arc<Inner>,
}

impl DelegationExecutor {
    /// `max_concurrent` is raised to at least 1.
    pub fn new(
        bus: Arc<EventBus>,
        runner: Arc<dyn DelegateRunner>,
        mut limits: DelegationLimits,
    ) -> Self {
        limits.max_concurrent = limits.max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                bus,
                runner,
                limits,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn limits(&self) -> &DelegationLimits {
        &self.inner.limits
    }

    /// Queue a task and return its id. It starts at once if a slot is free.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, spec: TaskSpec) -> TaskId {
        let limits = &self.inner.limits;
        let id = new_task_id();
        let max_turns = spec
            .max_turns
            .unwrap_or(limits.default_turns)
            .clamp(1, limits.max_turns.max(1));
        let deadline = spec
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(limits.default_deadline)
            .min(limits.max_deadline);
        let allowed_tools = match &spec.allowed_tools {
            Some(requested) => requested
                .iter()
                .filter(|tool| limits.allowed_tools.contains(tool))
                .cloned()
                .collect(),
            None => limits.allowed_tools.clone(),
        };

        let task = DelegationTask {
            id: id.clone(),
            prompt: spec.prompt,
            status: TaskStatus::Pending,
            turns: 0,
            max_turns,
            deadline_ms: deadline.as_millis() as u64,
            workdir: match spec.workdir {
                Some(requested) => confine_workdir(&limits.workdir, &requested).unwrap_or_else(|| {
                    warn!(
                        task_id = %id,
                        requested = %requested.display(),
                        root = %limits.workdir.display(),
                        "Requested delegation workdir is outside the root; using the root"
                    );
                    limits.workdir.clone()
                }),
                None => limits.workdir.clone(),
            },
            allowed_tools,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            transcript: String::new(),
            error: None,
            verify_results: Vec::new(),
        };

        let launch = {
            let mut state = guard(&self.inner.state);
            state.tasks.insert(
                id.clone(),
                Entry {
                    task,
                    verify: spec.verify,
                    cancel: None,
                },
            );
            if state.running < limits.max_concurrent {
                self.inner.launch_locked(&mut state, &id)
            } else {
                state.pending.push_back(id.clone());
                let position = state.pending.len();
                drop(state);
                info!(task_id = %id, position, "Delegation queued");
                self.inner
                    .bus
                    .emit("delegation:queued", json!({ "id": id, "position": position }));
                None
            }
        };

        if let Some(launch) = launch {
            self.inner.start(launch);
        }
        id
    }

    /// Cancel a pending or running task. Returns whether anything was cancelled.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = guard(&self.inner.state);
        let Some(status) = state.tasks.get(id).map(|e| e.task.status) else {
            return false;
        };

        match status {
            TaskStatus::Pending => {
                state.pending.retain(|queued| queued != id);
                self.inner
                    .mark_finished(&mut state, id, TaskStatus::Cancelled, None);
                drop(state);
                info!(task_id = %id, "Pending delegation cancelled");
                self.inner
                    .bus
                    .emit("delegation:cancelled", json!({ "id": id }));
                true
            }
            TaskStatus::Running => {
                // The driver terminates the delegate and records the outcome.
                let sender = state.tasks.get_mut(id).and_then(|e| e.cancel.take());
                sender.is_some_and(|tx| tx.send(()).is_ok())
            }
            _ => false,
        }
    }

    /// Cancel everything pending or running. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = {
            let state = guard(&self.inner.state);
            state
                .tasks
                .values()
                .filter(|e| !e.task.status.is_terminal())
                .map(|e| e.task.id.clone())
                .collect()
        };
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn status(&self, id: &str) -> Option<DelegationTask> {
        guard(&self.inner.state)
            .tasks
            .get(id)
            .map(|e| e.task.clone())
    }

    /// Known tasks, oldest first.
    pub fn list(&self, include_finished: bool) -> Vec<DelegationTask> {
        let state = guard(&self.inner.state);
        let mut tasks: Vec<DelegationTask> = state
            .tasks
            .values()
            .filter(|e| include_finished || !e.task.status.is_terminal())
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn running_count(&self) -> usize {
        guard(&self.inner.state).running
    }

    pub fn pending_count(&self) -> usize {
        guard(&self.inner.state).pending.len()
    }

    /// Evict finished tasks older than the retention window.
    /// Returns the number evicted.
    pub fn cleanup(&self) -> usize {
        let retention = chrono::Duration::from_std(self.inner.limits.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;

        let mut state = guard(&self.inner.state);
        let expired: Vec<TaskId> = state
            .finished
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(*id)
                    .and_then(|e| e.task.finished_at)
                    .is_some_and(|at| at <= cutoff)
            })
            .cloned()
            .collect();
        for id in &expired {
            state.tasks.remove(id);
        }
        state.finished.retain(|id| !expired.contains(id));

        if !expired.is_empty() {
            debug!(evicted = expired.len(), "Delegation history cleaned up");
        }
        expired.len()
    }
}

impl Inner {
    /// Mark a task running and build its launch. The caller spawns the
    /// driver after releasing the state lock.
    fn launch_locked(&self, state: &mut State, id: &str) -> Option<Launch> {
        let entry = state.tasks.get_mut(id)?;
        let (tx, rx) = oneshot::channel();
        entry.cancel = Some(tx);
        entry.task.status = TaskStatus::Running;
        entry.task.started_at = Some(Utc::now());
        state.running += 1;

        let task = &entry.task;
        Some(Launch {
            id: task.id.clone(),
            request: DelegateRequest {
                task_id: task.id.clone(),
                prompt: task.prompt.clone(),
                max_turns: task.max_turns,
            },
            env: DelegateEnvironment {
                workdir: task.workdir.clone(),
                allowed_tools: task.allowed_tools.clone(),
                vars: self.delegate_vars(),
            },
            deadline: Duration::from_millis(task.deadline_ms),
            verify: entry.verify.clone(),
            cancel: rx,
        })
    }

    /// The allowlisted part of this process's environment plus the marker.
    fn delegate_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .limits
            .env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        vars.push((DELEGATION_MARKER.to_string(), "1".to_string()));
        vars
    }

    fn start(self: &Arc<Self>, launch: Launch) {
        info!(
            task_id = %launch.id,
            max_turns = launch.request.max_turns,
            deadline_ms = launch.deadline.as_millis() as u64,
            runner = self.runner.name(),
            "Delegation started"
        );
        self.bus.emit(
            "delegation:started",
            json!({
                "id": launch.id,
                "max_turns": launch.request.max_turns,
                "deadline_ms": launch.deadline.as_millis() as u64,
            }),
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive(launch).await });
    }

    async fn drive(self: Arc<Self>, mut launch: Launch) {
        let deadline = Instant::now() + launch.deadline;
        let outcome = match self.run_session(&mut launch, deadline).await {
            Outcome::Completed if !launch.verify.is_empty() => {
                // Verification still counts against the deadline and can be
                // cancelled; dropping it kills the running command.
                let verified = tokio::select! {
                    _ = &mut launch.cancel => None,
                    verified = timeout_at(
                        deadline,
                        self.verify(&launch.id, &launch.env, &launch.verify),
                    ) => Some(verified),
                };
                match verified {
                    None => Outcome::Cancelled,
                    Some(Ok(outcome)) => outcome,
                    Some(Err(_)) => Outcome::TimedOut(format!(
                        "deadline of {}ms exceeded during verification",
                        launch.deadline.as_millis()
                    )),
                }
            }
            outcome => outcome,
        };
        self.finish(&launch.id, outcome);
    }

    async fn run_session(&self, launch: &mut Launch, deadline: Instant) -> Outcome {
        let deadline_ms = launch.deadline.as_millis() as u64;
        let max_turns = launch.request.max_turns;

        let started = tokio::select! {
            _ = &mut launch.cancel => return Outcome::Cancelled,
            started = timeout_at(deadline, self.runner.start(&launch.request, &launch.env)) => started,
        };
        let mut session = match started {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Outcome::Failed(e.to_string()),
            Err(_) => return Outcome::TimedOut(format!("deadline of {deadline_ms}ms exceeded")),
        };

        let mut turns = 0u32;
        loop {
            let step = tokio::select! {
                _ = &mut launch.cancel => None,
                result = timeout_at(deadline, timeout(self.limits.turn_budget, session.next_turn())) => Some(result),
            };

            let outcome = match step {
                None => Outcome::Cancelled,
                Some(Err(_)) => Outcome::TimedOut(format!("deadline of {deadline_ms}ms exceeded")),
                Some(Ok(Err(_))) => Outcome::TimedOut(format!(
                    "turn exceeded its {}ms budget",
                    self.limits.turn_budget.as_millis()
                )),
                Some(Ok(Ok(Err(e)))) => Outcome::Failed(e.to_string()),
                Some(Ok(Ok(Ok(Turn::Output(text))))) => {
                    turns += 1;
                    if turns > max_turns {
                        Outcome::TimedOut(format!("exceeded {max_turns} turns"))
                    } else {
                        self.record_turn(&launch.id, turns, &text);
                        continue;
                    }
                }
                Some(Ok(Ok(Ok(Turn::Finished(summary))))) => {
                    if let Some(summary) = summary {
                        self.record_turn(&launch.id, turns, &summary);
                    }
                    return Outcome::Completed;
                }
            };

            session.terminate().await;
            return outcome;
        }
    }

    fn record_turn(&self, id: &str, turns: u32, text: &str) {
        let mut state = guard(&self.state);
        let Some(entry) = state.tasks.get_mut(id) else {
            return;
        };
        let task = &mut entry.task;
        task.turns = turns;
        if !text.is_empty() {
            if !task.transcript.is_empty() {
                task.transcript.push('\n');
            }
            task.transcript.push_str(text);
            keep_tail(&mut task.transcript, TRANSCRIPT_LIMIT);
        }
        debug!(task_id = %id, turn = turns, "Delegation turn");
    }

    async fn verify(&self, id: &str, env: &DelegateEnvironment, commands: &[String]) -> Outcome {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = run_verify(command, env).await;
            debug!(task_id = %id, command = %command, passed = result.passed, "Verification ran");
            results.push(result);
        }

        let failed: Vec<String> = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.command.clone())
            .collect();
        if let Some(entry) = guard(&self.state).tasks.get_mut(id) {
            entry.task.verify_results = results;
        }

        if failed.is_empty() {
            Outcome::Completed
        } else {
            Outcome::Failed(format!("verification failed: {}", failed.join(", ")))
        }
    }

    /// Record a terminal state; caller holds the state lock.
    fn mark_finished(&self, state: &mut State, id: &str, status: TaskStatus, error: Option<String>) {
        if let Some(entry) = state.tasks.get_mut(id) {
            entry.cancel = None;
            entry.task.status = status;
            entry.task.finished_at = Some(Utc::now());
            entry.task.error = error;
        }
        state.finished.push_back(id.to_string());
        while state.finished.len() > self.limits.history_limit {
            if let Some(evicted) = state.finished.pop_front() {
                state.tasks.remove(&evicted);
            }
        }
    }

    fn finish(self: &Arc<Self>, id: &str, outcome: Outcome) {
        let (status, error) = match &outcome {
            Outcome::Completed => (TaskStatus::Completed, None),
            Outcome::Failed(e) => (TaskStatus::Failed, Some(e.clone())),
            Outcome::TimedOut(e) => (TaskStatus::TimedOut, Some(e.clone())),
            Outcome::Cancelled => (TaskStatus::Cancelled, None),
        };

        let (snapshot, launches) = {
            let mut state = guard(&self.state);
            state.running = state.running.saturating_sub(1);
            self.mark_finished(&mut state, id, status, error);
            let snapshot = state.tasks.get(id).map(|e| e.task.clone());

            let mut launches = Vec::new();
            while state.running < self.limits.max_concurrent {
                let Some(next) = state.pending.pop_front() else {
                    break;
                };
                launches.extend(self.launch_locked(&mut state, &next));
            }
            (snapshot, launches)
        };

        let turns = snapshot.as_ref().map_or(0, |t| t.turns);
        let duration_ms = snapshot.as_ref().and_then(|t| t.duration_ms()).unwrap_or(0);
        match outcome {
            Outcome::Completed => {
                info!(task_id = %id, turns, duration_ms, "Delegation completed");
                let transcript = snapshot.map(|t| t.transcript).unwrap_or_default();
                self.bus.emit(
                    "delegation:completed",
                    json!({ "id": id, "transcript": transcript }),
                );
            }
            Outcome::Failed(error) => {
                warn!(task_id = %id, turns, error = %error, "Delegation failed");
                self.bus
                    .emit("delegation:failed", json!({ "id": id, "error": error }));
            }
            Outcome::TimedOut(reason) => {
                warn!(task_id = %id, turns, reason = %reason, "Delegation timed out");
                self.bus.emit(
                    "delegation:timeout",
                    json!({ "id": id, "error": reason, "turns": turns }),
                );
            }
            Outcome::Cancelled => {
                info!(task_id = %id, turns, "Delegation cancelled");
                self.bus.emit("delegation:cancelled", json!({ "id": id }));
            }
        }

        for launch in launches {
            self.start(launch);
        }
    }
}

async fn run_verify(command: &str, env: &DelegateEnvironment) -> VerifyResult {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };
    cmd.current_dir(&env.workdir)
        .env_clear()
        .envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let (passed, mut output) = match timeout(VERIFY_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            (out.status.success(), text)
        }
        Ok(Err(e)) => (false, format!("failed to spawn: {e}")),
        Err(_) => (
            false,
            format!("timed out after {}s", VERIFY_TIMEOUT.as_secs()),
        ),
    };
    keep_tail(&mut output, VERIFY_OUTPUT_LIMIT);

    VerifyResult {
        command: command.to_string(),
        passed,
        output: output.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::DelegateSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_core::error::DelegationError;
    use vigil_core::event::{Event, handler};

    #[derive(Clone, Copy)]
    enum End {
        Finish,
        Fail,
    }

    /// Produces `turns` outputs, one per `turn_delay`, then ends.
    struct ScriptedRunner {
        turns: usize,
        turn_delay: Duration,
        end: End,
        terminated: Arc<AtomicUsize>,
        envs: Arc<Mutex<Vec<DelegateEnvironment>>>,
    }

    impl ScriptedRunner {
        fn new(turns: usize, turn_delay: Duration, end: End) -> Self {
            Self {
                turns,
                turn_delay,
                end,
                terminated: Arc::new(AtomicUsize::new(0)),
                envs: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct ScriptedSession {
        produced: usize,
        turns: usize,
        turn_delay: Duration,
        end: End,
        terminated: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DelegateSession for ScriptedSession {
        async fn next_turn(&mut self) -> Result<Turn, DelegationError> {
            tokio::time::sleep(self.turn_delay).await;
            if self.produced < self.turns {
                self.produced += 1;
                return Ok(Turn::Output(format!("turn {}", self.produced)));
            }
            match self.end {
                End::Finish => Ok(Turn::Finished(Some("done".into()))),
                End::Fail => Err(DelegationError::Exited { code: 1 }),
            }
        }

        async fn terminate(&mut self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DelegateRunner for ScriptedRunner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(
            &self,
            _request: &DelegateRequest,
            env: &DelegateEnvironment,
        ) -> Result<Box<dyn DelegateSession>, DelegationError> {
            self.envs.lock().unwrap().push(env.clone());
            Ok(Box::new(ScriptedSession {
                produced: 0,
                turns: self.turns,
                turn_delay: self.turn_delay,
                end: self.end,
                terminated: Arc::clone(&self.terminated),
            }))
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl DelegateRunner for FailingRunner {
        fn name(&self) -> &str {
            "failing"
        }

        async fn start(
            &self,
            _request: &DelegateRequest,
            _env: &DelegateEnvironment,
        ) -> Result<Box<dyn DelegateSession>, DelegationError> {
            Err(DelegationError::Spawn("no such program".into()))
        }
    }

    fn limits(max_concurrent: usize) -> DelegationLimits {
        DelegationLimits {
            max_concurrent,
            turn_budget: Duration::from_secs(5),
            ..DelegationLimits::default()
        }
        .with_workdir(std::env::temp_dir())
    }

    fn record(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(
            "delegation:*",
            handler(move |e: &Event| sink.lock().unwrap().push(e.clone())),
        );
        seen
    }

    fn types(seen: &Mutex<Vec<Event>>) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    const SEC: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn extra_task_queues_until_a_slot_frees() {
        let bus = Arc::new(EventBus::default());
        let seen = record(&bus);
        let runner = ScriptedRunner::new(2, SEC, End::Finish);
        let exec = DelegationExecutor::new(Arc::clone(&bus), Arc::new(runner), limits(2));

        let a = exec.spawn(TaskSpec::new("a"));
        let b = exec.spawn(TaskSpec::new("b"));
        let c = exec.spawn(TaskSpec::new("c"));

        assert_eq!(exec.running_count(), 2);
        assert_eq!(exec.pending_count(), 1);
        assert_eq!(exec.status(&c).unwrap().status, TaskStatus::Pending);

        // Two turns then the finish, one second each.
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(exec.status(&a).unwrap().status, TaskStatus::Completed);
        assert_eq!(exec.status(&b).unwrap().status, TaskStatus::Completed);
        assert_eq!(exec.status(&c).unwrap().status, TaskStatus::Running);
        assert_eq!(exec.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let done = exec.status(&c).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.turns, 2);
        assert_eq!(done.transcript, "turn 1\nturn 2\ndone");
        assert_eq!(exec.running_count(), 0);

        let types = types(&seen);
        assert_eq!(types.iter().filter(|t| *t == "delegation:queued").count(), 1);
        assert_eq!(types.iter().filter(|t| *t == "delegation:started").count(), 3);
        assert_eq!(types.iter().filter(|t| *t == "delegation:completed").count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_while_producing_turns_times_out() {
        let bus = Arc::new(EventBus::default());
        let seen = record(&bus);
        let runner = ScriptedRunner::new(usize::MAX, SEC, End::Finish);
        let terminated = Arc::clone(&runner.terminated);
        let exec = DelegationExecutor::new(Arc::clone(&bus), Arc::new(runner), limits(2));

        let id = exec.spawn(TaskSpec::new("endless").max_turns(10).deadline_ms(3_500));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let task = exec.status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert_eq!(task.turns, 3);
        assert!(task.error.unwrap().contains("deadline"));
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert!(types(&seen).contains(&"delegation:timeout".to_string()));
        assert!(!types(&seen).contains(&"delegation:completed".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_turn_cap_times_out() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(usize::MAX, SEC, End::Finish);
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits(2));

        let id = exec.spawn(TaskSpec::new("chatty").max_turns(2).deadline_ms(60_000));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let task = exec.status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert_eq!(task.turns, 2);
        assert!(task.error.unwrap().contains("2 turns"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_turn_exceeds_budget() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(1, Duration::from_secs(30), End::Finish);
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits(2));

        let id = exec.spawn(TaskSpec::new("slow").deadline_ms(60_000));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let task = exec.status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert!(task.error.unwrap().contains("budget"));
    }

    #[tokio::test(start_paused = true)]
    async fn runner_errors_fail_the_task() {
        let bus = Arc::new(EventBus::default());
        let seen = record(&bus);
        let exec = DelegationExecutor::new(
            Arc::clone(&bus),
            Arc::new(ScriptedRunner::new(1, SEC, End::Fail)),
            limits(2),
        );

        let id = exec.spawn(TaskSpec::new("broken"));
        tokio::time::sleep(Duration::from_secs(3)).await;

        let task = exec.status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("code 1"));

        let failed = seen
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.event_type == "delegation:failed")
            .cloned()
            .unwrap();
        assert_eq!(failed.str_field("id"), Some(id.as_str()));
        assert!(failed.str_field("error").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failure_fails_and_promotes() {
        let bus = Arc::new(EventBus::default());
        let exec = DelegationExecutor::new(bus, Arc::new(FailingRunner), limits(1));

        let first = exec.spawn(TaskSpec::new("one"));
        let second = exec.spawn(TaskSpec::new("two"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(exec.status(&first).unwrap().status, TaskStatus::Failed);
        assert_eq!(exec.status(&second).unwrap().status, TaskStatus::Failed);
        assert_eq!(exec.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_and_pending() {
        let bus = Arc::new(EventBus::default());
        let seen = record(&bus);
        let runner = ScriptedRunner::new(usize::MAX, SEC, End::Finish);
        let terminated = Arc::clone(&runner.terminated);
        let exec = DelegationExecutor::new(Arc::clone(&bus), Arc::new(runner), limits(1));

        let running = exec.spawn(TaskSpec::new("running"));
        let queued = exec.spawn(TaskSpec::new("queued"));
        let extra = exec.spawn(TaskSpec::new("extra"));
        assert_eq!(exec.pending_count(), 2);

        assert!(exec.cancel(&queued));
        assert_eq!(exec.status(&queued).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(exec.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(exec.cancel(&running));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(exec.status(&running).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(exec.status(&extra).unwrap().status, TaskStatus::Running);

        assert!(!exec.cancel(&running));
        assert!(!exec.cancel("del-unknown"));
        assert_eq!(
            types(&seen)
                .iter()
                .filter(|t| *t == "delegation:cancelled")
                .count(),
            2
        );

        assert_eq!(exec.cancel_all(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exec.status(&extra).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn requested_limits_are_capped() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(0, SEC, End::Finish);
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits(2));

        let capped = exec.spawn(TaskSpec::new("big").max_turns(50).deadline_ms(3_600_000));
        let defaulted = exec.spawn(TaskSpec::new("plain"));

        let capped = exec.status(&capped).unwrap();
        assert_eq!(capped.max_turns, 10);
        assert_eq!(capped.deadline_ms, 600_000);

        let defaulted = exec.status(&defaulted).unwrap();
        assert_eq!(defaulted.max_turns, 5);
        assert_eq!(defaulted.deadline_ms, 300_000);
    }

    #[tokio::test(start_paused = true)]
    async fn delegate_gets_restricted_environment() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(0, SEC, End::Finish);
        let envs = Arc::clone(&runner.envs);
        let limits = DelegationLimits {
            env_allowlist: vec!["PATH".into(), "VIGIL_TEST_UNSET_VARIABLE".into()],
            ..limits(2)
        }
        .with_workdir("/tmp");
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits);

        let id = exec.spawn(
            TaskSpec::new("tools")
                .allowed_tools(vec!["Read".into(), "WebFetch".into()])
                .workdir("project"),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(exec.status(&id).unwrap().status, TaskStatus::Completed);

        let envs = envs.lock().unwrap();
        let env = &envs[0];
        assert_eq!(env.workdir, PathBuf::from("/tmp/project"));
        assert_eq!(env.allowed_tools, vec!["Read".to_string()]);
        assert_eq!(env.var(DELEGATION_MARKER), Some("1"));
        assert!(env.var("VIGIL_TEST_UNSET_VARIABLE").is_none());
        assert!(env.var("HOME").is_none());
        assert!(
            env.vars
                .iter()
                .all(|(k, _)| k == "PATH" || k == DELEGATION_MARKER)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn workdir_is_confined_to_the_root() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(0, SEC, End::Finish);
        let exec = DelegationExecutor::new(
            bus,
            Arc::new(runner),
            limits(4).with_workdir("/srv/workspace"),
        );

        let nested = exec.spawn(TaskSpec::new("a").workdir("/srv/workspace/app"));
        let relative = exec.spawn(TaskSpec::new("b").workdir("app/src"));
        let outside = exec.spawn(TaskSpec::new("c").workdir("/home/user/.config/vigil/memory"));
        let escaping = exec.spawn(TaskSpec::new("d").workdir("../other"));

        let workdir = |id: &str| exec.status(id).unwrap().workdir;
        assert_eq!(workdir(&nested), PathBuf::from("/srv/workspace/app"));
        assert_eq!(workdir(&relative), PathBuf::from("/srv/workspace/app/src"));
        assert_eq!(workdir(&outside), PathBuf::from("/srv/workspace"));
        assert_eq!(workdir(&escaping), PathBuf::from("/srv/workspace"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_concurrency_still_runs_tasks() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(1, SEC, End::Finish);
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits(0));
        assert_eq!(exec.limits().max_concurrent, 1);

        let id = exec.spawn(TaskSpec::new("solo"));
        assert_eq!(exec.status(&id).unwrap().status, TaskStatus::Running);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(exec.status(&id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded_and_cleaned_up() {
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(0, SEC, End::Finish);
        let limits = DelegationLimits {
            history_limit: 2,
            retention: Duration::ZERO,
            ..limits(3)
        };
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits);

        let first = exec.spawn(TaskSpec::new("1"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = exec.spawn(TaskSpec::new("2"));
        let third = exec.spawn(TaskSpec::new("3"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(exec.status(&first).is_none());
        assert!(exec.status(&second).is_some());
        assert!(exec.status(&third).is_some());
        assert_eq!(exec.list(true).len(), 2);
        assert!(exec.list(false).is_empty());

        assert_eq!(exec.cleanup(), 2);
        assert!(exec.list(true).is_empty());
    }

    #[test]
    fn transcript_tail_respects_char_boundaries() {
        let mut text = "héllo wörld".to_string();
        keep_tail(&mut text, 5);
        assert_eq!(text, "wörld");

        let mut short = "ok".to_string();
        keep_tail(&mut short, 5);
        assert_eq!(short, "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verification_commands_gate_completion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("result.txt"), "ok").unwrap();
        let bus = Arc::new(EventBus::default());
        let runner = ScriptedRunner::new(1, Duration::from_millis(5), End::Finish);
        let exec = DelegationExecutor::new(bus, Arc::new(runner), limits(2));

        let passing = exec.spawn(
            TaskSpec::new("pass")
                .workdir(dir.path())
                .verify(vec!["test -f result.txt".into()]),
        );
        let failing = exec.spawn(
            TaskSpec::new("fail")
                .workdir(dir.path())
                .verify(vec!["echo missing; exit 1".into()]),
        );

        for _ in 0..200 {
            let done = [&passing, &failing]
                .iter()
                .all(|id| exec.status(id).is_some_and(|t| t.status.is_terminal()));
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let passed = exec.status(&passing).unwrap();
        assert_eq!(passed.status, TaskStatus::Completed);
        assert!(passed.verify_results[0].passed);

        let failed = exec.status(&failing).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.verify_results[0].output, "missing");
        assert!(failed.error.unwrap().contains("verification failed"));
    }

    #[cfg(unix)]
    async fn wait_terminal(exec: &DelegationExecutor, id: &str) -> DelegationTask {
        for _ in 0..400 {
            if let Some(task) = exec.status(id).filter(|t| t.status.is_terminal()) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {id} did not finish");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_during_verification_cancels() {
        let bus = Arc::new(EventBus::default());
        let seen = record(&bus);
        let runner = ScriptedRunner::new(0, Duration::ZERO, End::Finish);
        let exec = DelegationExecutor::new(Arc::clone(&bus), Arc::new(runner), limits(1));

        let id = exec.spawn(TaskSpec::new("check").verify(vec!["sleep 5".into()]));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(exec.status(&id).unwrap().status, TaskStatus::Running);

        let started = std::time::Instant::now();
        assert!(exec.cancel(&id));
        let task = wait_terminal(&exec, &id).await;

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(types(&seen).contains(&"delegation:cancelled".to_string()));
        assert_eq!(exec.running_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verification_counts_against_the_deadline() {
        let bus = Arc::new(EventBus::default());
        let seen = record(&bus);
        let runner = ScriptedRunner::new(0, Duration::ZERO, End::Finish);
        let exec = DelegationExecutor::new(Arc::clone(&bus), Arc::new(runner), limits(1));

        let id = exec.spawn(
            TaskSpec::new("slow check")
                .deadline_ms(500)
                .verify(vec!["sleep 5".into()]),
        );
        let task = wait_terminal(&exec, &id).await;

        assert_eq!(task.status, TaskStatus::TimedOut);
        assert!(task.duration_ms().unwrap() < 3_000);
        assert!(task.error.unwrap().contains("deadline of 500ms"));
        assert!(types(&seen).contains(&"delegation:timeout".to_string()));
    }
}

//! Delegate runners: how a delegated task actually executes.
//!
//! The executor drives a [`DelegateSession`] turn by turn and owns all
//! policy (turn caps, deadlines, cancellation). A runner only knows how to
//! start a session inside a [`DelegateEnvironment`], which is everything the
//! task is allowed to see.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vigil_config::DelegationConfig;
use vigil_core::error::DelegationError;

/// Environment variable set for every delegate so it can tell it is one.
pub const DELEGATION_MARKER: &str = "VIGIL_DELEGATION";

/// Stderr kept for error reports.
const STDERR_TAIL: usize = 2_000;

/// The only context a delegate receives. No memory, bus, or dispatcher
/// handle is ever part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateEnvironment {
    pub workdir: PathBuf,
    pub allowed_tools: Vec<String>,
    /// Complete environment of the delegate process
    pub vars: Vec<(String, String)>,
}

impl DelegateEnvironment {
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateRequest {
    pub task_id: String,
    pub prompt: String,
    pub max_turns: u32,
}

/// One step of a running delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// The delegate produced a turn of output.
    Output(String),
    /// The delegate is done, optionally with a final summary.
    Finished(Option<String>),
}

#[async_trait]
pub trait DelegateSession: Send {
    /// Wait for the next turn.
    async fn next_turn(&mut self) -> Result<Turn, DelegationError>;

    /// Stop the delegate. Called on cancellation and timeouts.
    async fn terminate(&mut self);
}

#[async_trait]
pub trait DelegateRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn start(
        &self,
        request: &DelegateRequest,
        env: &DelegateEnvironment,
    ) -> Result<Box<dyn DelegateSession>, DelegationError>;
}

/// Runs a CLI agent (by default `claude`) as a subprocess, one JSON line of
/// `--output-format stream-json` per event.
pub struct CommandRunner {
    program: String,
    extra_args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn from_config(config: &DelegationConfig) -> Self {
        Self::new(&config.program).with_args(config.extra_args.clone())
    }

    fn args(&self, request: &DelegateRequest, env: &DelegateEnvironment) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if !env.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(env.allowed_tools.join(","));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl DelegateRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn start(
        &self,
        request: &DelegateRequest,
        env: &DelegateEnvironment,
    ) -> Result<Box<dyn DelegateSession>, DelegationError> {
        let mut child = Command::new(&self.program)
            .args(self.args(request, env))
            .current_dir(&env.workdir)
            .env_clear()
            .envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DelegationError::Spawn(format!("{}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DelegationError::Io("delegate stdout was not captured".into()))?;

        // Drain stderr concurrently so a chatty delegate cannot fill the pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        debug!(task_id = %request.task_id, program = %self.program, pid = ?child.id(), "Delegate process started");
        Ok(Box::new(CommandSession {
            child,
            lines: BufReader::new(stdout).lines(),
            stderr,
        }))
    }
}

struct CommandSession {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
}

impl CommandSession {
    async fn stderr_tail(&mut self) -> String {
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        let stderr = handle.await.unwrap_or_default();
        let trimmed = stderr.trim();
        let start = trimmed
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map_or(0, |(idx, _)| idx);
        trimmed[start..].to_string()
    }
}

#[async_trait]
impl DelegateSession for CommandSession {
    async fn next_turn(&mut self) -> Result<Turn, DelegationError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| DelegationError::Io(e.to_string()))?;

            let Some(line) = line else {
                let status = self
                    .child
                    .wait()
                    .await
                    .map_err(|e| DelegationError::Io(e.to_string()))?;
                if status.success() {
                    return Ok(Turn::Finished(None));
                }
                let stderr = self.stderr_tail().await;
                if !stderr.is_empty() {
                    warn!(stderr = %stderr, "Delegate exited with an error");
                }
                return Err(DelegationError::Exited {
                    code: status.code().unwrap_or(-1),
                });
            };

            if let Some(turn) = parse_line(&line)? {
                return Ok(turn);
            }
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Delegate already exited");
        }
        let _ = self.child.wait().await;
    }
}

/// Interpret one stdout line. `Ok(None)` means "not a turn, keep reading".
fn parse_line(line: &str) -> Result<Option<Turn>, DelegationError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Ok(Some(Turn::Output(trimmed.to_string())));
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("result") => {
            let result = value
                .get("result")
                .and_then(|r| r.as_str())
                .map(String::from);
            if value.get("is_error").and_then(|e| e.as_bool()) == Some(true) {
                let subtype = value
                    .get("subtype")
                    .and_then(|s| s.as_str())
                    .unwrap_or("error");
                return Err(DelegationError::Protocol(
                    result.unwrap_or_else(|| subtype.to_string()),
                ));
            }
            Ok(Some(Turn::Finished(result)))
        }
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            let parts: Vec<String> = blocks
                .iter()
                .filter_map(|block| match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => block.get("text").and_then(|t| t.as_str()).map(String::from),
                    Some("tool_use") => block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .map(|name| format!("[tool: {name}]")),
                    _ => None,
                })
                .collect();
            Ok(Some(Turn::Output(parts.join("\n"))))
        }
        // system / user (tool results) lines are bookkeeping, not turns
        Some(_) => Ok(None),
        None => Ok(Some(Turn::Output(trimmed.to_string()))),
    }
}

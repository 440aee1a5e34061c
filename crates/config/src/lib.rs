//! Configuration loading, validation, and management for Vigil.
//!
//! Loads configuration from `~/.vigil/config.toml` (or `$VIGIL_CONFIG_DIR/config.toml`)
//! with environment variable overrides. Every field has a default, so an empty
//! or missing file yields a working scheduler. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Triage and lane settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Perception sources and their cadences
    #[serde(default)]
    pub perception: PerceptionConfig,

    /// Background delegation limits
    #[serde(default)]
    pub delegation: DelegationConfig,

    /// File-backed memory store
    #[serde(default)]
    pub memory: MemoryConfig,
}

// --- Dispatch ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long the classifier may take before the request goes to the full lane
    #[serde(default = "default_triage_timeout_ms")]
    pub triage_timeout_ms: u64,

    /// Event pattern whose events are dispatched as requests
    #[serde(default = "default_trigger_pattern")]
    pub trigger_pattern: String,

    #[serde(default = "LaneConfig::fast")]
    pub fast: LaneConfig,

    #[serde(default = "LaneConfig::full")]
    pub full: LaneConfig,
}

fn default_triage_timeout_ms() -> u64 {
    1_500
}
fn default_trigger_pattern() -> String {
    "trigger:*".into()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            triage_timeout_ms: default_triage_timeout_ms(),
            trigger_pattern: default_trigger_pattern(),
            fast: LaneConfig::fast(),
            full: LaneConfig::full(),
        }
    }
}

/// Concurrency bound and backend timeout for one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Maximum concurrent backend calls
    pub limit: usize,

    /// Backend timeout for each call
    pub timeout_secs: u64,

    /// Reject new requests once this many are queued (unset = wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<usize>,
}

impl LaneConfig {
    pub fn fast() -> Self {
        Self {
            limit: 5,
            timeout_secs: 15,
            max_waiting: None,
        }
    }

    pub fn full() -> Self {
        Self {
            limit: 1,
            timeout_secs: 180,
            max_waiting: None,
        }
    }
}

// --- Perception ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Working directory for command sources (defaults to the process cwd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Probe timeout for sources that do not set their own
    #[serde(default = "default_probe_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_true() -> bool {
    true
}
fn default_probe_timeout_ms() -> u64 {
    10_000
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workdir: None,
            default_timeout_ms: default_probe_timeout_ms(),
            sources: vec![],
        }
    }
}

/// A shell-command perception source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Run with `sh -c` in the perception workdir; stdout is the snapshot
    pub command: String,

    #[serde(default)]
    pub cadence: CadenceConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// When a source runs.
///
/// ```toml
/// cadence = { kind = "interval", interval_ms = 60000 }
/// cadence = { kind = "event", trigger = "trigger:telegram" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CadenceConfig {
    /// Every 30 seconds
    #[default]
    Workspace,
    /// Every 2 minutes
    Browser,
    /// Every 30 minutes
    Heartbeat,
    /// Fixed custom interval
    Interval { interval_ms: u64 },
    /// Whenever an event matching `trigger` is emitted
    Event { trigger: String },
}

// --- Delegation ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Tasks allowed to run at once; the rest queue
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_turns")]
    pub default_turns: u32,

    /// Hard cap on requested turns
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// Hard cap on requested deadlines
    #[serde(default = "default_max_deadline_ms")]
    pub max_deadline_ms: u64,

    /// Soft budget for a single turn
    #[serde(default = "default_turn_budget_ms")]
    pub turn_budget_ms: u64,

    /// Finished tasks kept for `status` queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Finished tasks older than this are evicted by cleanup
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Delegate CLI to spawn
    #[serde(default = "default_program")]
    pub program: String,

    /// Extra arguments appended after the generated ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,

    /// Environment variables passed through to the delegate
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,
}

fn default_max_concurrent() -> usize {
    2
}
fn default_turns() -> u32 {
    5
}
fn default_max_turns() -> u32 {
    10
}
fn default_deadline_ms() -> u64 {
    300_000
}
fn default_max_deadline_ms() -> u64 {
    600_000
}
fn default_turn_budget_ms() -> u64 {
    120_000
}
fn default_history_limit() -> usize {
    100
}
fn default_retention_hours() -> u64 {
    24
}
fn default_program() -> String {
    "claude".into()
}
fn default_allowed_tools() -> Vec<String> {
    ["Bash", "Read", "Write", "Edit", "Glob", "Grep"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_env_allowlist() -> Vec<String> {
    ["PATH", "HOME", "LANG", "TERM", "ANTHROPIC_API_KEY"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_turns: default_turns(),
            max_turns: default_max_turns(),
            default_deadline_ms: default_deadline_ms(),
            max_deadline_ms: default_max_deadline_ms(),
            turn_budget_ms: default_turn_budget_ms(),
            history_limit: default_history_limit(),
            retention_hours: default_retention_hours(),
            program: default_program(),
            extra_args: vec![],
            allowed_tools: default_allowed_tools(),
            env_allowlist: default_env_allowlist(),
        }
    }
}

// --- Memory ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Memory directory (defaults to `<config dir>/memory`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Character budget for fast-lane context
    #[serde(default = "default_minimal_context_chars")]
    pub minimal_context_chars: usize,

    /// Character budget for full-lane context
    #[serde(default = "default_full_context_chars")]
    pub full_context_chars: usize,
}

fn default_minimal_context_chars() -> usize {
    2_000
}
fn default_full_context_chars() -> usize {
    32_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            minimal_context_chars: default_minimal_context_chars(),
            full_context_chars: default_full_context_chars(),
        }
    }
}

impl VigilConfig {
    /// Load configuration from the default path.
    ///
    /// Environment overrides:
    /// - `VIGIL_CONFIG_DIR` selects the configuration directory
    /// - `VIGIL_DELEGATE_PROGRAM` replaces `delegation.program`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(program) = std::env::var("VIGIL_DELEGATE_PROGRAM") {
            config.delegation.program = program;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        config_dir_from(std::env::var("VIGIL_CONFIG_DIR").ok())
    }

    /// Directory for the file-backed memory store.
    pub fn memory_dir(&self) -> PathBuf {
        self.memory
            .dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("memory"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, lane) in [("fast", &self.dispatch.fast), ("full", &self.dispatch.full)] {
            if lane.limit == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "dispatch.{name}.limit must be at least 1"
                )));
            }
            if lane.timeout_secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "dispatch.{name}.timeout_secs must be > 0"
                )));
            }
        }

        if self.dispatch.triage_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.triage_timeout_ms must be > 0".into(),
            ));
        }

        let mut names = HashSet::new();
        for source in &self.perception.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "perception source names must not be empty".into(),
                ));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate perception source '{}'",
                    source.name
                )));
            }
            match &source.cadence {
                CadenceConfig::Interval { interval_ms: 0 } => {
                    return Err(ConfigError::ValidationError(format!(
                        "perception source '{}' has a zero interval",
                        source.name
                    )));
                }
                CadenceConfig::Event { trigger } if trigger.trim().is_empty() => {
                    return Err(ConfigError::ValidationError(format!(
                        "perception source '{}' has an empty trigger",
                        source.name
                    )));
                }
                _ => {}
            }
        }

        let delegation = &self.delegation;
        if delegation.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "delegation.max_concurrent must be at least 1".into(),
            ));
        }
        if delegation.max_turns == 0 || delegation.default_turns > delegation.max_turns {
            return Err(ConfigError::ValidationError(
                "delegation.default_turns must be between 1 and delegation.max_turns".into(),
            ));
        }
        if delegation.default_deadline_ms > delegation.max_deadline_ms {
            return Err(ConfigError::ValidationError(
                "delegation.default_deadline_ms must not exceed delegation.max_deadline_ms".into(),
            ));
        }
        if delegation.program.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "delegation.program must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn config_dir_from(override_dir: Option<String>) -> PathBuf {
    match override_dir {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs_home().join(".vigil"),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VigilConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.fast.limit, 5);
        assert_eq!(config.dispatch.full.limit, 1);
        assert_eq!(config.delegation.max_concurrent, 2);
        assert_eq!(config.delegation.max_turns, 10);
        assert_eq!(config.perception.default_timeout_ms, 10_000);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = VigilConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: VigilConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn empty_string_yields_defaults() {
        let config = VigilConfig::from_toml_str("").unwrap();
        assert_eq!(config, VigilConfig::default());
    }

    #[test]
    fn partial_lane_config_parses() {
        let config = VigilConfig::from_toml_str(
            r#"
[dispatch]
triage_timeout_ms = 800

[dispatch.full]
limit = 2
timeout_secs = 600
max_waiting = 8
"#,
        )
        .unwrap();
        assert_eq!(config.dispatch.triage_timeout_ms, 800);
        assert_eq!(config.dispatch.full.limit, 2);
        assert_eq!(config.dispatch.full.max_waiting, Some(8));
        assert_eq!(config.dispatch.fast, LaneConfig::fast());
    }

    #[test]
    fn perception_sources_parse() {
        let config = VigilConfig::from_toml_str(
            r#"
[perception]
workdir = "/srv/agent"

[[perception.sources]]
name = "git-detail"
command = "git status --short"

[[perception.sources]]
name = "chat"
command = "cat inbox.md"
cadence = { kind = "event", trigger = "trigger:telegram" }

[[perception.sources]]
name = "disk"
command = "df -h"
cadence = { kind = "interval", interval_ms = 60000 }
timeout_ms = 2000
enabled = false
"#,
        )
        .unwrap();
        let sources = &config.perception.sources;
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].cadence, CadenceConfig::Workspace);
        assert!(sources[0].enabled);
        assert_eq!(
            sources[1].cadence,
            CadenceConfig::Event {
                trigger: "trigger:telegram".into()
            }
        );
        assert_eq!(sources[2].timeout_ms, Some(2000));
        assert!(!sources[2].enabled);
        assert_eq!(config.perception.workdir, Some(PathBuf::from("/srv/agent")));
    }

    #[test]
    fn zero_lane_limit_rejected() {
        let mut config = VigilConfig::default();
        config.dispatch.fast.limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch.fast.limit"));
    }

    #[test]
    fn zero_delegation_concurrency_rejected() {
        let result = VigilConfig::from_toml_str("[delegation]\nmax_concurrent = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn default_turns_above_cap_rejected() {
        let mut config = VigilConfig::default();
        config.delegation.default_turns = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_source_names_rejected() {
        let source = SourceConfig {
            name: "git".into(),
            command: "git status".into(),
            cadence: CadenceConfig::Workspace,
            timeout_ms: None,
            enabled: true,
        };
        let mut config = VigilConfig::default();
        config.perception.sources = vec![source.clone(), source];
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = VigilConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert_eq!(result.unwrap(), VigilConfig::default());
    }

    #[test]
    fn load_from_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[delegation]\nmax_concurrent = 4\n").unwrap();
        let config = VigilConfig::load_from(&path).unwrap();
        assert_eq!(config.delegation.max_concurrent, 4);

        std::fs::write(&path, "[delegation\n").unwrap();
        assert!(matches!(
            VigilConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn config_dir_override() {
        assert_eq!(
            config_dir_from(Some("/etc/vigil".into())),
            PathBuf::from("/etc/vigil")
        );
        assert!(config_dir_from(None).ends_with(".vigil"));
        assert!(config_dir_from(Some(String::new())).ends_with(".vigil"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = VigilConfig::default_toml();
        assert!(toml_str.contains("max_concurrent = 2"));
        assert!(toml_str.contains("trigger:*"));
    }
}

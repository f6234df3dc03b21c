use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AutomaError, Result};

/// Top-level Automa configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomaConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Snapshot persistence configuration.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

/// Dynamic step scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum dynamic steps per run (0 = unlimited).
    #[serde(default)]
    pub max_steps: usize,
    /// Default timeout for in-flight feedback requests.
    #[serde(default = "default_feedback_timeout_secs")]
    pub feedback_timeout_secs: u64,
    /// Capacity of the event bus created for an automa.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Clear every worker's local space when a run ends.
    #[serde(default = "default_reset_local_space")]
    pub reset_local_space: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_steps: 0,
            feedback_timeout_secs: default_feedback_timeout_secs(),
            event_capacity: default_event_capacity(),
            reset_local_space: default_reset_local_space(),
        }
    }
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for run logs (default: ~/.automa/logs).
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Verbosity: 1 = run summary, 2 = per step, 3 = per worker.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

/// Snapshot store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// SQLite database path (default: ~/.automa/snapshots.db).
    #[serde(default)]
    pub db_path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_checkpoint_enabled(),
            db_path: None,
        }
    }
}

fn default_feedback_timeout_secs() -> u64 { 300 }
fn default_event_capacity() -> usize { 256 }
fn default_reset_local_space() -> bool { true }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }
fn default_checkpoint_enabled() -> bool { true }

impl AutomaConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| AutomaError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| AutomaError::Config(e.to_string()))
    }

    /// Resolve the run log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        let dir = self
            .log
            .as_ref()
            .and_then(|l| l.log_dir.as_deref())
            .unwrap_or("~/.automa/logs");
        expand_home(dir)
    }

    /// Resolve the snapshot database path (expand ~).
    pub fn snapshot_db_path(&self) -> PathBuf {
        let path = self
            .checkpoint
            .as_ref()
            .and_then(|c| c.db_path.as_deref())
            .unwrap_or("~/.automa/snapshots.db");
        expand_home(path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

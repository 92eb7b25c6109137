use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoyageError};

/// Top-level Voyage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Per-node overrides, keyed by node id.
    #[serde(default)]
    pub nodes: HashMap<String, NodeOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on node executions per run (retries included).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_home")]
    pub home: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            home: default_home(),
        }
    }
}

fn default_max_steps() -> usize { 50 }
fn default_home() -> String { "~/.voyage".to_string() }

/// Retry configuration for node attempts. Backoff is linear: `base_delay_ms * n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 10_000 }

/// Node-level retry overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOverride {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
}

impl RetryConfig {
    /// Apply a node override on top of the global settings.
    pub fn merged(&self, over: Option<&NodeOverride>) -> RetryConfig {
        let mut merged = self.clone();
        if let Some(o) = over {
            if let Some(n) = o.max_retries {
                merged.max_retries = n;
            }
            if let Some(ms) = o.base_delay_ms {
                merged.base_delay_ms = ms;
            }
        }
        merged
    }
}

/// Settings for the booking agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    /// Largest charge the payment agent accepts, in USD.
    #[serde(default = "default_payment_limit")]
    pub payment_limit: f64,
    #[serde(default = "default_card_last4")]
    pub card_last4: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_agent_timeout(),
            payment_limit: default_payment_limit(),
            card_last4: default_card_last4(),
        }
    }
}

fn default_agent_timeout() -> u64 { 30 }
fn default_payment_limit() -> f64 { 1000.0 }
fn default_card_last4() -> String { "1234".to_string() }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Where execution contexts are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path. Default: <home>/runs.db
    #[serde(default)]
    pub path: Option<String>,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <home>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-node, 3 = every retry (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| VoyageError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| VoyageError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.runner.max_steps == 0 {
            return Err(VoyageError::Config("runner.max_steps must be at least 1".into()));
        }
        if self.agents.timeout_secs == 0 {
            return Err(VoyageError::Config("agents.timeout_secs must be at least 1".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(VoyageError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        if let Some(ref log) = self.log {
            if !(1..=3).contains(&log.level) {
                return Err(VoyageError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    /// Retry settings for one node, overrides applied.
    pub fn retry_for(&self, node_id: &str) -> RetryConfig {
        self.retry.merged(self.nodes.get(node_id))
    }

    /// Resolve the home directory (expand ~).
    pub fn home_dir(&self) -> PathBuf {
        expand_home(&self.runner.home)
    }

    /// Resolve the SQLite database path.
    pub fn store_path(&self) -> PathBuf {
        match self.store.path {
            Some(ref p) => expand_home(p),
            None => self.home_dir().join("runs.db"),
        }
    }

    /// Resolve the run log directory.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_ref()) {
            Some(dir) => expand_home(dir),
            None => self.home_dir().join("logs"),
        }
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
                // unset variables stay literal
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

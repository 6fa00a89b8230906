use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MaestroError, Result};
use crate::workflow::RetryPolicy;

/// Top-level maestro configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Workflow definition files (TOML or JSON) registered at startup.
    /// Relative paths resolve against the config file's directory.
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Time budget for a run when its workflow sets none.
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_ms: u64,
    /// Retry policy for steps that declare none.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// How often the sweeper evicts finished executions.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Finished executions idle for longer than this are evicted.
    #[serde(default = "default_execution_max_age_secs")]
    pub execution_max_age_secs: u64,
    /// Broadcast buffer for workflow events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_execution_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_execution_max_age_secs() -> u64 {
    3600
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_execution_ms: default_max_execution_ms(),
            default_retry: RetryPolicy::default(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            execution_max_age_secs: default_execution_max_age_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.max_execution_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn execution_max_age(&self) -> Duration {
        Duration::from_secs(self.execution_max_age_secs)
    }
}

/// Logging configuration. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MaestroError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| MaestroError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.engine.max_execution_ms == 0 {
            errors.push("engine.max_execution_ms must be positive".to_string());
        }
        if let Err(e) = self.engine.default_retry.validate() {
            errors.push(format!("engine.default_retry: {}", e));
        }
        if self.engine.event_capacity == 0 {
            errors.push("engine.event_capacity must be positive".to_string());
        }
        if self.engine.cleanup_interval_secs == 0 {
            errors.push("engine.cleanup_interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MaestroError::Config(errors.join(", ")))
        }
    }

    /// Resolve the configured workflow files against `base_dir`.
    pub fn workflow_paths(&self, base_dir: &Path) -> Vec<PathBuf> {
        self.workflows
            .iter()
            .map(|p| {
                let path = PathBuf::from(p);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            })
            .collect()
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

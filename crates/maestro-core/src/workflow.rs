//! Workflow definitions: the declarative shape a caller registers with the
//! engine, plus the checks applied before a definition is stored.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MaestroError, Result};

/// Per-step retry/backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Factor applied to the delay after every failed attempt (>= 1).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_multiplier: f64, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_multiplier,
            initial_delay_ms,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::new(0, 1.0, 0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(MaestroError::WorkflowValidation(format!(
                "backoff_multiplier must be a finite number >= 1 (got {})",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// What the engine does once a step has exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Abort the run.
    Stop,
    /// Move on to the next declared step.
    #[default]
    Continue,
    /// Same as `Continue`; per-step retries already happened.
    Retry,
    /// Run the configured fallback steps, then move on.
    Fallback,
}

/// Workflow-level failure handling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    pub on_error: OnError,
    #[serde(default)]
    pub fallback_steps: Vec<String>,
    /// Time budget for the whole run; the engine default applies when unset.
    #[serde(default)]
    pub max_execution_ms: Option<u64>,
}

impl ErrorHandlingPolicy {
    pub fn new(on_error: OnError) -> Self {
        Self {
            on_error,
            ..Default::default()
        }
    }

    pub fn with_fallback_steps(mut self, steps: Vec<String>) -> Self {
        self.fallback_steps = steps;
        self
    }

    pub fn with_max_execution_ms(mut self, ms: u64) -> Self {
        self.max_execution_ms = Some(ms);
        self
    }
}

/// One unit of work bound to a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    /// Destination field in the step input → source path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<BTreeMap<String, String>>,
    /// Source path in the agent output → destination variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_id: agent_id.into(),
            input_mapping: None,
            output_mapping: None,
            condition: None,
            retry_policy: None,
        }
    }

    /// Map `source` (e.g. `input.content`) into the step input field `dest`.
    pub fn map_input(mut self, dest: impl Into<String>, source: impl Into<String>) -> Self {
        self.input_mapping
            .get_or_insert_with(BTreeMap::new)
            .insert(dest.into(), source.into());
        self
    }

    /// Store the agent output at `source` (e.g. `data.score`) as variable `dest`.
    pub fn map_output(mut self, source: impl Into<String>, dest: impl Into<String>) -> Self {
        self.output_mapping
            .get_or_insert_with(BTreeMap::new)
            .insert(source.into(), dest.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// A registered workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandlingPolicy>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: version.into(),
            steps: vec![],
            error_handling: None,
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_error_handling(mut self, policy: ErrorHandlingPolicy) -> Self {
        self.error_handling = Some(policy);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Load a definition from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let parsed = if is_json {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            toml::from_str(&content).map_err(|e| e.to_string())
        };

        parsed.map_err(|e| {
            MaestroError::WorkflowValidation(format!("{}: {}", path.display(), e))
        })
    }

    /// Check the definition before it is registered.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("workflow id", &self.id)?;
        require_non_empty("workflow name", &self.name)?;
        require_non_empty("workflow version", &self.version)?;

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !step_id_pattern().is_match(&step.id) {
                return Err(invalid(format!(
                    "step id '{}' must be non-empty and use only letters, digits, '_', '-' or ':'",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
            require_non_empty(&format!("agent id of step '{}'", step.id), &step.agent_id)?;

            if let Some(mapping) = &step.input_mapping {
                for (dest, source) in mapping {
                    require_non_empty(&format!("input field of step '{}'", step.id), dest)?;
                    require_path(&step.id, source)?;
                }
            }
            if let Some(mapping) = &step.output_mapping {
                for (source, dest) in mapping {
                    require_path(&step.id, source)?;
                    require_non_empty(&format!("output variable of step '{}'", step.id), dest)?;
                }
            }
            if let Some(policy) = &step.retry_policy {
                policy
                    .validate()
                    .map_err(|e| invalid(format!("step '{}': {}", step.id, e)))?;
            }
        }

        if let Some(policy) = &self.error_handling {
            if policy.max_execution_ms == Some(0) {
                return Err(invalid("max_execution_ms must be positive".to_string()));
            }
            if policy.on_error == OnError::Fallback && policy.fallback_steps.is_empty() {
                return Err(invalid(
                    "on_error = \"fallback\" requires at least one fallback step".to_string(),
                ));
            }
            for id in &policy.fallback_steps {
                if !seen.contains(id.as_str()) {
                    warn!(workflow_id = %self.id, fallback = %id, "Fallback step is not declared and will be skipped");
                }
            }
        }

        Ok(())
    }
}

fn step_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_:-]+$").unwrap())
}

fn invalid(msg: String) -> MaestroError {
    MaestroError::WorkflowValidation(msg)
}

fn require_non_empty(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn require_path(step_id: &str, path: &str) -> Result<()> {
    if path.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(invalid(format!(
            "step '{}': mapping path '{}' has an empty segment",
            step_id, path
        )));
    }
    Ok(())
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaestroError {
    // Workflow errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow validation failed: {0}")]
    WorkflowValidation(String),

    #[error("Workflow execution timeout after {elapsed_ms}ms (limit {limit_ms}ms)")]
    WorkflowTimeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("Workflow cancelled by user")]
    Cancelled,

    // Step errors
    #[error("Step {step_id} failed after {attempts} attempt(s): {source}")]
    StepExecution {
        step_id: String,
        attempts: u32,
        #[source]
        source: Box<MaestroError>,
    },

    #[error("Invalid condition expression: {0}")]
    InvalidCondition(String),

    // Agent errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent {agent_id} failed: {message}")]
    Agent { agent_id: String, message: String },

    #[error("Input validation failed for agent {agent_id}: {message}")]
    Validation { agent_id: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MaestroError {
    /// Shorthand for a failure raised by an agent implementation.
    pub fn agent(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an agent input validation failure.
    pub fn validation(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MaestroError>;

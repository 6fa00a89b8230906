use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dynamically shaped key/value record used for workflow input, variables and
/// agent payloads.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller context handed to every agent invocation of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub session_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Variables>,
}

impl AgentContext {
    pub fn new(session_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            tenant_id: None,
            session_id: session_id.into(),
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// What an agent reports back for one invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Self-reported confidence in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Variables>,
}

impl AgentResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            ..Default::default()
        }
    }

    /// A handled, non-exceptional failure. The step still counts as executed,
    /// but its output mapping is not applied.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Result of a single agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub agent_id: String,
    pub context: AgentContext,
    pub response: AgentResponse,
    pub execution_time_ms: u64,
    pub tokens_used: u64,
}

impl AgentExecutionResult {
    pub fn new(agent_id: impl Into<String>, context: AgentContext, response: AgentResponse) -> Self {
        Self {
            agent_id: agent_id.into(),
            context,
            response,
            execution_time_ms: 0,
            tokens_used: 0,
        }
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Tracked record of one workflow run.
///
/// Created when the run starts, refreshed after every executed step and kept
/// by the execution tracker until it is evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub success: bool,
    pub output: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub step_results: BTreeMap<String, AgentExecutionResult>,
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
}

impl WorkflowExecutionResult {
    pub fn new(workflow_id: impl Into<String>, execution_id: ExecutionId) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            success: false,
            output: Variables::new(),
            error: None,
            execution_time_ms: 0,
            step_results: BTreeMap::new(),
            completed_steps: vec![],
            failed_step: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            cancelled: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Run lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run was accepted and is now tracked.
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    /// A step's condition evaluated false.
    StepSkipped {
        execution_id: ExecutionId,
        step_id: String,
    },
    /// A step attempt failed and will be retried after `delay_ms`.
    StepRetrying {
        execution_id: ExecutionId,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// A step invocation succeeded.
    StepCompleted {
        execution_id: ExecutionId,
        step_id: String,
        elapsed_ms: u64,
    },
    /// A step exhausted its retry policy.
    StepFailed {
        execution_id: ExecutionId,
        step_id: String,
        error: String,
    },
    /// Fallback steps are about to run for a failed step.
    FallbackStarted {
        execution_id: ExecutionId,
        failed_step: String,
        fallback_steps: Vec<String>,
    },
    /// A cancellation request was recorded.
    RunCancelled { execution_id: ExecutionId },
    /// The run finished (successfully or not).
    RunCompleted {
        execution_id: ExecutionId,
        success: bool,
        elapsed_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::FallbackStarted { execution_id, .. }
            | Self::RunCancelled { execution_id }
            | Self::RunCompleted { execution_id, .. } => execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_ids_are_unique() {
        let a = ExecutionId::new();
        let b = ExecutionId::new();
        assert_ne!(a, b);
        assert_eq!(ExecutionId::from_str(a.as_str()), a);
    }

    #[test]
    fn test_agent_response_builders() {
        let ok = AgentResponse::ok(serde_json::json!({"x": 5}))
            .with_confidence(1.7)
            .with_reasoning("obvious");
        assert!(ok.success);
        assert_eq!(ok.confidence, Some(1.0));
        assert_eq!(ok.reasoning.as_deref(), Some("obvious"));

        let failed = AgentResponse::failed("no content");
        assert!(!failed.success);
        assert!(failed.data.is_null());
    }

    #[test]
    fn test_new_execution_result_is_unsuccessful_and_unfinished() {
        let result = WorkflowExecutionResult::new("wf", ExecutionId::new());
        assert!(!result.success);
        assert!(!result.is_finished());
        assert!(result.completed_steps.is_empty());
        assert_eq!(result.started_at, result.updated_at);
    }

    #[test]
    fn test_agent_response_deserializes_with_missing_optionals() {
        let parsed: AgentResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(parsed.success);
        assert!(parsed.data.is_null());
        assert!(parsed.error.is_none());
    }
}

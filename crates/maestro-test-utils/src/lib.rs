//! Mock agents and fixtures shared by the maestro test suites.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::time::Instant;

use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::Agent;
use maestro_core::types::{AgentContext, AgentExecutionResult, AgentResponse, Variables};
use maestro_core::workflow::{RetryPolicy, WorkflowStep};

/// Calls seen by a mock agent: when each attempt started and what it got.
#[derive(Default)]
pub struct CallLog {
    attempts: Mutex<Vec<Instant>>,
    inputs: Mutex<Vec<Value>>,
}

impl CallLog {
    fn record(&self, input: &Value) {
        self.attempts.lock().unwrap().push(Instant::now());
        self.inputs.lock().unwrap().push(input.clone());
    }

    pub fn count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }

    /// Time between consecutive attempts.
    pub fn gaps(&self) -> Vec<std::time::Duration> {
        self.attempts()
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect()
    }
}

/// Always succeeds with a fixed payload.
pub struct StaticAgent {
    id: String,
    data: Value,
    pub calls: CallLog,
}

impl StaticAgent {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            calls: CallLog::default(),
        }
    }
}

impl Agent for StaticAgent {
    fn execute(&self, input: Value, ctx: AgentContext) -> BoxFuture<'_, Result<AgentExecutionResult>> {
        Box::pin(async move {
            self.calls.record(&input);
            Ok(AgentExecutionResult::new(&self.id, ctx, AgentResponse::ok(self.data.clone())))
        })
    }
}

/// Always fails with the same message.
pub struct FailingAgent {
    id: String,
    message: String,
    pub calls: CallLog,
}

impl FailingAgent {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            calls: CallLog::default(),
        }
    }
}

impl Agent for FailingAgent {
    fn execute(&self, input: Value, _ctx: AgentContext) -> BoxFuture<'_, Result<AgentExecutionResult>> {
        Box::pin(async move {
            self.calls.record(&input);
            Err(MaestroError::agent(&self.id, &self.message))
        })
    }
}

/// Fails the first `failures` attempts, then succeeds with `data`.
pub struct FlakyAgent {
    id: String,
    failures: u32,
    data: Value,
    seen: AtomicU32,
    pub calls: CallLog,
}

impl FlakyAgent {
    pub fn new(id: impl Into<String>, failures: u32, data: Value) -> Self {
        Self {
            id: id.into(),
            failures,
            data,
            seen: AtomicU32::new(0),
            calls: CallLog::default(),
        }
    }
}

impl Agent for FlakyAgent {
    fn execute(&self, input: Value, ctx: AgentContext) -> BoxFuture<'_, Result<AgentExecutionResult>> {
        Box::pin(async move {
            self.calls.record(&input);
            let attempt = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(MaestroError::agent(
                    &self.id,
                    format!("transient failure {}/{}", attempt, self.failures),
                ));
            }
            Ok(AgentExecutionResult::new(&self.id, ctx, AgentResponse::ok(self.data.clone())))
        })
    }
}

/// Succeeds with its own input as output. With a delay it also advances the
/// clock, which is handy for timeout tests under a paused runtime.
pub struct EchoAgent {
    id: String,
    delay: Option<std::time::Duration>,
    pub calls: CallLog,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: None,
            calls: CallLog::default(),
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Agent for EchoAgent {
    fn execute(&self, input: Value, ctx: AgentContext) -> BoxFuture<'_, Result<AgentExecutionResult>> {
        Box::pin(async move {
            self.calls.record(&input);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(AgentExecutionResult::new(&self.id, ctx, AgentResponse::ok(input)))
        })
    }
}

/// A caller context with fixed, recognizable ids.
pub fn test_context() -> AgentContext {
    AgentContext::new("test-session", "test-correlation").with_user("test-user")
}

/// Build run input from a JSON object literal.
pub fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A step that makes exactly one attempt.
pub fn single_attempt_step(id: &str, agent_id: &str) -> WorkflowStep {
    WorkflowStep::new(id, id, agent_id).with_retry(RetryPolicy::none())
}

/// Write `contents` to a temp file whose name ends in `suffix`.
pub fn temp_file(contents: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use maestro_core::types::{AgentContext, AgentExecutionResult, ExecutionId, Variables};

use crate::mapper;

/// Per-run state threaded through the step loop.
///
/// Lives for exactly one `execute_workflow` call. Input mappings resolve
/// against three roots: `input`, `variables` and `step_results`.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub agent_context: AgentContext,
    pub input: Variables,
    /// Values written by output mappings. Entries are added or overwritten,
    /// never removed.
    pub variables: Variables,
    pub step_results: BTreeMap<String, AgentExecutionResult>,
    pub current_step: Option<String>,
    started: Instant,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, input: Variables, agent_context: AgentContext) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: ExecutionId::new(),
            agent_context,
            input,
            variables: Variables::new(),
            step_results: BTreeMap::new(),
            current_step: None,
            started: Instant::now(),
        }
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn record_result(&mut self, step_id: impl Into<String>, result: AgentExecutionResult) {
        self.step_results.insert(step_id.into(), result);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Resolve a mapping source path such as `input.user.id`,
    /// `variables.score` or `step_results.review.response.data`.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let (root, rest) = match path.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (path, None),
        };

        match root {
            "input" => lookup(&self.input, rest),
            "variables" => lookup(&self.variables, rest),
            "step_results" => {
                let Some(rest) = rest else {
                    return serde_json::to_value(&self.step_results).ok();
                };
                let (step_id, tail) = match rest.split_once('.') {
                    Some((id, tail)) => (id, Some(tail)),
                    None => (rest, None),
                };
                let value = serde_json::to_value(self.step_results.get(step_id)?).ok()?;
                match tail {
                    Some(tail) => mapper::resolve(tail, &value).cloned(),
                    None => Some(value),
                }
            }
            _ => None,
        }
    }
}

fn lookup(map: &Variables, rest: Option<&str>) -> Option<Value> {
    match rest {
        Some(path) => mapper::resolve_in(path, map).cloned(),
        None => Some(Value::Object(map.clone())),
    }
}

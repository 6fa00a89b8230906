use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::error::{MaestroError, Result};
use crate::types::{AgentContext, AgentExecutionResult};

/// A pluggable executor bound to workflow steps.
///
/// The engine treats agents as opaque: it hands over the mapped step input and
/// the caller's context and records whatever comes back. Returning `Err`
/// signals a failed attempt and is subject to the step's retry policy.
pub trait Agent: Send + Sync + 'static {
    /// Execute one invocation.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: AgentContext,
    ) -> BoxFuture<'_, Result<AgentExecutionResult>>;

    /// Check raw step input before the first attempt.
    ///
    /// The returned value is what gets passed to `execute`. Failures must be
    /// `MaestroError::Validation`; they are not retried.
    fn validate_input(&self, raw: &serde_json::Value) -> Result<serde_json::Value> {
        Ok(raw.clone())
    }
}

/// Deserialize raw step input into an agent's typed payload.
pub fn parse_input<T: DeserializeOwned>(agent_id: &str, raw: &serde_json::Value) -> Result<T> {
    T::deserialize(raw).map_err(|e| MaestroError::validation(agent_id, e.to_string()))
}

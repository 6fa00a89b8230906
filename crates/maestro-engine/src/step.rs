use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::types::{AgentExecutionResult, WorkflowEvent};
use maestro_core::workflow::{RetryPolicy, WorkflowStep};

use crate::context::ExecutionContext;
use crate::mapper;
use crate::registry::AgentRegistry;

/// Runs one step against its agent, retrying failed attempts with
/// exponential backoff.
pub struct StepExecutor {
    agents: Arc<AgentRegistry>,
    default_retry: RetryPolicy,
    event_bus: Arc<EventBus>,
}

impl StepExecutor {
    pub fn new(agents: Arc<AgentRegistry>, default_retry: RetryPolicy, event_bus: Arc<EventBus>) -> Self {
        Self {
            agents,
            default_retry,
            event_bus,
        }
    }

    /// Execute `step` within the run described by `ctx`.
    ///
    /// Makes up to `max_retries + 1` attempts. Between failed attempts the
    /// current run sleeps for the current delay, which is then multiplied by
    /// the backoff factor. Once the policy is exhausted the last agent error
    /// is returned wrapped in `StepExecution`.
    pub async fn run(&self, step: &WorkflowStep, ctx: &ExecutionContext) -> Result<AgentExecutionResult> {
        let agent = self
            .agents
            .get(&step.agent_id)
            .await
            .ok_or_else(|| MaestroError::AgentNotFound(step.agent_id.clone()))?;

        let raw_input = mapper::apply_input_mapping(step, ctx);
        let input = agent.validate_input(&raw_input)?;

        let policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry);
        let attempts = policy.total_attempts();
        let mut delay_ms = policy.initial_delay_ms as f64;
        let mut last_err = None;

        for attempt in 1..=attempts {
            let started = Instant::now();
            match agent.execute(input.clone(), ctx.agent_context.clone()).await {
                Ok(mut result) => {
                    if result.execution_time_ms == 0 {
                        result.execution_time_ms = started.elapsed().as_millis() as u64;
                    }
                    debug!(
                        execution_id = %ctx.execution_id,
                        step_id = %step.id,
                        attempt,
                        "Step attempt succeeded"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    if attempt < attempts {
                        let backoff = Duration::from_millis(delay_ms.round() as u64);
                        warn!(
                            execution_id = %ctx.execution_id,
                            step_id = %step.id,
                            agent_id = %step.agent_id,
                            attempt,
                            max_attempts = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying step"
                        );
                        self.event_bus.publish(WorkflowEvent::StepRetrying {
                            execution_id: ctx.execution_id.clone(),
                            step_id: step.id.clone(),
                            attempt,
                            delay_ms: backoff.as_millis() as u64,
                            error: e.to_string(),
                        });
                        tokio::time::sleep(backoff).await;
                        delay_ms *= policy.backoff_multiplier;
                    }
                    last_err = Some(e);
                }
            }
        }

        let source = last_err.unwrap_or_else(|| MaestroError::agent(&step.agent_id, "no attempt was made"));
        error!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            attempts,
            error = %source,
            "Step exhausted its retry policy"
        );
        Err(MaestroError::StepExecution {
            step_id: step.id.clone(),
            attempts,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::BoxFuture;
    use maestro_core::traits::Agent;
    use maestro_core::types::{AgentContext, AgentResponse, Variables};
    use serde_json::{json, Value};

    /// Fails the first `failures` calls, then echoes its input.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Agent for Flaky {
        fn execute(&self, input: Value, ctx: AgentContext) -> BoxFuture<'_, Result<AgentExecutionResult>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= self.failures {
                    return Err(MaestroError::agent("flaky", format!("failure #{}", call)));
                }
                Ok(AgentExecutionResult::new("flaky", ctx, AgentResponse::ok(input)))
            })
        }
    }

    struct Strict;

    impl Agent for Strict {
        fn execute(&self, input: Value, ctx: AgentContext) -> BoxFuture<'_, Result<AgentExecutionResult>> {
            Box::pin(async move { Ok(AgentExecutionResult::new("strict", ctx, AgentResponse::ok(input))) })
        }

        fn validate_input(&self, raw: &Value) -> Result<Value> {
            if raw.get("content").is_none() {
                return Err(MaestroError::validation("strict", "content is required"));
            }
            Ok(raw.clone())
        }
    }

    async fn executor_with(id: &str, agent: Arc<dyn Agent>) -> StepExecutor {
        let agents = Arc::new(AgentRegistry::new());
        agents.register(id, agent).await;
        StepExecutor::new(agents, RetryPolicy::default(), Arc::new(EventBus::default()))
    }

    fn context(input: Value) -> ExecutionContext {
        let input: Variables = serde_json::from_value(input).unwrap();
        ExecutionContext::new("wf", input, AgentContext::new("s", "c"))
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let executor = StepExecutor::new(
            Arc::new(AgentRegistry::new()),
            RetryPolicy::default(),
            Arc::new(EventBus::default()),
        );
        let step = WorkflowStep::new("s", "s", "ghost");
        let err = executor.run(&step, &context(json!({}))).await.unwrap_err();
        assert!(matches!(err, MaestroError::AgentNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_policy() {
        let agent = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let executor = executor_with("flaky", agent.clone()).await;
        let step = WorkflowStep::new("s", "s", "flaky").with_retry(RetryPolicy::new(2, 2.0, 50));

        let result = executor.run(&step, &context(json!({"q": 1}))).await.unwrap();
        assert!(result.response.success);
        assert_eq!(result.response.data, json!({"q": 1}));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let agent = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let executor = executor_with("flaky", agent.clone()).await;
        let step = WorkflowStep::new("s", "s", "flaky").with_retry(RetryPolicy::new(1, 1.0, 10));

        let err = executor.run(&step, &context(json!({}))).await.unwrap_err();
        match err {
            MaestroError::StepExecution { step_id, attempts, source } => {
                assert_eq!(step_id, "s");
                assert_eq!(attempts, 2);
                assert!(source.to_string().contains("failure #2"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_applies_when_step_has_none() {
        let agent = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let executor = executor_with("flaky", agent.clone()).await;
        let step = WorkflowStep::new("s", "s", "flaky");

        let started = Instant::now();
        assert!(executor.run(&step, &context(json!({}))).await.is_err());
        assert_eq!(agent.calls.load(Ordering::SeqCst), 4);
        // 1000 + 2000 + 4000 ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let executor = executor_with("strict", Arc::new(Strict)).await;
        let step = WorkflowStep::new("s", "s", "strict").map_input("content", "input.missing");

        let err = executor.run(&step, &context(json!({}))).await.unwrap_err();
        assert!(matches!(err, MaestroError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_events_published() {
        let agent = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let agents = Arc::new(AgentRegistry::new());
        agents.register("flaky", agent).await;
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let executor = StepExecutor::new(agents, RetryPolicy::default(), bus);
        let step = WorkflowStep::new("s", "s", "flaky").with_retry(RetryPolicy::new(3, 2.0, 100));

        executor.run(&step, &context(json!({}))).await.unwrap();
        match rx.try_recv().unwrap() {
            WorkflowEvent::StepRetrying { attempt, delay_ms, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 100);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_core::config::EngineConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::event::EventBus;
use maestro_core::traits::Agent;
use maestro_core::types::{
    AgentContext, AgentExecutionResult, ExecutionId, Variables, WorkflowEvent,
    WorkflowExecutionResult,
};
use maestro_core::workflow::{OnError, WorkflowDefinition, WorkflowStep};

use crate::condition;
use crate::context::ExecutionContext;
use crate::mapper;
use crate::registry::{AgentRegistry, WorkflowRegistry};
use crate::step::StepExecutor;
use crate::sweeper::ExecutionSweeper;
use crate::tracker::ExecutionTracker;

/// Runs registered workflows against registered agents and tracks every run
/// until it is evicted.
///
/// All state is owned by the instance. Share it between tasks with `Arc`.
pub struct WorkflowEngine {
    config: EngineConfig,
    workflows: WorkflowRegistry,
    agents: Arc<AgentRegistry>,
    tracker: Arc<ExecutionTracker>,
    event_bus: Arc<EventBus>,
    steps: StepExecutor,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let agents = Arc::new(AgentRegistry::new());
        let event_bus = Arc::new(EventBus::new(config.event_capacity));
        let steps = StepExecutor::new(
            agents.clone(),
            config.default_retry.clone(),
            event_bus.clone(),
        );
        Self {
            config,
            workflows: WorkflowRegistry::new(),
            agents,
            tracker: Arc::new(ExecutionTracker::new()),
            event_bus,
            steps,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and register a workflow, replacing any previous definition
    /// with the same id.
    pub async fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        self.workflows.register(workflow).await
    }

    pub async fn register_agent(&self, id: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.register(id, agent).await;
    }

    /// Run a workflow to completion.
    ///
    /// Only an unknown workflow id is reported as `Err`. Step failures,
    /// timeouts and cancellation are recorded on the returned result.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Variables,
        context: AgentContext,
    ) -> Result<WorkflowExecutionResult> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await
            .ok_or_else(|| MaestroError::WorkflowNotFound(workflow_id.to_string()))?;

        let mut ctx = ExecutionContext::new(workflow_id, input, context);
        let mut record = WorkflowExecutionResult::new(workflow_id, ctx.execution_id.clone());
        self.tracker.insert(record.clone()).await;

        info!(
            execution_id = %ctx.execution_id,
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            "Workflow execution started"
        );
        self.event_bus.publish(WorkflowEvent::RunStarted {
            execution_id: ctx.execution_id.clone(),
            workflow_id: workflow.id.clone(),
        });

        let policy = workflow.error_handling.clone().unwrap_or_default();
        let limit_ms = policy
            .max_execution_ms
            .unwrap_or(self.config.max_execution_ms);

        for step in &workflow.steps {
            if let Some(expr) = &step.condition {
                if !condition::evaluate(expr, &ctx.variables) {
                    debug!(
                        execution_id = %ctx.execution_id,
                        step_id = %step.id,
                        condition = %expr,
                        "Step condition false, skipping"
                    );
                    self.event_bus.publish(WorkflowEvent::StepSkipped {
                        execution_id: ctx.execution_id.clone(),
                        step_id: step.id.clone(),
                    });
                    continue;
                }
            }

            ctx.current_step = Some(step.id.clone());
            let mut halt = false;
            match self.steps.run(step, &ctx).await {
                Ok(result) => self.record_success(step, result, &mut ctx, &mut record),
                Err(e) => {
                    self.record_failure(step, &e, &ctx, &mut record);
                    match policy.on_error {
                        OnError::Stop => halt = true,
                        OnError::Continue | OnError::Retry => {}
                        OnError::Fallback => {
                            self.run_fallbacks(&workflow, step, &policy.fallback_steps, &mut ctx, &mut record)
                                .await;
                        }
                    }
                }
            }

            let elapsed_ms = ctx.elapsed().as_millis() as u64;
            if !halt && elapsed_ms > limit_ms {
                warn!(
                    execution_id = %ctx.execution_id,
                    elapsed_ms,
                    limit_ms,
                    "Workflow execution timed out"
                );
                record.error = Some(MaestroError::WorkflowTimeout { elapsed_ms, limit_ms }.to_string());
                halt = true;
            }

            record.output = ctx.variables.clone();
            record.execution_time_ms = elapsed_ms;
            self.tracker.update(&mut record).await;

            if halt {
                break;
            }
        }

        record.success = !record.completed_steps.is_empty() && record.error.is_none();
        record.output = ctx.variables.clone();
        record.execution_time_ms = ctx.elapsed().as_millis() as u64;
        record.finished_at = Some(Utc::now());
        self.tracker.update(&mut record).await;

        info!(
            execution_id = %record.execution_id,
            workflow_id = %record.workflow_id,
            success = record.success,
            completed = record.completed_steps.len(),
            elapsed_ms = record.execution_time_ms,
            "Workflow execution finished"
        );
        self.event_bus.publish(WorkflowEvent::RunCompleted {
            execution_id: record.execution_id.clone(),
            success: record.success,
            elapsed_ms: record.execution_time_ms,
        });

        Ok(record)
    }

    /// Run the configured fallback steps after `failed` exhausted its retries.
    /// Conditions are not evaluated here. Unknown ids are skipped and the first
    /// failing fallback ends the sequence.
    async fn run_fallbacks(
        &self,
        workflow: &WorkflowDefinition,
        failed: &WorkflowStep,
        fallback_ids: &[String],
        ctx: &mut ExecutionContext,
        record: &mut WorkflowExecutionResult,
    ) {
        info!(
            execution_id = %ctx.execution_id,
            failed_step = %failed.id,
            fallbacks = fallback_ids.len(),
            "Running fallback steps"
        );
        self.event_bus.publish(WorkflowEvent::FallbackStarted {
            execution_id: ctx.execution_id.clone(),
            failed_step: failed.id.clone(),
            fallback_steps: fallback_ids.to_vec(),
        });

        for id in fallback_ids {
            let Some(step) = workflow.step(id) else {
                warn!(execution_id = %ctx.execution_id, fallback = %id, "Fallback step not found, skipping");
                continue;
            };
            ctx.current_step = Some(step.id.clone());
            let outcome = self.steps.run(step, ctx).await;
            let abandon = outcome.is_err();
            match outcome {
                Ok(result) => self.record_success(step, result, ctx, record),
                Err(e) => {
                    warn!(
                        execution_id = %ctx.execution_id,
                        step_id = %step.id,
                        error = %e,
                        "Fallback step failed, abandoning fallbacks"
                    );
                    self.event_bus.publish(WorkflowEvent::StepFailed {
                        execution_id: ctx.execution_id.clone(),
                        step_id: step.id.clone(),
                        error: e.to_string(),
                    });
                }
            }

            record.output = ctx.variables.clone();
            record.execution_time_ms = ctx.elapsed().as_millis() as u64;
            self.tracker.update(record).await;
            if abandon {
                break;
            }
        }
    }

    fn record_success(
        &self,
        step: &WorkflowStep,
        result: AgentExecutionResult,
        ctx: &mut ExecutionContext,
        record: &mut WorkflowExecutionResult,
    ) {
        if result.response.success {
            let written = mapper::apply_output_mapping(step, &result.response.data, ctx);
            if !written.is_empty() {
                debug!(execution_id = %ctx.execution_id, step_id = %step.id, ?written, "Output mapped");
            }
        }

        debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            agent_success = result.response.success,
            elapsed_ms = result.execution_time_ms,
            "Step completed"
        );
        self.event_bus.publish(WorkflowEvent::StepCompleted {
            execution_id: ctx.execution_id.clone(),
            step_id: step.id.clone(),
            elapsed_ms: result.execution_time_ms,
        });

        record.completed_steps.push(step.id.clone());
        record.step_results.insert(step.id.clone(), result.clone());
        ctx.record_result(step.id.clone(), result);
    }

    fn record_failure(
        &self,
        step: &WorkflowStep,
        err: &MaestroError,
        ctx: &ExecutionContext,
        record: &mut WorkflowExecutionResult,
    ) {
        warn!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            agent_id = %step.agent_id,
            error = %err,
            "Step failed"
        );
        self.event_bus.publish(WorkflowEvent::StepFailed {
            execution_id: ctx.execution_id.clone(),
            step_id: step.id.clone(),
            error: err.to_string(),
        });
        record.failed_step = Some(step.id.clone());
        record.error = Some(err.to_string());
    }

    /// Latest tracked state of a run, `None` for unknown or evicted ids.
    pub async fn get_workflow_status(&self, execution_id: &ExecutionId) -> Option<WorkflowExecutionResult> {
        self.tracker.get(execution_id).await
    }

    /// Mark a run as cancelled. Steps still run to completion; only the
    /// tracked status changes.
    pub async fn cancel_workflow(&self, execution_id: &ExecutionId) -> bool {
        let cancelled = self.tracker.cancel(execution_id).await;
        if cancelled {
            self.event_bus.publish(WorkflowEvent::RunCancelled {
                execution_id: execution_id.clone(),
            });
        }
        cancelled
    }

    pub async fn get_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.list().await
    }

    pub async fn get_agents(&self) -> Vec<String> {
        self.agents.ids().await
    }

    /// Evict finished runs older than `max_age`. Returns how many were removed.
    pub async fn clear_completed_executions(&self, max_age: Duration) -> usize {
        self.tracker.clear_completed(max_age).await
    }

    /// Start the periodic eviction task with the configured interval and age.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sweeper = ExecutionSweeper::new(
            self.tracker.clone(),
            self.config.cleanup_interval(),
            self.config.execution_max_age(),
            cancel,
        );
        tokio::spawn(async move { sweeper.run().await })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::workflow::{ErrorHandlingPolicy, RetryPolicy};
    use maestro_test_utils::{EchoAgent, FailingAgent, StaticAgent};
    use serde_json::json;

    fn ctx() -> AgentContext {
        AgentContext::new("session", "corr")
    }

    async fn engine() -> WorkflowEngine {
        let engine = WorkflowEngine::new(EngineConfig::default());
        engine
            .register_agent("reply", Arc::new(StaticAgent::new("reply", json!({"x": 5}))))
            .await;
        engine
            .register_agent("broken", Arc::new(FailingAgent::new("broken", "model unavailable")))
            .await;
        engine
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy::none()
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_an_error() {
        let engine = engine().await;
        let err = engine
            .execute_workflow("missing", Variables::new(), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::WorkflowNotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_stop_halts_at_first_failure() {
        let engine = engine().await;
        let wf = WorkflowDefinition::new("wf", "stop", "1")
            .with_step(WorkflowStep::new("a", "A", "reply"))
            .with_step(WorkflowStep::new("b", "B", "broken").with_retry(no_retry()))
            .with_step(WorkflowStep::new("c", "C", "reply"))
            .with_error_handling(ErrorHandlingPolicy::new(OnError::Stop));
        engine.register_workflow(wf).await.unwrap();

        let result = engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.completed_steps, vec!["a"]);
        assert_eq!(result.failed_step.as_deref(), Some("b"));
        assert!(result.error.unwrap().contains("model unavailable"));
        assert!(result.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_continue_runs_remaining_steps() {
        let engine = engine().await;
        for on_error in [OnError::Continue, OnError::Retry] {
            let wf = WorkflowDefinition::new("wf", "continue", "1")
                .with_step(WorkflowStep::new("a", "A", "broken").with_retry(no_retry()))
                .with_step(WorkflowStep::new("b", "B", "reply"))
                .with_error_handling(ErrorHandlingPolicy::new(on_error));
            engine.register_workflow(wf).await.unwrap();

            let result = engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();
            assert_eq!(result.completed_steps, vec!["b"]);
            assert_eq!(result.failed_step.as_deref(), Some("a"));
            assert!(!result.success);
        }
    }

    #[tokio::test]
    async fn test_missing_agent_fails_step() {
        let engine = engine().await;
        let wf = WorkflowDefinition::new("wf", "ghost", "1")
            .with_step(WorkflowStep::new("a", "A", "ghost"))
            .with_step(WorkflowStep::new("b", "B", "reply"));
        engine.register_workflow(wf).await.unwrap();

        let result = engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();
        assert_eq!(result.failed_step.as_deref(), Some("a"));
        assert!(result.error.unwrap().contains("ghost"));
        assert_eq!(result.completed_steps, vec!["b"]);
    }

    #[tokio::test]
    async fn test_fallback_steps_run_in_declared_sequence() {
        let engine = engine().await;
        let wf = WorkflowDefinition::new("wf", "fallback", "1")
            .with_step(WorkflowStep::new("primary", "Primary", "reply"))
            .with_step(WorkflowStep::new("recover", "Recover", "reply"))
            .with_error_handling(
                ErrorHandlingPolicy::new(OnError::Fallback).with_fallback_steps(vec!["recover".into()]),
            );
        engine.register_workflow(wf).await.unwrap();

        let result = engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.completed_steps, vec!["primary", "recover"]);
    }

    #[tokio::test]
    async fn test_fallback_output_mapping_applies() {
        let engine = engine().await;
        let wf = WorkflowDefinition::new("wf", "fallback", "1")
            .with_step(WorkflowStep::new("primary", "Primary", "broken").with_retry(no_retry()))
            .with_step(
                WorkflowStep::new("recover", "Recover", "reply")
                    .with_condition("${recovering}")
                    .map_output("data.x", "recovered"),
            )
            .with_error_handling(
                ErrorHandlingPolicy::new(OnError::Fallback)
                    .with_fallback_steps(vec!["nowhere".into(), "recover".into()]),
            );
        engine.register_workflow(wf).await.unwrap();

        let result = engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();
        assert_eq!(result.completed_steps, vec!["recover"]);
        assert_eq!(result.output.get("recovered"), Some(&json!(5)));
        assert_eq!(result.failed_step.as_deref(), Some("primary"));
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_failing_fallback_ends_chain() {
        let engine = engine().await;
        let later = Arc::new(StaticAgent::new("later", json!({"ok": true})));
        engine.register_agent("later", later.clone()).await;
        let wf = WorkflowDefinition::new("wf", "fallback", "1")
            .with_step(WorkflowStep::new("primary", "Primary", "broken").with_retry(no_retry()))
            .with_step(
                WorkflowStep::new("fb1", "First", "broken")
                    .with_retry(no_retry())
                    .with_condition("${recovering}"),
            )
            .with_step(WorkflowStep::new("fb2", "Second", "later").with_condition("${recovering}"))
            .with_error_handling(
                ErrorHandlingPolicy::new(OnError::Fallback)
                    .with_fallback_steps(vec!["fb1".into(), "fb2".into()]),
            );
        engine.register_workflow(wf).await.unwrap();

        let result = engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();
        assert_eq!(later.calls.count(), 0);
        assert!(result.completed_steps.is_empty());
        assert_eq!(result.failed_step.as_deref(), Some("primary"));
        assert!(!result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_progress_visible_mid_chain() {
        let engine = Arc::new(engine().await);
        engine
            .register_agent(
                "slow",
                Arc::new(EchoAgent::new("slow").with_delay(Duration::from_secs(10))),
            )
            .await;
        let wf = WorkflowDefinition::new("wf", "fallback", "1")
            .with_step(WorkflowStep::new("primary", "Primary", "broken").with_retry(no_retry()))
            .with_step(WorkflowStep::new("fb1", "First", "reply").with_condition("${recovering}"))
            .with_step(WorkflowStep::new("fb2", "Second", "slow").with_condition("${recovering}"))
            .with_error_handling(
                ErrorHandlingPolicy::new(OnError::Fallback)
                    .with_fallback_steps(vec!["fb1".into(), "fb2".into()]),
            );
        engine.register_workflow(wf).await.unwrap();
        let mut rx = engine.subscribe();

        let runner = engine.clone();
        let handle =
            tokio::spawn(async move { runner.execute_workflow("wf", Variables::new(), ctx()).await });

        let mut execution_id = None;
        loop {
            match rx.recv().await.unwrap() {
                WorkflowEvent::RunStarted { execution_id: id, .. } => execution_id = Some(id),
                WorkflowEvent::StepCompleted { ref step_id, .. } if step_id == "fb1" => break,
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let status = engine
            .get_workflow_status(&execution_id.unwrap())
            .await
            .unwrap();
        assert_eq!(status.completed_steps, vec!["fb1"]);
        assert_eq!(status.failed_step.as_deref(), Some("primary"));
        assert!(status.finished_at.is_none());

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.completed_steps, vec!["fb1", "fb2"]);
    }

    #[tokio::test]
    async fn test_empty_workflow_is_not_successful() {
        let engine = engine().await;
        engine
            .register_workflow(WorkflowDefinition::new("empty", "Empty", "1"))
            .await
            .unwrap();
        let result = engine.execute_workflow("empty", Variables::new(), ctx()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_none());
        assert!(result.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_events_for_successful_run() {
        let engine = engine().await;
        let wf = WorkflowDefinition::new("wf", "events", "1")
            .with_step(WorkflowStep::new("a", "A", "reply"))
            .with_step(WorkflowStep::new("b", "B", "reply").with_condition("${nothing}"));
        engine.register_workflow(wf).await.unwrap();
        let mut rx = engine.subscribe();

        engine.execute_workflow("wf", Variables::new(), ctx()).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), WorkflowEvent::RunStarted { .. }));
        assert!(matches!(rx.try_recv().unwrap(), WorkflowEvent::StepCompleted { ref step_id, .. } if step_id == "a"));
        assert!(matches!(rx.try_recv().unwrap(), WorkflowEvent::StepSkipped { ref step_id, .. } if step_id == "b"));
        assert!(matches!(rx.try_recv().unwrap(), WorkflowEvent::RunCompleted { success: true, .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        let engine = engine().await;
        let id = ExecutionId::new();
        assert!(!engine.cancel_workflow(&id).await);
        assert!(engine.get_workflow_status(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_agents_sorted() {
        let engine = engine().await;
        assert_eq!(engine.get_agents().await, vec!["broken", "reply"]);
    }
}

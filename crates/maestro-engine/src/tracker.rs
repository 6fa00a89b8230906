use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use maestro_core::error::MaestroError;
use maestro_core::types::{ExecutionId, WorkflowExecutionResult};

/// In-memory store of run records, keyed by execution id.
#[derive(Default)]
pub struct ExecutionTracker {
    runs: RwLock<HashMap<ExecutionId, WorkflowExecutionResult>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: WorkflowExecutionResult) {
        self.runs
            .write()
            .await
            .insert(record.execution_id.clone(), record);
    }

    /// Store the latest state of a run.
    ///
    /// A cancellation recorded since the last update is folded back into
    /// `record`, so the caller's copy stays cancelled too.
    pub async fn update(&self, record: &mut WorkflowExecutionResult) {
        let mut runs = self.runs.write().await;
        if runs
            .get(&record.execution_id)
            .is_some_and(|stored| stored.cancelled)
        {
            mark_cancelled(record);
        }
        record.updated_at = Utc::now();
        runs.insert(record.execution_id.clone(), record.clone());
    }

    pub async fn get(&self, execution_id: &ExecutionId) -> Option<WorkflowExecutionResult> {
        self.runs.read().await.get(execution_id).cloned()
    }

    /// Flag a run as cancelled. Returns `false` for unknown ids.
    ///
    /// Only the record changes; a step that is currently running is not
    /// interrupted.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> bool {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(execution_id) else {
            return false;
        };
        mark_cancelled(record);
        record.updated_at = Utc::now();
        info!(execution_id = %execution_id, "Execution cancelled");
        true
    }

    /// Evict finished runs last updated at least `max_age` ago.
    pub async fn clear_completed(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, record| !(record.is_finished() && record.updated_at <= cutoff));
        let evicted = before - runs.len();
        if evicted > 0 {
            debug!(evicted, remaining = runs.len(), "Cleared completed executions");
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

fn mark_cancelled(record: &mut WorkflowExecutionResult) {
    record.cancelled = true;
    record.success = false;
    record.error = Some(MaestroError::Cancelled.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> WorkflowExecutionResult {
        WorkflowExecutionResult::new("wf", ExecutionId::new())
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let tracker = ExecutionTracker::new();
        let id = ExecutionId::new();
        assert!(tracker.get(&id).await.is_none());
        assert!(!tracker.cancel(&id).await);
    }

    #[tokio::test]
    async fn test_cancel_is_sticky_across_updates() {
        let tracker = ExecutionTracker::new();
        let mut rec = record();
        let id = rec.execution_id.clone();
        tracker.insert(rec.clone()).await;

        assert!(tracker.cancel(&id).await);

        rec.completed_steps.push("a".into());
        rec.success = true;
        tracker.update(&mut rec).await;

        assert!(rec.cancelled);
        assert!(!rec.success);
        let stored = tracker.get(&id).await.unwrap();
        assert!(stored.cancelled);
        assert_eq!(stored.error.as_deref(), Some("Workflow cancelled by user"));
        assert_eq!(stored.completed_steps, vec!["a"]);
    }

    #[tokio::test]
    async fn test_clear_only_finished() {
        let tracker = ExecutionTracker::new();
        let running = record();
        let mut done = record();
        done.finished_at = Some(Utc::now());
        tracker.insert(running.clone()).await;
        tracker.insert(done.clone()).await;

        assert_eq!(tracker.clear_completed(Duration::from_secs(3600)).await, 0);
        assert_eq!(tracker.clear_completed(Duration::ZERO).await, 1);
        assert_eq!(tracker.len().await, 1);
        assert!(tracker.get(&running.execution_id).await.is_some());
        assert!(tracker.get(&done.execution_id).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_with_huge_age_keeps_everything() {
        let tracker = ExecutionTracker::new();
        let mut done = record();
        done.finished_at = Some(Utc::now());
        tracker.insert(done).await;
        assert_eq!(tracker.clear_completed(Duration::MAX).await, 0);
        assert!(!tracker.is_empty().await);
    }
}

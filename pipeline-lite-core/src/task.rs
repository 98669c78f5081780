//! Task queue for TASK-mode steps.
//!
//! A TASK step hands a unit of work to a delegate executor and parks until
//! the executor reports a [`TaskResult`]. The engine only queues tasks and
//! delivers their results; who polls and runs them is up to the deployment.

use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedTaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Expired,
}

impl QueuedTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: CorrelationId,
    pub plan_execution_id: Uuid,
    pub node_execution_id: Uuid,
    pub task_type: String,
    pub payload: Value,
    pub status: QueuedTaskStatus,
    pub created_at: Timestamp,
    pub claimed_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
}

impl QueuedTask {
    pub fn new(
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        task_type: &str,
        payload: Value,
        timeout_secs: u64,
    ) -> Self {
        let created_at = now();
        Self {
            task_id: format!("task-{}", Uuid::now_v7()),
            plan_execution_id,
            node_execution_id,
            task_type: task_type.to_string(),
            payload,
            status: QueuedTaskStatus::Pending,
            created_at,
            claimed_at: None,
            expires_at: Some(created_at + chrono::Duration::seconds(timeout_secs as i64)),
        }
    }

    pub fn is_overdue(&self, at: Timestamp) -> bool {
        !self.status.is_terminal() && self.expires_at.is_some_and(|exp| at > exp)
    }
}

/// Delegate executor interface for TASK mode.
///
/// `complete`, `fail` and `expire_overdue` return the results the engine
/// should deliver; a task that already reached a terminal state yields
/// nothing, so repeated reports are harmless.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn queue_task(&self, task: QueuedTask) -> Result<CorrelationId>;

    /// Claim up to `max` pending tasks of the given types, oldest first.
    async fn poll(&self, task_types: &[String], max: usize) -> Result<Vec<QueuedTask>>;

    async fn load(&self, task_id: &str) -> Result<Option<QueuedTask>>;

    async fn complete(&self, task_id: &str, payload: Option<Value>) -> Result<Option<TaskResult>>;

    async fn fail(&self, task_id: &str, error: &str) -> Result<Option<TaskResult>>;

    async fn expire_overdue(&self, at: Timestamp) -> Result<Vec<TaskResult>>;
}

#[derive(Default)]
struct QueueInner {
    tasks: BTreeMap<CorrelationId, QueuedTask>,
    order: VecDeque<CorrelationId>,
}

/// In-memory task queue.
pub struct MemoryTaskQueue {
    inner: Mutex<QueueInner>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
        }
    }

    fn finish(
        &self,
        task_id: &str,
        status: QueuedTaskStatus,
        payload: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<TaskResult>> {
        let mut inner = self.inner.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Err(anyhow!("Unknown task {}", task_id));
        };
        if task.status.is_terminal() {
            tracing::warn!(task_id = %task_id, status = ?task.status, "Task already finished");
            return Ok(None);
        }
        task.status = status;
        inner.order.retain(|id| id != task_id);
        Ok(Some(TaskResult {
            task_id: task_id.to_string(),
            status: match status {
                QueuedTaskStatus::Expired => TaskStatus::Expired,
                QueuedTaskStatus::Failed => TaskStatus::Failed,
                _ => TaskStatus::Completed,
            },
            payload,
            error,
        }))
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for MemoryTaskQueue {
    async fn queue_task(&self, task: QueuedTask) -> Result<CorrelationId> {
        let mut inner = self.inner.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let task_id = task.task_id.clone();
        tracing::debug!(task_id = %task_id, task_type = %task.task_type, "Task queued");
        inner.order.push_back(task_id.clone());
        inner.tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    async fn poll(&self, task_types: &[String], max: usize) -> Result<Vec<QueuedTask>> {
        let mut inner = self.inner.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let QueueInner { tasks, order } = &mut *inner;
        let mut claimed = Vec::new();
        for id in order.iter() {
            if claimed.len() >= max {
                break;
            }
            if let Some(task) = tasks.get_mut(id) {
                if task.status == QueuedTaskStatus::Pending && task_types.contains(&task.task_type)
                {
                    task.status = QueuedTaskStatus::Claimed;
                    task.claimed_at = Some(now());
                    claimed.push(task.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn load(&self, task_id: &str) -> Result<Option<QueuedTask>> {
        let inner = self.inner.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.tasks.get(task_id).cloned())
    }

    async fn complete(&self, task_id: &str, payload: Option<Value>) -> Result<Option<TaskResult>> {
        self.finish(task_id, QueuedTaskStatus::Completed, payload, None)
    }

    async fn fail(&self, task_id: &str, error: &str) -> Result<Option<TaskResult>> {
        self.finish(task_id, QueuedTaskStatus::Failed, None, Some(error.to_string()))
    }

    async fn expire_overdue(&self, at: Timestamp) -> Result<Vec<TaskResult>> {
        let overdue: Vec<CorrelationId> = {
            let inner = self.inner.lock().map_err(|e| anyhow!("Lock: {}", e))?;
            inner
                .tasks
                .values()
                .filter(|t| t.is_overdue(at))
                .map(|t| t.task_id.clone())
                .collect()
        };
        let mut expired = Vec::new();
        for task_id in overdue {
            if let Some(result) = self.finish(
                &task_id,
                QueuedTaskStatus::Expired,
                None,
                Some(format!("task {} expired", task_id)),
            )? {
                expired.push(result);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(task_type: &str, timeout_secs: u64) -> QueuedTask {
        QueuedTask::new(Uuid::now_v7(), Uuid::now_v7(), task_type, json!({}), timeout_secs)
    }

    #[tokio::test]
    async fn test_poll_claims_matching_types_once() {
        let q = MemoryTaskQueue::new();
        q.queue_task(task("build", 60)).await.unwrap();
        q.queue_task(task("lint", 60)).await.unwrap();
        q.queue_task(task("build", 60)).await.unwrap();

        let claimed = q.poll(&["build".to_string()], 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(q.poll(&["build".to_string()], 10).await.unwrap().is_empty());
        assert_eq!(q.poll(&["lint".to_string()], 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_reports_once() {
        let q = MemoryTaskQueue::new();
        let id = q.queue_task(task("build", 60)).await.unwrap();
        let result = q.complete(&id, Some(json!({"ok": 1}))).await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert!(q.complete(&id, None).await.unwrap().is_none());
        assert!(q.fail(&id, "late").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let q = MemoryTaskQueue::new();
        let stale = q.queue_task(task("build", 0)).await.unwrap();
        q.queue_task(task("build", 3600)).await.unwrap();

        let expired = q
            .expire_overdue(now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, stale);
        assert_eq!(expired[0].status, TaskStatus::Expired);
    }

    #[tokio::test]
    async fn test_unknown_task_is_error() {
        let q = MemoryTaskQueue::new();
        assert!(q.complete("task-nope", None).await.is_err());
    }
}

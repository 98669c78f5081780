use crate::events::OrchestrationEvent;
use crate::execution::{NodeExecution, NodeExecutionUpdate, PlanExecution};
use crate::interrupt::Interrupt;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use uuid::Uuid;

/// Scope an outcome is published to. `None` is the plan execution root.
pub type OutcomeScope = Option<Uuid>;

/// Persistence trait for all pipeline state.
///
/// The engine operates exclusively through this trait. Every mutation of an
/// existing record is a find-by-id-with-expected-state update that returns
/// the updated record, or `None` when the filter rejected it.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ── Plan executions ──

    async fn save_plan_execution(&self, plan_execution: &PlanExecution) -> Result<()>;
    async fn load_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>>;

    /// Move a plan execution to `status` if its current status is in `expected`.
    async fn update_plan_status(
        &self,
        id: Uuid,
        status: Status,
        expected: &[Status],
    ) -> Result<Option<PlanExecution>>;

    /// Set (or clear) the retention deadline of a plan execution.
    async fn set_plan_retention(&self, id: Uuid, valid_until: Option<Timestamp>) -> Result<()>;

    // ── Node executions ──

    async fn save_node_execution(&self, node_execution: &NodeExecution) -> Result<()>;
    async fn load_node_execution(&self, id: Uuid) -> Result<Option<NodeExecution>>;
    async fn update_node_execution(
        &self,
        id: Uuid,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>>;

    async fn fetch_node_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>>;
    async fn fetch_children(
        &self,
        plan_execution_id: Uuid,
        parent_id: Uuid,
    ) -> Result<Vec<NodeExecution>>;
    async fn fetch_by_status(
        &self,
        plan_execution_id: Uuid,
        statuses: &[Status],
    ) -> Result<Vec<NodeExecution>>;

    /// Node executions that have not been superseded by a retry.
    async fn fetch_without_old_retries(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>> {
        let all = self.fetch_node_executions(plan_execution_id).await?;
        Ok(all.into_iter().filter(|ne| !ne.old_retry).collect())
    }

    /// All descendants of `parent_id` (children, grandchildren, ...) whose
    /// status is in `statuses`.
    async fn find_all_children_with_status_in(
        &self,
        plan_execution_id: Uuid,
        parent_id: Uuid,
        statuses: &[Status],
    ) -> Result<Vec<NodeExecution>> {
        let mut found = Vec::new();
        let mut frontier = VecDeque::from([parent_id]);
        while let Some(parent) = frontier.pop_front() {
            for child in self.fetch_children(plan_execution_id, parent).await? {
                frontier.push_back(child.id);
                if statuses.contains(&child.status) {
                    found.push(child);
                }
            }
        }
        Ok(found)
    }

    /// Flag a node execution as superseded by a retry.
    async fn mark_retried(&self, id: Uuid) -> Result<Option<NodeExecution>> {
        let update = NodeExecutionUpdate {
            old_retry: Some(true),
            ..Default::default()
        };
        self.update_node_execution(id, &update).await
    }

    /// Mark every QUEUED/RUNNING/WAITING node of a plan execution ERRORED.
    /// Returns the nodes that were actually changed.
    async fn error_out_active_nodes(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        let active = self
            .fetch_by_status(
                plan_execution_id,
                &[Status::Queued, Status::Running, Status::Waiting],
            )
            .await?;
        let mut changed = Vec::new();
        for ne in active {
            if let Some(updated) = self
                .update_node_execution(ne.id, &NodeExecutionUpdate::status(Status::Errored))
                .await?
            {
                changed.push(updated);
            }
        }
        Ok(changed)
    }

    // ── Outcomes ──

    async fn save_outcome(
        &self,
        plan_execution_id: Uuid,
        scope: OutcomeScope,
        name: &str,
        outcome: &Outcome,
    ) -> Result<()>;

    /// First outcome named `name` found in `scopes` (searched in order).
    async fn find_outcome(
        &self,
        plan_execution_id: Uuid,
        scopes: &[OutcomeScope],
        name: &str,
    ) -> Result<Option<Outcome>>;

    // ── Interrupts ──

    async fn save_interrupt(&self, interrupt: &Interrupt) -> Result<()>;
    async fn load_interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>>;
    async fn load_pending_interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>> {
        let all = self.load_interrupts(plan_execution_id).await?;
        Ok(all.into_iter().filter(|i| !i.processed).collect())
    }

    /// Compare-and-set the processed flag. Returns `true` only for the caller
    /// that flipped it.
    async fn mark_interrupt_processed(&self, plan_execution_id: Uuid, id: Uuid) -> Result<bool>;

    // ── Event log (append-only) ──

    /// Append an event and return its sequence number.
    async fn append_event(
        &self,
        plan_execution_id: Uuid,
        event: &OrchestrationEvent,
    ) -> Result<u64>;
    async fn read_events(
        &self,
        plan_execution_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, OrchestrationEvent)>>;

    // ── Dedupe cache (protocol replies) ──

    /// Cached reply for `key`, unless it expired.
    async fn dedupe_get(&self, key: &str) -> Result<Option<Value>>;
    async fn dedupe_put(&self, key: &str, reply: &Value, valid_until: Timestamp) -> Result<()>;

    // ── Retention ──

    /// Delete every record of terminal plan executions whose retention has
    /// lapsed, along with expired dedupe entries. Returns the number of plan
    /// executions purged.
    async fn purge_expired(&self, now: Timestamp) -> Result<usize>;
}

//! Interrupts: out-of-band pause/abort/retry/resume signals.
//!
//! Interrupts are persisted per plan execution and consumed exactly once via
//! the store's compare-and-set on the processed flag. The checkpoint in
//! [`InterruptService::check_before_node_start`] runs before every
//! QUEUED → RUNNING transition.

use crate::error::EngineError;
use crate::events::OrchestrationEvent;
use crate::execution::NodeExecution;
use crate::store::ExecutionStore;
use crate::types::*;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Pause,
    Resume,
    Abort,
    Retry,
}

impl InterruptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Abort => "ABORT",
            Self::Retry => "RETRY",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: Uuid,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: Uuid,
    pub node_execution_id: Option<Uuid>,
    pub created_by: String,
    pub created_at: Timestamp,
    pub processed: bool,
    pub processed_at: Option<Timestamp>,
}

impl Interrupt {
    pub fn new(
        interrupt_type: InterruptType,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        created_by: &str,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            interrupt_type,
            plan_execution_id,
            node_execution_id,
            created_by: created_by.to_string(),
            created_at: now(),
            processed: false,
            processed_at: None,
        }
    }

    pub fn is_plan_wide(&self) -> bool {
        self.node_execution_id.is_none()
    }
}

/// Outcome of the pre-start checkpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointDecision {
    Proceed,
    /// Node must end ABORTED without invoking its step.
    Abort { reason: String },
    /// Plan is paused; the node stays QUEUED and is parked.
    Pause,
}

pub struct InterruptService {
    store: Arc<dyn ExecutionStore>,
    /// Node executions left QUEUED by a pause, waiting for a resume, keyed to
    /// their plan execution.
    parked: Mutex<HashMap<Uuid, Uuid>>,
}

impl InterruptService {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a new interrupt and record it in the event log.
    pub async fn register(&self, interrupt: &Interrupt) -> Result<()> {
        self.store.save_interrupt(interrupt).await?;
        self.store
            .append_event(
                interrupt.plan_execution_id,
                &OrchestrationEvent::InterruptRegistered {
                    interrupt_id: interrupt.id,
                    interrupt_type: interrupt.interrupt_type.as_str().to_string(),
                    node_execution_id: interrupt.node_execution_id,
                },
            )
            .await?;
        tracing::info!(
            plan_execution_id = %interrupt.plan_execution_id,
            interrupt_id = %interrupt.id,
            interrupt_type = interrupt.interrupt_type.as_str(),
            "Interrupt registered"
        );
        Ok(())
    }

    /// Consume an interrupt. Returns `false` when someone else already did.
    pub async fn mark_processed(&self, interrupt: &Interrupt) -> Result<bool> {
        let won = self
            .store
            .mark_interrupt_processed(interrupt.plan_execution_id, interrupt.id)
            .await?;
        if won {
            self.store
                .append_event(
                    interrupt.plan_execution_id,
                    &OrchestrationEvent::InterruptProcessed {
                        interrupt_id: interrupt.id,
                        node_execution_id: interrupt.node_execution_id,
                    },
                )
                .await?;
        } else {
            tracing::warn!(
                interrupt_id = %interrupt.id,
                "Interrupt already processed"
            );
        }
        Ok(won)
    }

    pub async fn pending(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>> {
        self.store.load_pending_interrupts(plan_execution_id).await
    }

    /// Decide whether `node_execution` may move from QUEUED to RUNNING.
    pub async fn check_before_node_start(
        &self,
        node_execution: &NodeExecution,
    ) -> Result<CheckpointDecision> {
        let plan = self
            .store
            .load_plan_execution(node_execution.plan_execution_id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(
                node_execution.plan_execution_id,
            ))?;

        if plan.is_finished() {
            return Ok(CheckpointDecision::Abort {
                reason: format!("plan execution is {}", plan.status),
            });
        }

        if let Some(interrupt) = self.take_node_abort(plan.id, node_execution.id).await? {
            return Ok(CheckpointDecision::Abort {
                reason: format!("aborted by {}", interrupt.created_by),
            });
        }

        if plan.status == Status::Paused {
            return Ok(CheckpointDecision::Pause);
        }
        Ok(CheckpointDecision::Proceed)
    }

    /// Consume the pending ABORT aimed at one node, if any. `None` also when
    /// a concurrent checkpoint consumed it first.
    pub async fn take_node_abort(
        &self,
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
    ) -> Result<Option<Interrupt>> {
        let targeted = self
            .pending(plan_execution_id)
            .await?
            .into_iter()
            .find(|i| {
                i.interrupt_type == InterruptType::Abort
                    && i.node_execution_id == Some(node_execution_id)
            });
        match targeted {
            Some(interrupt) if self.mark_processed(&interrupt).await? => Ok(Some(interrupt)),
            _ => Ok(None),
        }
    }

    // ── Parked nodes ──

    pub fn park(&self, node_execution_id: Uuid, plan_execution_id: Uuid) -> Result<()> {
        let mut parked = self.parked.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        parked.insert(node_execution_id, plan_execution_id);
        Ok(())
    }

    /// Remove one parked node. `true` means the caller now owns its dispatch.
    pub fn unpark(&self, node_execution_id: Uuid) -> Result<bool> {
        let mut parked = self.parked.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(parked.remove(&node_execution_id).is_some())
    }

    /// Drop every parked node of an ended plan execution.
    pub fn forget_plan(&self, plan_execution_id: Uuid) -> Result<usize> {
        let mut parked = self.parked.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let before = parked.len();
        parked.retain(|_, plan| *plan != plan_execution_id);
        Ok(before - parked.len())
    }

    pub fn parked_count(&self) -> Result<usize> {
        Ok(self.parked.lock().map_err(|e| anyhow!("Lock: {}", e))?.len())
    }

    /// Remove and return every parked node of a plan execution.
    pub async fn drain_parked(&self, plan_execution_id: Uuid) -> Result<Vec<Uuid>> {
        let queued: HashSet<Uuid> = self
            .store
            .fetch_by_status(plan_execution_id, &[Status::Queued])
            .await?
            .into_iter()
            .map(|ne| ne.id)
            .collect();
        let mut parked = self.parked.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let drained: Vec<Uuid> = parked
            .iter()
            .filter(|(id, plan)| **plan == plan_execution_id && queued.contains(id))
            .map(|(id, _)| *id)
            .collect();
        for id in &drained {
            parked.remove(id);
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use crate::execution::PlanExecution;
    use crate::plan::{Plan, PlanNode, StepType};
    use crate::store_memory::MemoryStore;
    use std::collections::BTreeMap;

    async fn setup() -> (Arc<MemoryStore>, InterruptService, PlanExecution, NodeExecution) {
        let store = Arc::new(MemoryStore::new());
        let node = PlanNode::new("a", StepType::new("noop"));
        let plan = PlanExecution::new(Plan::new("a", vec![node.clone()]), BTreeMap::new(), "t");
        store.save_plan_execution(&plan).await.unwrap();
        let id = Uuid::now_v7();
        let amb = Ambiance::new(plan.id, BTreeMap::new()).with_level(Level {
            runtime_id: id,
            setup_id: "a".into(),
            identifier: "a".into(),
            step_type: "noop".into(),
            group: None,
        });
        let ne = NodeExecution::queued(id, &amb, &node);
        store.save_node_execution(&ne).await.unwrap();
        let service = InterruptService::new(store.clone());
        (store, service, plan, ne)
    }

    #[tokio::test]
    async fn test_proceed_without_interrupts() {
        let (_store, service, _plan, ne) = setup().await;
        assert_eq!(
            service.check_before_node_start(&ne).await.unwrap(),
            CheckpointDecision::Proceed
        );
    }

    #[tokio::test]
    async fn test_targeted_abort_consumed_once() {
        let (_store, service, plan, ne) = setup().await;
        let interrupt = Interrupt::new(InterruptType::Abort, plan.id, Some(ne.id), "ops");
        service.register(&interrupt).await.unwrap();

        let first = service.check_before_node_start(&ne).await.unwrap();
        assert!(matches!(first, CheckpointDecision::Abort { .. }));
        assert!(service.pending(plan.id).await.unwrap().is_empty());
        assert_eq!(
            service.check_before_node_start(&ne).await.unwrap(),
            CheckpointDecision::Proceed
        );
    }

    #[tokio::test]
    async fn test_paused_plan_parks_node() {
        let (store, service, plan, ne) = setup().await;
        store
            .update_plan_status(plan.id, Status::Paused, &[Status::Running])
            .await
            .unwrap();
        assert_eq!(
            service.check_before_node_start(&ne).await.unwrap(),
            CheckpointDecision::Pause
        );
        service.park(ne.id, plan.id).unwrap();
        assert_eq!(service.drain_parked(plan.id).await.unwrap(), vec![ne.id]);
        assert!(!service.unpark(ne.id).unwrap());
    }

    #[tokio::test]
    async fn test_forget_plan_drops_only_its_parked_nodes() {
        let (_store, service, plan, ne) = setup().await;
        let other = Uuid::now_v7();
        service.park(ne.id, plan.id).unwrap();
        service.park(other, Uuid::now_v7()).unwrap();

        assert_eq!(service.forget_plan(plan.id).unwrap(), 1);
        assert_eq!(service.parked_count().unwrap(), 1);
        assert!(!service.unpark(ne.id).unwrap());
        assert!(service.unpark(other).unwrap());
    }

    #[tokio::test]
    async fn test_node_abort_taken_once() {
        let (_store, service, plan, ne) = setup().await;
        assert!(service.take_node_abort(plan.id, ne.id).await.unwrap().is_none());

        let interrupt = Interrupt::new(InterruptType::Abort, plan.id, Some(ne.id), "ops");
        service.register(&interrupt).await.unwrap();
        let taken = service.take_node_abort(plan.id, ne.id).await.unwrap();
        assert_eq!(taken.map(|i| i.id), Some(interrupt.id));
        assert!(service.take_node_abort(plan.id, ne.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_plan_aborts_node() {
        let (store, service, plan, ne) = setup().await;
        store
            .update_plan_status(plan.id, Status::Aborted, &[Status::Running])
            .await
            .unwrap();
        assert!(matches!(
            service.check_before_node_start(&ne).await.unwrap(),
            CheckpointDecision::Abort { .. }
        ));
    }
}

use crate::events::OrchestrationEvent;
use crate::execution::{NodeExecution, NodeExecutionUpdate, PlanExecution};
use crate::interrupt::Interrupt;
use crate::store::{ExecutionStore, OutcomeScope};
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

type OutcomeKey = (Uuid, OutcomeScope, String);

#[derive(Default)]
struct Inner {
    plans: HashMap<Uuid, PlanExecution>,
    nodes: HashMap<Uuid, NodeExecution>,
    outcomes: HashMap<OutcomeKey, Outcome>,
    interrupts: HashMap<Uuid, Vec<Interrupt>>,
    events: HashMap<Uuid, Vec<(u64, OrchestrationEvent)>>,
    dedupe: HashMap<String, (Value, Timestamp)>,
}

/// In-memory ExecutionStore for tests and single-process deployments.
///
/// One lock guards all tables, so every filtered update is atomic with
/// respect to every other store call.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut nodes: Vec<NodeExecution>) -> Vec<NodeExecution> {
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    nodes
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    // ── Plan executions ──

    async fn save_plan_execution(&self, plan_execution: &PlanExecution) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner.plans.insert(plan_execution.id, plan_execution.clone());
        Ok(())
    }

    async fn load_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.plans.get(&id).cloned())
    }

    async fn update_plan_status(
        &self,
        id: Uuid,
        status: Status,
        expected: &[Status],
    ) -> Result<Option<PlanExecution>> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let Some(plan) = inner.plans.get_mut(&id) else {
            return Ok(None);
        };
        if !expected.contains(&plan.status) {
            return Ok(None);
        }
        let now = now();
        plan.status = status;
        plan.last_updated_at = now;
        plan.ended_at = if plan.is_finished() { Some(now) } else { None };
        Ok(Some(plan.clone()))
    }

    async fn set_plan_retention(&self, id: Uuid, valid_until: Option<Timestamp>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let plan = inner
            .plans
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Plan execution {} not found", id))?;
        plan.valid_until = valid_until;
        Ok(())
    }

    // ── Node executions ──

    async fn save_node_execution(&self, node_execution: &NodeExecution) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if inner.nodes.contains_key(&node_execution.id) {
            return Err(anyhow!(
                "Node execution {} already exists",
                node_execution.id
            ));
        }
        inner.nodes.insert(node_execution.id, node_execution.clone());
        Ok(())
    }

    async fn load_node_execution(&self, id: Uuid) -> Result<Option<NodeExecution>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner.nodes.get(&id).cloned())
    }

    async fn update_node_execution(
        &self,
        id: Uuid,
        update: &NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let Some(record) = inner.nodes.get_mut(&id) else {
            return Ok(None);
        };
        if update.apply(record) {
            Ok(Some(record.clone()))
        } else {
            Ok(None)
        }
    }

    async fn fetch_node_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(sorted(
            inner
                .nodes
                .values()
                .filter(|ne| ne.plan_execution_id == plan_execution_id)
                .cloned()
                .collect(),
        ))
    }

    async fn fetch_children(
        &self,
        plan_execution_id: Uuid,
        parent_id: Uuid,
    ) -> Result<Vec<NodeExecution>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(sorted(
            inner
                .nodes
                .values()
                .filter(|ne| {
                    ne.plan_execution_id == plan_execution_id && ne.parent_id == Some(parent_id)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn fetch_by_status(
        &self,
        plan_execution_id: Uuid,
        statuses: &[Status],
    ) -> Result<Vec<NodeExecution>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(sorted(
            inner
                .nodes
                .values()
                .filter(|ne| {
                    ne.plan_execution_id == plan_execution_id && statuses.contains(&ne.status)
                })
                .cloned()
                .collect(),
        ))
    }

    // ── Outcomes ──

    async fn save_outcome(
        &self,
        plan_execution_id: Uuid,
        scope: OutcomeScope,
        name: &str,
        outcome: &Outcome,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner
            .outcomes
            .insert((plan_execution_id, scope, name.to_string()), outcome.clone());
        Ok(())
    }

    async fn find_outcome(
        &self,
        plan_execution_id: Uuid,
        scopes: &[OutcomeScope],
        name: &str,
    ) -> Result<Option<Outcome>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(scopes.iter().find_map(|scope| {
            inner
                .outcomes
                .get(&(plan_execution_id, *scope, name.to_string()))
                .cloned()
        }))
    }

    // ── Interrupts ──

    async fn save_interrupt(&self, interrupt: &Interrupt) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner
            .interrupts
            .entry(interrupt.plan_execution_id)
            .or_default()
            .push(interrupt.clone());
        Ok(())
    }

    async fn load_interrupts(&self, plan_execution_id: Uuid) -> Result<Vec<Interrupt>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner
            .interrupts
            .get(&plan_execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_interrupt_processed(&self, plan_execution_id: Uuid, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let Some(interrupt) = inner
            .interrupts
            .get_mut(&plan_execution_id)
            .and_then(|list| list.iter_mut().find(|i| i.id == id))
        else {
            return Ok(false);
        };
        if interrupt.processed {
            return Ok(false);
        }
        interrupt.processed = true;
        interrupt.processed_at = Some(now());
        Ok(true)
    }

    // ── Event log ──

    async fn append_event(
        &self,
        plan_execution_id: Uuid,
        event: &OrchestrationEvent,
    ) -> Result<u64> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let log = inner.events.entry(plan_execution_id).or_default();
        let seq = log.len() as u64;
        log.push((seq, event.clone()));
        Ok(seq)
    }

    async fn read_events(
        &self,
        plan_execution_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, OrchestrationEvent)>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(inner
            .events
            .get(&plan_execution_id)
            .map(|log| {
                log.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── Dedupe ──

    async fn dedupe_get(&self, key: &str) -> Result<Option<Value>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let at = now();
        Ok(inner
            .dedupe
            .get(key)
            .filter(|(_, until)| *until > at)
            .map(|(reply, _)| reply.clone()))
    }

    async fn dedupe_put(&self, key: &str, reply: &Value, valid_until: Timestamp) -> Result<()> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        inner
            .dedupe
            .insert(key.to_string(), (reply.clone(), valid_until));
        Ok(())
    }

    // ── Retention ──

    async fn purge_expired(&self, now: Timestamp) -> Result<usize> {
        let mut inner = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let expired: Vec<Uuid> = inner
            .plans
            .values()
            .filter(|p| p.is_finished() && p.valid_until.is_some_and(|until| until <= now))
            .map(|p| p.id)
            .collect();
        for id in &expired {
            inner.plans.remove(id);
            inner.nodes.retain(|_, ne| ne.plan_execution_id != *id);
            inner.outcomes.retain(|(plan_id, _, _), _| plan_id != id);
            inner.interrupts.remove(id);
            inner.events.remove(id);
        }
        inner.dedupe.retain(|_, (_, until)| *until > now);
        Ok(expired.len())
    }
}

impl MemoryStore {
    /// Outcome names stored for a plan execution, with how many scopes hold each.
    pub fn outcome_names(&self, plan_execution_id: Uuid) -> Result<BTreeMap<String, usize>> {
        let inner = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut names = BTreeMap::new();
        for (plan_id, _, name) in inner.outcomes.keys() {
            if *plan_id == plan_execution_id {
                *names.entry(name.clone()).or_insert(0) += 1;
            }
        }
        Ok(names)
    }
}

//! Execution engine: the facilitation → invocation → response → advice loop.
//!
//! Every unit of work (starting a node, resuming it, handling a fired
//! callback) runs on its own tokio task, bounded by a semaphore. Suspension
//! is always persisted status plus a callback parked in the wait/notify
//! engine; the listener spawned by [`ExecutionEngine::spawn_listener`] turns
//! fired callbacks back into work.

use crate::adviser::{Advise, AdvisingEvent};
use crate::ambiance::{Ambiance, Level};
use crate::config::EngineConfig;
use crate::error::{failure_info_from, EngineError};
use crate::events::OrchestrationEvent;
use crate::execution::{ExecutableResponse, NodeExecution, NodeExecutionUpdate, PlanExecution};
use crate::expression::{ExpressionContext, ExpressionRenderer};
use crate::facilitator::{FacilitationRequest, FacilitatorResponse};
use crate::interrupt::{CheckpointDecision, Interrupt, InterruptService, InterruptType};
use crate::invoker::{invoker_for, InvokerPackage};
use crate::plan::{validate_plan, Plan, PlanNode, RefObject};
use crate::protocol::ModuleEvent;
use crate::registry::{Registries, StepBinding};
use crate::step::{StepInvocation, TaskRequest};
use crate::store::ExecutionStore;
use crate::task::{QueuedTask, TaskExecutor};
use crate::types::*;
use crate::waiter::{FiredCallback, NotifyCallback, WaitNotifyEngine};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ExecutionEngine {
    config: EngineConfig,
    store: Arc<dyn ExecutionStore>,
    registries: Registries,
    waiter: Arc<WaitNotifyEngine>,
    interrupts: InterruptService,
    tasks: Arc<dyn TaskExecutor>,
    renderer: ExpressionRenderer,
    permits: Arc<Semaphore>,
    /// Taken by the listener when it starts.
    notify_rx: Mutex<Option<mpsc::Receiver<FiredCallback>>>,
}

// ─── Dispatch permits ─────────────────────────────────────────

struct DispatchSlot {
    permits: Arc<Semaphore>,
    held: Option<OwnedSemaphorePermit>,
}

tokio::task_local! {
    /// Permit of the unit of work running on this task.
    static DISPATCH: RefCell<DispatchSlot>;
}

/// Await `work` with the current unit of work's dispatch permit released,
/// then take a permit again. Outside a unit of work `work` is just awaited.
pub(crate) async fn outside_dispatch<F: Future>(work: F) -> Result<F::Output> {
    let released = DISPATCH
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            drop(slot.held.take()?);
            Some(slot.permits.clone())
        })
        .ok()
        .flatten();
    let output = work.await;
    if let Some(permits) = released {
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("Dispatch permits closed: {}", e))?;
        let _ = DISPATCH.try_with(|slot| slot.borrow_mut().held = Some(permit));
    }
    Ok(output)
}

fn abort_reason(interrupt: &Interrupt) -> String {
    format!("aborted by {}", interrupt.created_by)
}

fn level_for(runtime_id: Uuid, node: &PlanNode) -> Level {
    Level {
        runtime_id,
        setup_id: node.id.clone(),
        identifier: node.identifier.clone(),
        step_type: node.step_type.name.clone(),
        group: node.step_type.group.clone(),
    }
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ExecutionStore>,
        registries: Registries,
        tasks: Arc<dyn TaskExecutor>,
    ) -> Result<Arc<Self>> {
        let (waiter, notify_rx) = WaitNotifyEngine::new(config.notify_channel_capacity);
        Ok(Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_dispatches.max(1))),
            interrupts: InterruptService::new(store.clone()),
            renderer: ExpressionRenderer::new()?,
            notify_rx: Mutex::new(Some(notify_rx)),
            config,
            store,
            registries,
            waiter,
            tasks,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    pub fn waiter(&self) -> &Arc<WaitNotifyEngine> {
        &self.waiter
    }

    pub fn tasks(&self) -> &Arc<dyn TaskExecutor> {
        &self.tasks
    }

    // ─── Plan executions ──────────────────────────────────────

    pub async fn start_execution(
        self: &Arc<Self>,
        plan: Plan,
        input_args: BTreeMap<String, Value>,
        created_by: &str,
    ) -> Result<PlanExecution> {
        let starting_node = plan
            .starting_node()
            .cloned()
            .ok_or(EngineError::NoStartingNode)?;

        if self.config.validate_plans {
            let errors = validate_plan(&plan, &self.registries);
            if !errors.is_empty() {
                let message = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(EngineError::InvalidPlan(message).into());
            }
        }

        let plan_execution = PlanExecution::new(plan, input_args, created_by);
        self.store.save_plan_execution(&plan_execution).await?;
        self.store
            .append_event(
                plan_execution.id,
                &OrchestrationEvent::PlanStarted {
                    plan_id: plan_execution.plan.id,
                    starting_node_id: starting_node.id.clone(),
                    created_by: created_by.to_string(),
                },
            )
            .await?;
        info!(
            plan_execution_id = %plan_execution.id,
            starting_node_id = %starting_node.id,
            created_by = %created_by,
            "Plan execution started"
        );

        let ambiance = Ambiance::new(plan_execution.id, plan_execution.input_args.clone());
        self.trigger_execution(&ambiance, &starting_node).await?;
        Ok(plan_execution)
    }

    pub async fn load_plan(&self, id: Uuid) -> Result<PlanExecution> {
        self.store
            .load_plan_execution(id)
            .await?
            .ok_or_else(|| EngineError::PlanExecutionNotFound(id).into())
    }

    pub async fn load_node(&self, id: Uuid) -> Result<NodeExecution> {
        self.store
            .load_node_execution(id)
            .await?
            .ok_or_else(|| EngineError::NodeExecutionNotFound(id).into())
    }

    /// Poll until the plan execution leaves RUNNING/PAUSED.
    pub async fn wait_until_finished(&self, id: Uuid, timeout: Duration) -> Result<PlanExecution> {
        tokio::time::timeout(timeout, self.poll_finished(id))
            .await
            .map_err(|_| anyhow!("Plan execution {} did not finish within {:?}", id, timeout))?
    }

    async fn poll_finished(&self, id: Uuid) -> Result<PlanExecution> {
        loop {
            let plan = self.load_plan(id).await?;
            if plan.is_finished() {
                return Ok(plan);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Force-end a plan execution: every active node and the plan itself
    /// end ERRORED. Returns how many nodes were errored out.
    pub async fn error_out(&self, plan_execution_id: Uuid) -> Result<usize> {
        let changed = self.store.error_out_active_nodes(plan_execution_id).await?;
        for ne in &changed {
            self.waiter.cancel_group(&ne.id.to_string())?;
            self.interrupts.unpark(ne.id)?;
        }
        self.store
            .append_event(
                plan_execution_id,
                &OrchestrationEvent::NodesErroredOut {
                    count: changed.len(),
                },
            )
            .await?;
        self.end_plan(plan_execution_id, Status::Errored).await?;
        warn!(
            plan_execution_id = %plan_execution_id,
            count = changed.len(),
            "Plan execution errored out"
        );
        Ok(changed.len())
    }

    /// Drop the records of finished plan executions past their retention,
    /// expired dedupe entries, and correlation ids settled longer ago than
    /// the node retention.
    pub async fn purge_expired(&self) -> Result<usize> {
        let at = now();
        let purged = self.store.purge_expired(at).await?;
        let pruned = self
            .waiter
            .prune_settled(at - self.config.node_retention())?;
        if purged > 0 || pruned > 0 {
            info!(count = purged, correlation_ids = pruned, "Purged expired plan executions");
        }
        Ok(purged)
    }

    fn retention_deadline(&self) -> Timestamp {
        now() + self.config.node_retention()
    }

    // ─── Triggering ───────────────────────────────────────────

    /// Queue `node` after whatever node `ambiance` currently addresses (or as
    /// the first node when it addresses none). Returns the new node
    /// execution id.
    pub async fn trigger_execution(
        self: &Arc<Self>,
        ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let previous = match ambiance.current_runtime_id() {
            Some(previous_id) => Some(self.load_node(previous_id).await?),
            None => None,
        };

        let ne = match &previous {
            Some(prev) => {
                let mut ne =
                    NodeExecution::queued(id, &ambiance.replace_current(level_for(id, node)), node);
                ne.previous_id = Some(prev.id);
                ne.parent_id = prev.parent_id;
                ne.notify_id = prev.notify_id.clone();
                ne
            }
            None => NodeExecution::queued(id, &ambiance.with_level(level_for(id, node)), node),
        };
        self.persist_queued(&ne).await?;

        if let Some(prev) = previous {
            let link = NodeExecutionUpdate {
                next_id: Some(id),
                ..Default::default()
            };
            self.store.update_node_execution(prev.id, &link).await?;
        }
        self.spawn_start(id);
        Ok(id)
    }

    /// Queue `child_node_id` one level below `parent_id`, reporting back on
    /// `notify_id`. A repeat with the same notify id returns the existing
    /// child.
    pub async fn queue_child_execution(
        self: &Arc<Self>,
        parent_id: Uuid,
        child_node_id: &str,
        notify_id: &str,
    ) -> Result<Uuid> {
        let parent = self.load_node(parent_id).await?;
        if let Some(existing) = self
            .store
            .fetch_children(parent.plan_execution_id, parent_id)
            .await?
            .into_iter()
            .find(|c| c.notify_id.as_deref() == Some(notify_id))
        {
            debug!(
                node_execution_id = %existing.id,
                notify_id = %notify_id,
                "Child already queued"
            );
            return Ok(existing.id);
        }

        let plan = self.load_plan(parent.plan_execution_id).await?;
        let node = plan
            .plan
            .fetch_node(child_node_id)
            .ok_or_else(|| EngineError::PlanNodeNotFound(child_node_id.to_string()))?;

        let id = Uuid::now_v7();
        let ambiance = parent
            .ambiance(&plan.input_args)
            .with_level(level_for(id, node));
        let mut ne = NodeExecution::queued(id, &ambiance, node);
        ne.parent_id = Some(parent_id);
        ne.notify_id = Some(notify_id.to_string());
        self.persist_queued(&ne).await?;
        self.spawn_start(id);
        Ok(id)
    }

    async fn persist_queued(&self, ne: &NodeExecution) -> Result<()> {
        self.store.save_node_execution(ne).await?;
        self.store
            .append_event(
                ne.plan_execution_id,
                &OrchestrationEvent::NodeQueued {
                    node_execution_id: ne.id,
                    node_id: ne.node.id.clone(),
                    previous_id: ne.previous_id,
                    parent_id: ne.parent_id,
                },
            )
            .await?;
        debug!(
            node_execution_id = %ne.id,
            node_id = %ne.node.id,
            depth = ne.levels.len(),
            "Node queued"
        );
        Ok(())
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("Dispatch permits closed: {}", e))
    }

    /// Run `work` as one unit of work holding `permit`.
    async fn dispatched<F: Future>(&self, permit: OwnedSemaphorePermit, work: F) -> F::Output {
        let slot = DispatchSlot {
            permits: self.permits.clone(),
            held: Some(permit),
        };
        DISPATCH.scope(RefCell::new(slot), work).await
    }

    fn spawn_start(self: &Arc<Self>, node_execution_id: Uuid) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match engine.acquire_permit().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(node_execution_id = %node_execution_id, error = %e, "Start dropped");
                    return;
                }
            };
            engine
                .dispatched(permit, async {
                    if let Err(e) = engine.facilitate_and_start_step(node_execution_id).await {
                        engine.report_error(node_execution_id, e).await;
                    }
                })
                .await;
        });
    }

    async fn report_error(self: &Arc<Self>, node_execution_id: Uuid, err: anyhow::Error) {
        if let Err(e) = self.handle_error(node_execution_id, err).await {
            error!(
                node_execution_id = %node_execution_id,
                error = %format!("{:#}", e),
                "Failed to conclude errored node"
            );
        }
    }

    // ─── Start path ───────────────────────────────────────────

    async fn facilitate_and_start_step(self: &Arc<Self>, id: Uuid) -> Result<()> {
        let ne = self.load_node(id).await?;
        if ne.status != Status::Queued {
            debug!(node_execution_id = %id, status = %ne.status, "Node no longer queued");
            return Ok(());
        }

        match self.interrupts.check_before_node_start(&ne).await? {
            CheckpointDecision::Proceed => {}
            CheckpointDecision::Abort { reason } => {
                info!(node_execution_id = %id, reason = %reason, "Node aborted at checkpoint");
                return self.abort_node(&ne, &reason).await;
            }
            CheckpointDecision::Pause => {
                self.interrupts.park(id, ne.plan_execution_id)?;
                info!(node_execution_id = %id, "Plan paused, node parked");
                // A resume may have drained the parked set before we joined it.
                let plan = self.load_plan(ne.plan_execution_id).await?;
                if plan.status == Status::Running && self.interrupts.unpark(id)? {
                    self.spawn_start(id);
                }
                return Ok(());
            }
        }

        let plan = self.load_plan(ne.plan_execution_id).await?;
        let ambiance = ne.ambiance(&plan.input_args);

        let mut inputs = StepInputs::new();
        for ref_object in &ne.node.ref_objects {
            let resolver = self.registries.resolvers.obtain(&ref_object.ref_type)?;
            let value = resolver.resolve(&ambiance, ref_object).await?;
            inputs.insert(ref_object.name.clone(), value.unwrap_or(Value::Null));
        }
        inputs.extend(ne.additional_inputs.clone());

        let parameters = self
            .render_parameters(&ambiance, &ne.node.step_parameters, &inputs)
            .await?;
        let update = NodeExecutionUpdate {
            resolved_step_parameters: Some(parameters),
            resolved_inputs: Some(inputs),
            ..Default::default()
        };
        let ne = self
            .store
            .update_node_execution(id, &update)
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(id))?;

        self.facilitate_execution(&ambiance, ne).await
    }

    async fn render_parameters(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
        inputs: &StepInputs,
    ) -> Result<Value> {
        let mut ctx = ExpressionContext {
            inputs: ambiance.input_args.clone(),
            outcomes: BTreeMap::new(),
        };
        ctx.inputs.extend(inputs.clone());

        let names = self.renderer.referenced_outcomes(parameters);
        if !names.is_empty() {
            let resolver = self.registries.resolvers.obtain(OUTCOME_REF_TYPE)?;
            for name in names {
                let lookup = RefObject::outcome(name.clone(), name.clone());
                if let Some(value) = resolver.resolve(ambiance, &lookup).await? {
                    ctx.outcomes.insert(name, value);
                }
            }
        }
        self.renderer.render(parameters, &ctx)
    }

    async fn facilitate_execution(
        self: &Arc<Self>,
        ambiance: &Ambiance,
        ne: NodeExecution,
    ) -> Result<()> {
        for obtainment in &ne.node.facilitator_obtainments {
            let facilitator = self
                .registries
                .facilitators
                .obtain(&obtainment.facilitator_type)?;
            let request = FacilitationRequest {
                ambiance: ambiance.clone(),
                parameters: obtainment.parameters.clone(),
                step_parameters: ne.step_parameters().clone(),
                inputs: ne.resolved_inputs.clone(),
            };
            let Some(response) = facilitator.facilitate(&request).await? else {
                continue;
            };

            self.store
                .append_event(
                    ne.plan_execution_id,
                    &OrchestrationEvent::Facilitated {
                        node_execution_id: ne.id,
                        facilitator_type: obtainment.facilitator_type.clone(),
                        mode: response.execution_mode,
                        initial_wait_ms: response.initial_wait_ms,
                    },
                )
                .await?;
            debug!(
                node_execution_id = %ne.id,
                facilitator_type = %obtainment.facilitator_type,
                mode = %response.execution_mode.as_str(),
                "Node facilitated"
            );

            if let Some(wait_ms) = response.initial_wait_ms {
                return self.park_initial_wait(&ne, response, wait_ms).await;
            }
            return self.invoke_state(ne.id, response).await;
        }
        Err(EngineError::NoFacilitatorMatched(ne.node.id.clone()).into())
    }

    async fn park_initial_wait(
        &self,
        ne: &NodeExecution,
        response: FacilitatorResponse,
        wait_ms: u64,
    ) -> Result<()> {
        let update = NodeExecutionUpdate {
            initial_wait_ms: Some(wait_ms),
            ..NodeExecutionUpdate::status(Status::Waiting).expecting(&[Status::Queued])
        };
        if self.transition(ne.id, update).await?.is_none() {
            return self
                .ignore_duplicate(ne.plan_execution_id, Some(ne.id), "initial wait on moved node")
                .await;
        }
        let delay_id = self.waiter.schedule_delay(Duration::from_millis(wait_ms));
        self.waiter
            .wait_for_all_on(
                &ne.id.to_string(),
                NotifyCallback::EngineWaitResume {
                    node_execution_id: ne.id,
                    facilitator_response: response,
                },
                vec![delay_id],
            )
            .await?;
        info!(node_execution_id = %ne.id, wait_ms, "Node waiting before invocation");
        Ok(())
    }

    /// Move the node to RUNNING in the facilitated mode and hand it to its
    /// step, locally or through the module that hosts it.
    async fn invoke_state(self: &Arc<Self>, id: Uuid, response: FacilitatorResponse) -> Result<()> {
        let mode = response.execution_mode;
        let update = NodeExecutionUpdate {
            pass_through_data: response.pass_through_data,
            ..NodeExecutionUpdate::status(Status::Running)
                .expecting(&[Status::Queued, Status::Waiting])
                .with_mode(mode)
        };
        let Some(ne) = self.transition(id, update).await? else {
            let plan_execution_id = self.load_node(id).await?.plan_execution_id;
            return self
                .ignore_duplicate(plan_execution_id, Some(id), "invoke on moved node")
                .await;
        };

        let plan = self.load_plan(ne.plan_execution_id).await?;
        let invocation = Self::invocation_for(&ne, &plan);
        match self.registries.steps.obtain(&ne.node.step_type.name)? {
            StepBinding::Local(step) => {
                let package = InvokerPackage {
                    node_execution: ne,
                    invocation,
                    mode,
                    start: true,
                    responses: ResponseMap::new(),
                };
                invoker_for(mode).invoke(self, &step, package).await
            }
            StepBinding::Remote(link) => {
                link.send(ModuleEvent::NodeStart {
                    node_execution_id: id,
                    step_type: ne.node.step_type.name.clone(),
                    mode,
                    invocation,
                })
                .await
            }
        }
    }

    fn invocation_for(ne: &NodeExecution, plan: &PlanExecution) -> StepInvocation {
        StepInvocation {
            ambiance: ne.ambiance(&plan.input_args),
            parameters: ne.step_parameters().clone(),
            inputs: ne.resolved_inputs.clone(),
            pass_through_data: ne.pass_through_data.clone(),
        }
    }

    // ─── Suspension ───────────────────────────────────────────

    /// Record what a dispatched step left running and park the node on it.
    /// ASYNC and TASK move the node to WAITING; CHILD and CHILDREN keep it
    /// RUNNING while the children work.
    pub async fn add_executable_response(
        &self,
        id: Uuid,
        response: ExecutableResponse,
    ) -> Result<()> {
        let current = self.load_node(id).await?;
        if current.is_terminal() {
            return self
                .ignore_duplicate(
                    current.plan_execution_id,
                    Some(id),
                    "executable response on concluded node",
                )
                .await;
        }
        let update = match &response {
            ExecutableResponse::Async { .. } | ExecutableResponse::Task { .. } => {
                NodeExecutionUpdate::status(Status::Waiting)
                    .expecting(&[Status::Running])
                    .with_executable_response(response.clone())
            }
            _ => NodeExecutionUpdate::default().with_executable_response(response.clone()),
        };
        if self.transition(id, update).await?.is_none() {
            return self
                .ignore_duplicate(
                    current.plan_execution_id,
                    Some(id),
                    "executable response on moved node",
                )
                .await;
        }
        if matches!(response, ExecutableResponse::Sync) {
            return Ok(());
        }

        let correlation_ids = response.correlation_ids();
        self.waiter
            .wait_for_all_on(
                &id.to_string(),
                NotifyCallback::EngineResume {
                    node_execution_id: id,
                },
                correlation_ids.clone(),
            )
            .await?;
        if let ExecutableResponse::Async {
            timeout_ms: Some(timeout_ms),
            ..
        } = response
        {
            self.waiter
                .schedule_timeout(correlation_ids.clone(), Duration::from_millis(timeout_ms));
        }
        debug!(
            node_execution_id = %id,
            awaiting = correlation_ids.len(),
            "Node parked on executable response"
        );
        Ok(())
    }

    /// Queue a task on behalf of a TASK node and park the node on it.
    pub async fn queue_task_for(&self, id: Uuid, request: TaskRequest) -> Result<CorrelationId> {
        let ne = self.load_node(id).await?;
        let timeout_secs = request
            .timeout_secs
            .unwrap_or(self.config.default_task_timeout_secs);
        let task = QueuedTask::new(
            ne.plan_execution_id,
            id,
            &request.task_type,
            request.payload,
            timeout_secs,
        );
        let task_id = self.tasks.queue_task(task).await?;
        self.add_executable_response(
            id,
            ExecutableResponse::Task {
                task_id: task_id.clone(),
                task_type: request.task_type,
            },
        )
        .await?;
        Ok(task_id)
    }

    /// Deliver a response to whoever waits on `correlation_id`. Returns
    /// `false` for a duplicate delivery.
    pub async fn notify(&self, correlation_id: &str, data: ResponseData) -> Result<bool> {
        self.waiter.done_with(correlation_id, data).await
    }

    pub async fn complete_task(&self, task_id: &str, payload: Option<Value>) -> Result<bool> {
        match self.tasks.complete(task_id, payload).await? {
            Some(result) => self.notify(task_id, ResponseData::Task(result)).await,
            None => Ok(false),
        }
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<bool> {
        match self.tasks.fail(task_id, error).await? {
            Some(result) => self.notify(task_id, ResponseData::Task(result)).await,
            None => Ok(false),
        }
    }

    /// Expire overdue tasks and wake the nodes waiting on them.
    pub async fn expire_overdue_tasks(&self) -> Result<usize> {
        let expired = self.tasks.expire_overdue(now()).await?;
        for result in &expired {
            warn!(task_id = %result.task_id, "Task expired");
            self.notify(&result.task_id, ResponseData::Task(result.clone()))
                .await?;
        }
        Ok(expired.len())
    }

    /// Responses delivered so far for what a node currently waits on.
    pub async fn accumulate_responses(&self, id: Uuid) -> Result<ResponseMap> {
        let ne = self.load_node(id).await?;
        self.waiter.responses_for(&ne.awaited_ids())
    }

    // ─── Resume path ──────────────────────────────────────────

    /// Re-enter a waiting (or still running) node's step with `responses`.
    /// On any other status this is a logged no-op.
    pub async fn resume(
        self: &Arc<Self>,
        id: Uuid,
        responses: ResponseMap,
        async_error: bool,
    ) -> Result<()> {
        let ne = self.load_node(id).await?;
        if !ne.status.is_resumable() {
            warn!(
                node_execution_id = %id,
                status = %ne.status,
                "Resume of non-resumable node ignored"
            );
            return self
                .ignore_duplicate(
                    ne.plan_execution_id,
                    Some(id),
                    &format!("resume while {}", ne.status),
                )
                .await;
        }

        let ne = if ne.status == Status::Waiting {
            let update = NodeExecutionUpdate::status(Status::Running).expecting(&[Status::Waiting]);
            match self.transition(id, update).await? {
                Some(ne) => ne,
                None => {
                    return self
                        .ignore_duplicate(ne.plan_execution_id, Some(id), "concurrent resume")
                        .await
                }
            }
        } else {
            ne
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match engine.acquire_permit().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(node_execution_id = %id, error = %e, "Resume dropped");
                    return;
                }
            };
            engine
                .dispatched(permit, async {
                    if let Err(e) = engine.resume_step(ne, responses, async_error).await {
                        engine.report_error(id, e).await;
                    }
                })
                .await;
        });
        Ok(())
    }

    async fn resume_step(
        self: &Arc<Self>,
        ne: NodeExecution,
        responses: ResponseMap,
        async_error: bool,
    ) -> Result<()> {
        if async_error {
            let failure_info = responses
                .values()
                .find_map(|data| match data {
                    ResponseData::Error(info) => Some(info.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| {
                    FailureInfo::new(
                        "asynchronous work reported an error",
                        FailureType::Application,
                    )
                });
            return self
                .handle_step_response(ne.id, StepResponse::failed(failure_info))
                .await;
        }

        let mode = ne
            .mode
            .ok_or_else(|| anyhow!("Node execution {} resumed before invocation", ne.id))?;
        let plan = self.load_plan(ne.plan_execution_id).await?;
        let invocation = Self::invocation_for(&ne, &plan);
        match self.registries.steps.obtain(&ne.node.step_type.name)? {
            StepBinding::Local(step) => {
                let package = InvokerPackage {
                    node_execution: ne,
                    invocation,
                    mode,
                    start: false,
                    responses,
                };
                invoker_for(mode).invoke(self, &step, package).await
            }
            StepBinding::Remote(link) => {
                link.send(ModuleEvent::NodeResume {
                    node_execution_id: ne.id,
                    step_type: ne.node.step_type.name.clone(),
                    mode,
                    invocation,
                    responses,
                })
                .await
            }
        }
    }

    // ─── Conclusion ───────────────────────────────────────────

    /// Conclude a node with the step's response, publish its outcomes and
    /// ask its advisers what comes next. A response for a node that already
    /// concluded is ignored; only the response that wins the conclusion
    /// publishes outcomes. A pending ABORT aimed at the node overrides the
    /// response and ends the lineage ABORTED.
    pub async fn handle_step_response(
        self: &Arc<Self>,
        id: Uuid,
        response: StepResponse,
    ) -> Result<()> {
        let ne = self.load_node(id).await?;
        if ne.is_terminal() {
            warn!(
                node_execution_id = %id,
                status = %ne.status,
                "Step response for concluded node ignored"
            );
            return self
                .ignore_duplicate(ne.plan_execution_id, Some(id), "step response after conclusion")
                .await;
        }
        if let Some(interrupt) = self.interrupts.take_node_abort(ne.plan_execution_id, id).await? {
            info!(node_execution_id = %id, "Node aborted as it concluded");
            return self.abort_node(&ne, &abort_reason(&interrupt)).await;
        }

        let plan = self.load_plan(ne.plan_execution_id).await?;
        let ambiance = ne.ambiance(&plan.input_args);

        let response = if response.status.is_terminal() {
            response
        } else {
            StepResponse::failed(FailureInfo::new(
                format!("step reported non-final status {}", response.status),
                FailureType::Configuration,
            ))
        };
        let response = match self.check_outcome_resolvers(&response) {
            Ok(()) => response,
            Err(e) => {
                warn!(
                    node_execution_id = %id,
                    error = %format!("{:#}", e),
                    "Outcome cannot be published"
                );
                StepResponse::failed(failure_info_from(&e))
            }
        };

        let update = NodeExecutionUpdate {
            valid_until: Some(self.retention_deadline()),
            ..NodeExecutionUpdate::status(response.status)
                .with_failure(response.failure_info.clone())
        };
        let Some(concluded) = self.transition(id, update).await? else {
            return self
                .ignore_duplicate(ne.plan_execution_id, Some(id), "concurrent conclusion")
                .await;
        };
        info!(
            plan_execution_id = %concluded.plan_execution_id,
            node_execution_id = %id,
            node_id = %concluded.node.id,
            status = %concluded.status,
            "Node concluded"
        );

        let consumed = self.consume_outcomes(&concluded, &ambiance, &response).await;
        let (concluded, response) = match consumed {
            Ok(()) => (concluded, response),
            Err(e) => {
                let failure_info = failure_info_from(&e);
                error!(
                    node_execution_id = %id,
                    error = %format!("{:#}", e),
                    "Outcome consumption failed, lineage continues as failed"
                );
                let noted = NodeExecutionUpdate::default().with_failure(Some(failure_info.clone()));
                let concluded = self
                    .store
                    .update_node_execution(id, &noted)
                    .await?
                    .unwrap_or(concluded);
                (concluded, StepResponse::failed(failure_info))
            }
        };

        // An abort registered while the step ran still decides the lineage.
        if let Some(interrupt) = self
            .interrupts
            .take_node_abort(concluded.plan_execution_id, id)
            .await?
        {
            info!(node_execution_id = %id, "Lineage aborted after node concluded");
            return self
                .end_transition(&concluded, &StepResponse::aborted(abort_reason(&interrupt)))
                .await;
        }

        let event = AdvisingEvent {
            ambiance: ambiance.clone(),
            node_execution_id: id,
            node_id: concluded.node.id.clone(),
            status: concluded.status,
            outcomes: response.outcome_map(),
            failure_info: response.failure_info.clone(),
            retry_count: concluded.retry_ids.len(),
            parameters: Value::Null,
        };
        for obtainment in &concluded.node.adviser_obtainments {
            let adviser = match self.registries.advisers.obtain(&obtainment.adviser_type) {
                Ok(adviser) => adviser,
                Err(e) => {
                    error!(node_execution_id = %id, error = %e, "Adviser lookup failed");
                    break;
                }
            };
            let event = AdvisingEvent {
                parameters: obtainment.parameters.clone(),
                ..event.clone()
            };
            match adviser.advise(&event).await {
                Ok(Some(advise)) => {
                    self.store
                        .append_event(
                            concluded.plan_execution_id,
                            &OrchestrationEvent::AdviseTaken {
                                node_execution_id: id,
                                adviser_type: obtainment.adviser_type.clone(),
                                advise: advise.describe(),
                            },
                        )
                        .await?;
                    debug!(
                        node_execution_id = %id,
                        adviser_type = %obtainment.adviser_type,
                        advise = %advise.describe(),
                        "Advise taken"
                    );
                    return self
                        .handle_advise(&plan, &ambiance, &concluded, &response, advise)
                        .await;
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        node_execution_id = %id,
                        adviser_type = %obtainment.adviser_type,
                        error = %format!("{:#}", e),
                        "Adviser failed"
                    );
                    break;
                }
            }
        }
        self.end_transition(&concluded, &response).await
    }

    fn check_outcome_resolvers(&self, response: &StepResponse) -> Result<()> {
        for step_outcome in &response.step_outcomes {
            if let Some(outcome) = &step_outcome.outcome {
                self.registries.resolvers.obtain(&outcome.ref_type)?;
            }
        }
        Ok(())
    }

    async fn consume_outcomes(
        &self,
        ne: &NodeExecution,
        ambiance: &Ambiance,
        response: &StepResponse,
    ) -> Result<()> {
        for step_outcome in &response.step_outcomes {
            let Some(outcome) = &step_outcome.outcome else {
                continue;
            };
            let resolver = self.registries.resolvers.obtain(&outcome.ref_type)?;
            resolver
                .consume(
                    ambiance,
                    &step_outcome.name,
                    outcome,
                    step_outcome.group.as_deref(),
                )
                .await?;
            self.store
                .append_event(
                    ne.plan_execution_id,
                    &OrchestrationEvent::OutcomeConsumed {
                        node_execution_id: ne.id,
                        name: step_outcome.name.clone(),
                        group: step_outcome.group.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_advise(
        self: &Arc<Self>,
        plan: &PlanExecution,
        ambiance: &Ambiance,
        ne: &NodeExecution,
        response: &StepResponse,
        advise: Advise,
    ) -> Result<()> {
        match advise {
            Advise::NextStep { next_node_id } => match plan.plan.fetch_node(&next_node_id) {
                Some(next) => {
                    self.trigger_execution(ambiance, next).await?;
                    Ok(())
                }
                None => {
                    let err = EngineError::PlanNodeNotFound(next_node_id);
                    error!(
                        node_execution_id = %ne.id,
                        error = %err,
                        "Advised node missing from plan"
                    );
                    let errored = StepResponse {
                        status: Status::Errored,
                        step_outcomes: response.step_outcomes.clone(),
                        failure_info: Some(FailureInfo::new(err.to_string(), err.failure_type())),
                    };
                    self.end_transition(ne, &errored).await
                }
            },
            Advise::End => self.end_transition(ne, response).await,
            Advise::Retry { wait_ms } => {
                self.retry_node(plan, ne, wait_ms).await?;
                Ok(())
            }
        }
    }

    /// Queue a fresh execution of `ne`'s plan node in its place, optionally
    /// after a wait.
    async fn retry_node(
        self: &Arc<Self>,
        plan: &PlanExecution,
        ne: &NodeExecution,
        wait_ms: Option<u64>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let ambiance = ne
            .ambiance(&plan.input_args)
            .replace_current(level_for(id, &ne.node));
        let mut retry = NodeExecution::queued(id, &ambiance, &ne.node);
        retry.previous_id = Some(ne.id);
        retry.parent_id = ne.parent_id;
        retry.notify_id = ne.notify_id.clone();
        retry.additional_inputs = ne.additional_inputs.clone();
        retry.retry_ids = ne.retry_ids.clone();
        retry.retry_ids.push(ne.id);
        self.persist_queued(&retry).await?;

        self.store.mark_retried(ne.id).await?;
        let link = NodeExecutionUpdate {
            next_id: Some(id),
            ..Default::default()
        };
        self.store.update_node_execution(ne.id, &link).await?;
        info!(
            node_execution_id = %id,
            retried = %ne.id,
            attempt = retry.retry_ids.len(),
            "Node retry queued"
        );

        match wait_ms {
            Some(ms) => {
                let delay_id = self.waiter.schedule_delay(Duration::from_millis(ms));
                self.waiter
                    .wait_for_all_on(
                        &id.to_string(),
                        NotifyCallback::RetryAfterWait {
                            node_execution_id: id,
                        },
                        vec![delay_id],
                    )
                    .await?;
            }
            None => self.spawn_start(id),
        }
        Ok(id)
    }

    /// End a lineage: notify the waiting parent, or end the plan execution
    /// when there is none.
    pub async fn end_transition(&self, ne: &NodeExecution, response: &StepResponse) -> Result<()> {
        match &ne.notify_id {
            Some(notify_id) => {
                let data = StepResponseNotifyData {
                    node_execution_id: ne.id,
                    node_id: ne.node.id.clone(),
                    identifier: ne.node.identifier.clone(),
                    group: ne.node.step_type.group.clone(),
                    status: response.status,
                    step_outcomes: response.step_outcomes.clone(),
                    failure_info: response.failure_info.clone(),
                };
                if self
                    .waiter
                    .done_with(notify_id, ResponseData::StepNotify(data))
                    .await?
                {
                    self.store
                        .append_event(
                            ne.plan_execution_id,
                            &OrchestrationEvent::NotifyDelivered {
                                correlation_id: notify_id.clone(),
                            },
                        )
                        .await?;
                    debug!(node_execution_id = %ne.id, notify_id = %notify_id, "Parent notified");
                }
                Ok(())
            }
            None => {
                let status = match response.status {
                    Status::Skipped => Status::Succeeded,
                    s if s.is_terminal() => s,
                    _ => Status::Errored,
                };
                self.end_plan(ne.plan_execution_id, status).await
            }
        }
    }

    async fn end_plan(&self, plan_execution_id: Uuid, status: Status) -> Result<()> {
        let ended = self
            .store
            .update_plan_status(plan_execution_id, status, status.plan_allowed_start_set())
            .await?;
        if ended.is_none() {
            debug!(plan_execution_id = %plan_execution_id, "Plan execution already ended");
            return Ok(());
        }
        self.store
            .set_plan_retention(plan_execution_id, Some(self.retention_deadline()))
            .await?;
        self.interrupts.forget_plan(plan_execution_id)?;
        self.store
            .append_event(
                plan_execution_id,
                &OrchestrationEvent::PlanEnded { status, at: now() },
            )
            .await?;
        info!(plan_execution_id = %plan_execution_id, status = %status, "Plan execution ended");
        Ok(())
    }

    /// Turn an error raised while driving a node into a FAILED conclusion.
    pub async fn handle_error(self: &Arc<Self>, id: Uuid, err: anyhow::Error) -> Result<()> {
        let failure_info = failure_info_from(&err);
        error!(
            node_execution_id = %id,
            failure_types = ?failure_info.failure_types,
            error = %format!("{:#}", err),
            "Node execution failed"
        );
        self.handle_step_response(id, StepResponse::failed(failure_info))
            .await
    }

    // ─── Interrupts ───────────────────────────────────────────

    /// Register an interrupt and act on it.
    ///
    /// PAUSE and RESUME toggle the plan; ABORT ends the target (eagerly when
    /// it is waiting, parked or fanned out, otherwise at its checkpoint or
    /// when its step concludes); RETRY re-queues the top-level node of the
    /// target's lineage, or of the most recently broken one.
    pub async fn register_interrupt(
        self: &Arc<Self>,
        interrupt_type: InterruptType,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        created_by: &str,
    ) -> Result<Interrupt> {
        let plan = self.load_plan(plan_execution_id).await?;
        let interrupt = Interrupt::new(interrupt_type, plan.id, node_execution_id, created_by);
        self.interrupts.register(&interrupt).await?;

        match (interrupt_type, node_execution_id) {
            (InterruptType::Pause, _) => self.process_pause(&interrupt).await?,
            (InterruptType::Resume, _) => self.process_resume(&interrupt).await?,
            (InterruptType::Abort, Some(target)) => {
                self.process_node_abort(&interrupt, target).await?
            }
            (InterruptType::Abort, None) => self.process_plan_abort(&interrupt).await?,
            (InterruptType::Retry, target) => self.process_retry(&interrupt, &plan, target).await?,
        }
        Ok(interrupt)
    }

    async fn set_plan_status(
        &self,
        plan_execution_id: Uuid,
        to: Status,
        expected: &[Status],
    ) -> Result<Option<PlanExecution>> {
        let from = self.load_plan(plan_execution_id).await?.status;
        let updated = self
            .store
            .update_plan_status(plan_execution_id, to, expected)
            .await?;
        if updated.is_some() {
            self.store
                .append_event(
                    plan_execution_id,
                    &OrchestrationEvent::PlanStatusUpdated { from, to },
                )
                .await?;
        }
        Ok(updated)
    }

    async fn process_pause(&self, interrupt: &Interrupt) -> Result<()> {
        let paused = self
            .set_plan_status(interrupt.plan_execution_id, Status::Paused, &[Status::Running])
            .await?;
        self.interrupts.mark_processed(interrupt).await?;
        let plan_execution_id = interrupt.plan_execution_id;
        match paused {
            Some(_) => info!(plan_execution_id = %plan_execution_id, "Plan execution paused"),
            None => {
                warn!(plan_execution_id = %plan_execution_id, "Pause ignored, plan not running")
            }
        }
        Ok(())
    }

    async fn process_resume(self: &Arc<Self>, interrupt: &Interrupt) -> Result<()> {
        let resumed = self
            .set_plan_status(interrupt.plan_execution_id, Status::Running, &[Status::Paused])
            .await?;
        self.interrupts.mark_processed(interrupt).await?;
        if resumed.is_none() {
            warn!(
                plan_execution_id = %interrupt.plan_execution_id,
                "Resume ignored, plan not paused"
            );
            return Ok(());
        }
        let parked = self
            .interrupts
            .drain_parked(interrupt.plan_execution_id)
            .await?;
        info!(
            plan_execution_id = %interrupt.plan_execution_id,
            parked = parked.len(),
            "Plan execution resumed"
        );
        for id in parked {
            self.spawn_start(id);
        }
        Ok(())
    }

    /// Whether an active node can be aborted right away instead of at its
    /// next checkpoint.
    fn abortable_now(&self, ne: &NodeExecution) -> Result<bool> {
        Ok(match ne.status {
            Status::Waiting => true,
            Status::Running => matches!(
                ne.mode,
                Some(ExecutionMode::Child) | Some(ExecutionMode::Children)
            ),
            Status::Queued => self.interrupts.unpark(ne.id)?,
            _ => false,
        })
    }

    /// Abort one node. A node that cannot be stopped right away keeps the
    /// interrupt pending: a queued node ends at its checkpoint, a running
    /// step when it concludes.
    async fn process_node_abort(
        self: &Arc<Self>,
        interrupt: &Interrupt,
        target: Uuid,
    ) -> Result<()> {
        let ne = self.load_node(target).await?;
        if ne.is_terminal() {
            warn!(node_execution_id = %target, status = %ne.status, "Abort ignored");
            self.interrupts.mark_processed(interrupt).await?;
            return Ok(());
        }
        if !self.abortable_now(&ne)? {
            debug!(
                node_execution_id = %target,
                status = %ne.status,
                "Abort deferred to the node's next checkpoint"
            );
            return self.settle_deferred_abort(interrupt, target).await;
        }
        if !self.interrupts.mark_processed(interrupt).await? {
            return Ok(());
        }

        let reason = abort_reason(interrupt);
        let descendants = self
            .store
            .find_all_children_with_status_in(
                ne.plan_execution_id,
                ne.id,
                &[Status::Queued, Status::Waiting, Status::Running],
            )
            .await?;
        for child in descendants {
            if self.abortable_now(&child)? || child.status == Status::Queued {
                self.abort_silently(&child, &reason).await?;
            }
        }
        self.waiter.cancel_group(&ne.id.to_string())?;
        info!(node_execution_id = %target, "Node aborted");
        self.abort_node(&ne, &reason).await
    }

    /// The node may have concluded between the status read and the interrupt
    /// landing, past every checkpoint. Consume the interrupt in that case.
    async fn settle_deferred_abort(&self, interrupt: &Interrupt, target: Uuid) -> Result<()> {
        let ne = self.load_node(target).await?;
        if ne.is_terminal()
            && self
                .interrupts
                .take_node_abort(interrupt.plan_execution_id, target)
                .await?
                .is_some()
        {
            warn!(
                node_execution_id = %target,
                status = %ne.status,
                "Abort arrived after conclusion"
            );
        }
        Ok(())
    }

    async fn process_plan_abort(&self, interrupt: &Interrupt) -> Result<()> {
        let plan_execution_id = interrupt.plan_execution_id;
        let aborted = self
            .set_plan_status(
                plan_execution_id,
                Status::Aborted,
                &[Status::Running, Status::Paused],
            )
            .await?;
        self.interrupts.mark_processed(interrupt).await?;
        if aborted.is_none() {
            warn!(plan_execution_id = %plan_execution_id, "Abort ignored, plan already ended");
            return Ok(());
        }

        let reason = abort_reason(interrupt);
        let active = self
            .store
            .fetch_by_status(
                plan_execution_id,
                &[Status::Queued, Status::Waiting, Status::Running],
            )
            .await?;
        let mut swept = 0;
        for ne in active {
            if self.abortable_now(&ne)? && self.abort_silently(&ne, &reason).await? {
                swept += 1;
            }
        }
        self.store
            .set_plan_retention(plan_execution_id, Some(self.retention_deadline()))
            .await?;
        self.store
            .append_event(
                plan_execution_id,
                &OrchestrationEvent::PlanEnded {
                    status: Status::Aborted,
                    at: now(),
                },
            )
            .await?;
        self.interrupts.forget_plan(plan_execution_id)?;
        info!(plan_execution_id = %plan_execution_id, swept, "Plan execution aborted");
        Ok(())
    }

    /// Abort a node without ending its lineage. Returns whether it changed.
    async fn abort_silently(&self, ne: &NodeExecution, reason: &str) -> Result<bool> {
        self.waiter.cancel_group(&ne.id.to_string())?;
        let update = NodeExecutionUpdate {
            valid_until: Some(self.retention_deadline()),
            ..NodeExecutionUpdate::status(Status::Aborted)
                .with_failure(Some(FailureInfo::new(reason, FailureType::Application)))
        };
        Ok(self.transition(ne.id, update).await?.is_some())
    }

    /// Undo a fan-out that failed part way: drop the parent's wait and abort
    /// every child it already queued, so none runs for a parent that will
    /// conclude FAILED. Returns how many children were aborted.
    pub async fn abort_children(&self, parent_id: Uuid, reason: &str) -> Result<usize> {
        let parent = self.load_node(parent_id).await?;
        self.waiter.cancel_group(&parent_id.to_string())?;
        let active = self
            .store
            .find_all_children_with_status_in(
                parent.plan_execution_id,
                parent_id,
                &[Status::Queued, Status::Waiting, Status::Running],
            )
            .await?;
        let mut aborted = 0;
        for child in active {
            if child.status == Status::Queued {
                self.interrupts.unpark(child.id)?;
            }
            if self.abort_silently(&child, reason).await? {
                aborted += 1;
            }
        }
        warn!(node_execution_id = %parent_id, aborted, "Partial fan-out undone");
        Ok(aborted)
    }

    /// Abort a node and end its lineage as ABORTED.
    async fn abort_node(&self, ne: &NodeExecution, reason: &str) -> Result<()> {
        let response = StepResponse::aborted(reason);
        let update = NodeExecutionUpdate {
            valid_until: Some(self.retention_deadline()),
            ..NodeExecutionUpdate::status(Status::Aborted)
                .with_failure(response.failure_info.clone())
        };
        match self.transition(ne.id, update).await? {
            Some(aborted) => self.end_transition(&aborted, &response).await,
            None => {
                self.ignore_duplicate(ne.plan_execution_id, Some(ne.id), "abort of moved node")
                    .await
            }
        }
    }

    async fn process_retry(
        self: &Arc<Self>,
        interrupt: &Interrupt,
        plan: &PlanExecution,
        target: Option<Uuid>,
    ) -> Result<()> {
        let target = match target {
            Some(id) => {
                let ne = self.load_node(id).await?;
                Some(self.lineage_root(ne).await?)
            }
            None => self.latest_broken_root(plan.id).await?,
        };
        let Some(target) = target.filter(|ne| ne.status.is_broken() && !ne.old_retry) else {
            warn!(plan_execution_id = %plan.id, "Retry ignored, nothing to retry");
            self.interrupts.mark_processed(interrupt).await?;
            return Ok(());
        };

        if plan.is_finished() {
            let reopened = self
                .set_plan_status(plan.id, Status::Running, Status::plan_reopenable_set())
                .await?;
            if reopened.is_none() {
                warn!(
                    plan_execution_id = %plan.id,
                    status = %plan.status,
                    "Retry ignored, plan cannot reopen"
                );
                self.interrupts.mark_processed(interrupt).await?;
                return Ok(());
            }
            self.store.set_plan_retention(plan.id, None).await?;
            info!(plan_execution_id = %plan.id, "Plan execution reopened");
        }
        if !self.interrupts.mark_processed(interrupt).await? {
            return Ok(());
        }
        let plan = self.load_plan(plan.id).await?;
        self.retry_node(&plan, &target, None).await?;
        Ok(())
    }

    /// Top-level node execution whose lineage `ne` belongs to. A node
    /// queued by a fan-out reports to a parent that never takes a second
    /// notification, so retrying it means retrying that top-level node.
    async fn lineage_root(&self, mut ne: NodeExecution) -> Result<NodeExecution> {
        while let Some(parent_id) = ne.parent_id {
            ne = self.load_node(parent_id).await?;
        }
        Ok(ne)
    }

    /// Root of the most recently broken lineage that can still be retried.
    async fn latest_broken_root(&self, plan_execution_id: Uuid) -> Result<Option<NodeExecution>> {
        let mut broken: Vec<NodeExecution> = self
            .store
            .fetch_without_old_retries(plan_execution_id)
            .await?
            .into_iter()
            .filter(|ne| ne.status.is_broken())
            .collect();
        broken.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        for ne in broken {
            let root = self.lineage_root(ne).await?;
            if root.status.is_broken() && !root.old_retry {
                return Ok(Some(root));
            }
        }
        Ok(None)
    }

    // ─── Bookkeeping ──────────────────────────────────────────

    /// Filtered status update that records the transition in the event log.
    async fn transition(
        &self,
        id: Uuid,
        update: NodeExecutionUpdate,
    ) -> Result<Option<NodeExecution>> {
        let from = match update.status {
            Some(_) => self.store.load_node_execution(id).await?.map(|ne| ne.status),
            None => None,
        };
        let updated = self.store.update_node_execution(id, &update).await?;
        if let (Some(ne), Some(from), Some(to)) = (&updated, from, update.status) {
            self.store
                .append_event(
                    ne.plan_execution_id,
                    &OrchestrationEvent::NodeStatusUpdated {
                        node_execution_id: id,
                        from,
                        to,
                    },
                )
                .await?;
            debug!(node_execution_id = %id, from = %from, to = %to, "Node status updated");
        }
        Ok(updated)
    }

    async fn ignore_duplicate(
        &self,
        plan_execution_id: Uuid,
        node_execution_id: Option<Uuid>,
        detail: &str,
    ) -> Result<()> {
        debug!(?node_execution_id, detail = %detail, "Duplicate ignored");
        self.store
            .append_event(
                plan_execution_id,
                &OrchestrationEvent::DuplicateIgnored {
                    node_execution_id,
                    detail: detail.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    // ─── Notify listener ──────────────────────────────────────

    /// Start the loop that turns fired callbacks into resumes and sweeps
    /// overdue tasks. Runs until `shutdown` flips; can be started once.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let mut rx = self
            .notify_rx
            .lock()
            .map_err(|e| anyhow!("Lock: {}", e))?
            .take()
            .ok_or_else(|| anyhow!("Notify listener already started"))?;
        let engine = Arc::clone(self);
        let sweep_every = Duration::from_secs(self.config.task_sweep_interval_secs.max(1));

        Ok(tokio::spawn(async move {
            info!("Notify listener started");
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    fired = rx.recv() => match fired {
                        Some(fired) => engine.spawn_callback(fired),
                        None => break,
                    },
                    _ = sweep.tick() => {
                        if let Err(e) = engine.expire_overdue_tasks().await {
                            error!(error = %e, "Task sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Notify listener shutting down");
                        break;
                    }
                }
            }
            info!("Notify listener stopped");
        }))
    }

    fn spawn_callback(self: &Arc<Self>, fired: FiredCallback) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let id = fired.callback.node_execution_id();
            if let Err(e) = engine.handle_callback(fired).await {
                error!(
                    node_execution_id = %id,
                    error = %format!("{:#}", e),
                    "Notify callback failed"
                );
            }
        });
    }

    async fn handle_callback(self: &Arc<Self>, fired: FiredCallback) -> Result<()> {
        match fired.callback {
            NotifyCallback::EngineResume { node_execution_id } => {
                self.resume(node_execution_id, fired.responses, false).await
            }
            NotifyCallback::EngineWaitResume {
                node_execution_id,
                facilitator_response,
            } => {
                let ne = self.load_node(node_execution_id).await?;
                if ne.status != Status::Waiting || ne.mode.is_some() {
                    return self
                        .ignore_duplicate(
                            ne.plan_execution_id,
                            Some(ne.id),
                            "initial wait elapsed on moved node",
                        )
                        .await;
                }
                let permit = self.acquire_permit().await?;
                self.dispatched(permit, async {
                    match self.invoke_state(node_execution_id, facilitator_response).await {
                        Ok(()) => Ok(()),
                        Err(e) => self.handle_error(node_execution_id, e).await,
                    }
                })
                .await
            }
            NotifyCallback::RetryAfterWait { node_execution_id } => {
                self.spawn_start(node_execution_id);
                Ok(())
            }
        }
    }
}

//! Executable invokers: one strategy per execution mode.
//!
//! Each strategy drives a local step either at start or on resume. Whatever
//! the mode, exactly one `handle_step_response` eventually follows: directly
//! for SYNC, after the callbacks or the task for ASYNC/TASK, after every
//! child notified for CHILD/CHILDREN. A fan-out that cannot queue every
//! child aborts the ones it did queue before failing.

use crate::engine::ExecutionEngine;
use crate::execution::{ChildDispatch, ExecutableResponse, NodeExecution};
use crate::step::{Step, StepInvocation};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a strategy needs to drive one node.
pub struct InvokerPackage {
    pub node_execution: NodeExecution,
    pub invocation: StepInvocation,
    pub mode: ExecutionMode,
    /// `true` on first invocation, `false` when resuming with `responses`.
    pub start: bool,
    pub responses: ResponseMap,
}

impl InvokerPackage {
    fn id(&self) -> Uuid {
        self.node_execution.id
    }
}

#[async_trait]
pub trait ExecutableInvoker: Send + Sync {
    async fn invoke(
        &self,
        engine: &Arc<ExecutionEngine>,
        step: &Arc<dyn Step>,
        package: InvokerPackage,
    ) -> Result<()>;
}

pub fn invoker_for(mode: ExecutionMode) -> &'static dyn ExecutableInvoker {
    match mode {
        ExecutionMode::Sync => &SyncInvoker,
        ExecutionMode::Async => &AsyncInvoker,
        ExecutionMode::Task => &TaskInvoker,
        ExecutionMode::Child => &ChildInvoker,
        ExecutionMode::Children => &ChildrenInvoker,
    }
}

const FAN_OUT_FAILED: &str = "parent failed to queue its children";

fn new_notify_id() -> CorrelationId {
    Uuid::now_v7().to_string()
}

// ─── SYNC ─────────────────────────────────────────────────────

pub struct SyncInvoker;

#[async_trait]
impl ExecutableInvoker for SyncInvoker {
    async fn invoke(
        &self,
        engine: &Arc<ExecutionEngine>,
        step: &Arc<dyn Step>,
        package: InvokerPackage,
    ) -> Result<()> {
        if !package.start {
            tracing::warn!(
                node_execution_id = %package.id(),
                "Resume of a SYNC node ignored"
            );
            return Ok(());
        }
        let response = step.execute_sync(&package.invocation).await?;
        engine.handle_step_response(package.id(), response).await
    }
}

// ─── ASYNC ────────────────────────────────────────────────────

pub struct AsyncInvoker;

#[async_trait]
impl ExecutableInvoker for AsyncInvoker {
    async fn invoke(
        &self,
        engine: &Arc<ExecutionEngine>,
        step: &Arc<dyn Step>,
        package: InvokerPackage,
    ) -> Result<()> {
        if package.start {
            let pending = step.execute_async(&package.invocation).await?;
            return engine
                .add_executable_response(
                    package.id(),
                    ExecutableResponse::Async {
                        callback_ids: pending.callback_ids,
                        timeout_ms: pending.timeout_ms,
                    },
                )
                .await;
        }
        let response = step
            .handle_async_response(&package.invocation, &package.responses)
            .await?;
        engine.handle_step_response(package.id(), response).await
    }
}

// ─── TASK ─────────────────────────────────────────────────────

pub struct TaskInvoker;

#[async_trait]
impl ExecutableInvoker for TaskInvoker {
    async fn invoke(
        &self,
        engine: &Arc<ExecutionEngine>,
        step: &Arc<dyn Step>,
        package: InvokerPackage,
    ) -> Result<()> {
        if package.start {
            let request = step.obtain_task(&package.invocation).await?;
            engine.queue_task_for(package.id(), request).await?;
            return Ok(());
        }
        let response = step
            .handle_task_result(&package.invocation, &package.responses)
            .await?;
        engine.handle_step_response(package.id(), response).await
    }
}

// ─── CHILD / CHILDREN ─────────────────────────────────────────

pub struct ChildInvoker;

#[async_trait]
impl ExecutableInvoker for ChildInvoker {
    async fn invoke(
        &self,
        engine: &Arc<ExecutionEngine>,
        step: &Arc<dyn Step>,
        package: InvokerPackage,
    ) -> Result<()> {
        if package.start {
            let request = step.obtain_child(&package.invocation).await?;
            let notify_id = new_notify_id();
            engine
                .add_executable_response(
                    package.id(),
                    ExecutableResponse::Child {
                        child_node_id: request.child_node_id.clone(),
                        notify_id: notify_id.clone(),
                    },
                )
                .await?;
            if let Err(e) = engine
                .queue_child_execution(package.id(), &request.child_node_id, &notify_id)
                .await
            {
                engine.abort_children(package.id(), FAN_OUT_FAILED).await?;
                return Err(e);
            }
            return Ok(());
        }
        let response = step
            .handle_child_response(&package.invocation, &package.responses)
            .await?;
        engine.handle_step_response(package.id(), response).await
    }
}

pub struct ChildrenInvoker;

#[async_trait]
impl ExecutableInvoker for ChildrenInvoker {
    async fn invoke(
        &self,
        engine: &Arc<ExecutionEngine>,
        step: &Arc<dyn Step>,
        package: InvokerPackage,
    ) -> Result<()> {
        if package.start {
            let request = step.obtain_children(&package.invocation).await?;
            let children: Vec<ChildDispatch> = request
                .child_node_ids
                .into_iter()
                .map(|child_node_id| ChildDispatch {
                    child_node_id,
                    notify_id: new_notify_id(),
                })
                .collect();
            engine
                .add_executable_response(
                    package.id(),
                    ExecutableResponse::Children {
                        children: children.clone(),
                    },
                )
                .await?;
            for child in &children {
                if let Err(e) = engine
                    .queue_child_execution(package.id(), &child.child_node_id, &child.notify_id)
                    .await
                {
                    engine.abort_children(package.id(), FAN_OUT_FAILED).await?;
                    return Err(e);
                }
            }
            return Ok(());
        }
        let response = step
            .handle_children_response(&package.invocation, &package.responses)
            .await?;
        engine.handle_step_response(package.id(), response).await
    }
}

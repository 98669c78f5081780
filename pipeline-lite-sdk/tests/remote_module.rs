//! End-to-end: an engine driving steps, facilitators and advisers hosted by a
//! module on the other side of the in-process transport.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pipeline_lite_core::adviser::OnSuccessAdviser;
use pipeline_lite_core::execution::{NodeExecution, PlanExecution};
use pipeline_lite_core::facilitator::{
    FacilitationRequest, Facilitator, FacilitatorResponse, ModeFacilitator,
};
use pipeline_lite_core::plan::{AdviserObtainment, FacilitatorObtainment, Plan, PlanNode, StepType};
use pipeline_lite_core::remote::ModuleLink;
use pipeline_lite_core::step::{AsyncExecutableResponse, ForkStep, Step, StepInvocation};
use pipeline_lite_core::task::MemoryTaskQueue;
use pipeline_lite_core::types::*;
use pipeline_lite_core::{
    EngineConfig, ExecutionEngine, ExecutionStore, MemoryStore, Registries, SdkRequestDispatcher,
};
use pipeline_lite_sdk::{in_process, PipelineModule, SdkClient};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Module-hosted behaviour ──

/// Charges `amount`; anything over 100 is declined.
struct ChargeStep;

#[async_trait]
impl Step for ChargeStep {
    async fn execute_sync(&self, invocation: &StepInvocation) -> Result<StepResponse> {
        let amount = invocation
            .parameters
            .get("amount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if amount > 100 {
            return Ok(StepResponse::failed(FailureInfo::new(
                format!("declined: {}", amount),
                FailureType::Application,
            )));
        }
        Ok(StepResponse::succeeded().with_outcome("receipt", json!({ "amount": amount })))
    }
}

struct LedgerStep;

#[async_trait]
impl Step for LedgerStep {
    async fn execute_sync(&self, _invocation: &StepInvocation) -> Result<StepResponse> {
        Err(anyhow!("ledger offline"))
    }
}

/// Waits for `approval-<node execution id>`.
struct ApprovalStep;

#[async_trait]
impl Step for ApprovalStep {
    async fn execute_async(&self, invocation: &StepInvocation) -> Result<AsyncExecutableResponse> {
        let id = invocation
            .ambiance
            .current_runtime_id()
            .ok_or_else(|| anyhow!("no level"))?;
        Ok(AsyncExecutableResponse {
            callback_ids: vec![format!("approval-{}", id)],
            timeout_ms: None,
        })
    }
}

struct BrokenFacilitator;

#[async_trait]
impl Facilitator for BrokenFacilitator {
    async fn facilitate(
        &self,
        _request: &FacilitationRequest,
    ) -> Result<Option<FacilitatorResponse>> {
        Err(anyhow!("rules service down"))
    }
}

// ── Cluster ──

struct Cluster {
    engine: Arc<ExecutionEngine>,
    store: Arc<MemoryStore>,
    module: Arc<PipelineModule>,
    _shutdown: watch::Sender<bool>,
}

fn cluster() -> Cluster {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let transport = in_process(64);

    let client = SdkClient::new(Arc::new(transport.requests.clone()))
        .with_retries(2, Duration::from_millis(10));
    let module = Arc::new(
        PipelineModule::new("billing", client)
            .with_step("charge", Arc::new(ChargeStep))
            .with_step("ledger", Arc::new(LedgerStep))
            .with_step("approval", Arc::new(ApprovalStep))
            .with_step("remote_fork", Arc::new(ForkStep))
            .with_facilitator("billing_sync", Arc::new(ModeFacilitator::new(ExecutionMode::Sync)))
            .with_facilitator("billing_async", Arc::new(ModeFacilitator::new(ExecutionMode::Async)))
            .with_facilitator(
                "billing_children",
                Arc::new(ModeFacilitator::new(ExecutionMode::Children)),
            )
            .with_facilitator("billing_broken", Arc::new(BrokenFacilitator))
            .with_adviser("billing_next", Arc::new(OnSuccessAdviser)),
    );

    let config = EngineConfig {
        remote_call_timeout_ms: 2_000,
        ..Default::default()
    };
    let link = Arc::new(ModuleLink::new(
        "billing",
        Arc::new(transport.events.clone()),
        config.remote_call_timeout(),
    ));
    let mut registries = Registries::with_defaults(store.clone());
    module.register_with(&mut registries, link);

    let engine = ExecutionEngine::new(
        config,
        store.clone(),
        registries,
        Arc::new(MemoryTaskQueue::new()),
    )
    .unwrap();
    let dispatcher = Arc::new(SdkRequestDispatcher::new(engine.clone()));

    let (shutdown, rx) = watch::channel(false);
    engine.spawn_listener(rx.clone()).unwrap();
    tokio::spawn(transport.core_inbox.run(dispatcher, rx.clone()));
    tokio::spawn(transport.module_inbox.run(module.clone(), rx));

    Cluster {
        engine,
        store,
        module,
        _shutdown: shutdown,
    }
}

fn node(id: &str, step_type: &str, facilitator: &str) -> PlanNode {
    PlanNode::new(id, StepType::new(step_type))
        .with_facilitator(FacilitatorObtainment::of(facilitator))
}

impl Cluster {
    async fn run(&self, plan: Plan) -> PlanExecution {
        self.engine
            .start_execution(plan, BTreeMap::new(), "e2e")
            .await
            .unwrap()
    }

    async fn finish(&self, plan_execution_id: Uuid) -> PlanExecution {
        self.engine
            .wait_until_finished(plan_execution_id, WAIT)
            .await
            .unwrap()
    }

    async fn nodes(&self, plan_execution_id: Uuid) -> Vec<NodeExecution> {
        self.store
            .fetch_node_executions(plan_execution_id)
            .await
            .unwrap()
    }

    async fn await_status(
        &self,
        plan_execution_id: Uuid,
        node_id: &str,
        status: Status,
    ) -> NodeExecution {
        let poll = async {
            loop {
                if let Some(ne) = self
                    .nodes(plan_execution_id)
                    .await
                    .into_iter()
                    .find(|ne| ne.node.id == node_id && ne.status == status)
                {
                    return ne;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(WAIT, poll)
            .await
            .unwrap_or_else(|_| panic!("{} never reached {}", node_id, status))
    }

    async fn event_kinds(&self, plan_execution_id: Uuid) -> Vec<&'static str> {
        self.store
            .read_events(plan_execution_id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.kind())
            .collect()
    }
}

// ── Scenarios ──

#[tokio::test]
async fn test_remote_step_facilitated_and_advised_remotely() {
    let c = cluster();
    let charge = node("charge", "charge", "billing_sync")
        .with_parameters(json!({"amount": 40}))
        .with_adviser(AdviserObtainment::new("billing_next", json!({"next_node_id": "done"})));
    let plan = c.run(Plan::new("charge", vec![charge, node("done", "noop", "sync")])).await;

    assert_eq!(c.finish(plan.id).await.status, Status::Succeeded);
    let nodes = c.nodes(plan.id).await;
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].next_id, Some(nodes[1].id));
    assert_eq!(c.store.outcome_names(plan.id).unwrap().get("receipt"), Some(&1));
    assert!(c.event_kinds(plan.id).await.contains(&"advise_taken"));
}

#[tokio::test]
async fn test_remote_step_failure_ends_plan_failed() {
    let c = cluster();
    let charge = node("charge", "charge", "billing_sync").with_parameters(json!({"amount": 500}));
    let plan = c.run(Plan::new("charge", vec![charge])).await;

    assert_eq!(c.finish(plan.id).await.status, Status::Failed);
    let ne = &c.nodes(plan.id).await[0];
    assert!(ne.failure_info.as_ref().unwrap().error_message.contains("declined"));
}

#[tokio::test]
async fn test_module_error_reported_as_node_failure() {
    let c = cluster();
    let plan = c.run(Plan::new("l", vec![node("l", "ledger", "billing_sync")])).await;

    assert_eq!(c.finish(plan.id).await.status, Status::Failed);
    let info = c.nodes(plan.id).await[0].failure_info.clone().unwrap();
    assert!(info.error_message.contains("ledger offline"));
}

#[tokio::test]
async fn test_remote_async_step_resumes_through_module() {
    let c = cluster();
    let plan = c
        .run(Plan::new("approve", vec![node("approve", "approval", "billing_async")]))
        .await;
    let waiting = c.await_status(plan.id, "approve", Status::Waiting).await;

    let delivered = c
        .engine
        .notify(
            &format!("approval-{}", waiting.id),
            ResponseData::Custom {
                payload: json!({"approved_by": "ops"}),
            },
        )
        .await
        .unwrap();
    assert!(delivered);

    assert_eq!(c.finish(plan.id).await.status, Status::Succeeded);
    let ne = c.engine.load_node(waiting.id).await.unwrap();
    assert_eq!(ne.status, Status::Succeeded);
    assert_eq!(ne.mode, Some(ExecutionMode::Async));
}

#[tokio::test]
async fn test_remote_fan_out_to_local_children() {
    let c = cluster();
    let split = node("split", "remote_fork", "billing_children")
        .with_parameters(json!({"child_node_ids": ["c1", "c2"]}));
    let plan = c
        .run(Plan::new(
            "split",
            vec![split, node("c1", "noop", "sync"), node("c2", "noop", "sync")],
        ))
        .await;

    assert_eq!(c.finish(plan.id).await.status, Status::Succeeded);
    let nodes = c.nodes(plan.id).await;
    assert_eq!(nodes.len(), 3);
    let parent = nodes.iter().find(|n| n.node.id == "split").unwrap();
    let children: Vec<&NodeExecution> = nodes
        .iter()
        .filter(|n| n.parent_id == Some(parent.id))
        .collect();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|n| n.levels.len() == 2));
}

#[tokio::test]
async fn test_failed_remote_facilitation_is_connectivity_failure() {
    let c = cluster();
    let plan = c
        .run(Plan::new("x", vec![node("x", "charge", "billing_broken")]))
        .await;

    assert_eq!(c.finish(plan.id).await.status, Status::Failed);
    let info = c.nodes(plan.id).await[0].failure_info.clone().unwrap();
    assert_eq!(info.failure_types, vec![FailureType::Connectivity]);
    assert!(info.error_message.contains("rules service down"));
}

#[tokio::test]
async fn test_redelivered_step_response_applies_once() {
    let c = cluster();
    let plan = c
        .run(Plan::new("approve", vec![node("approve", "approval", "billing_async")]))
        .await;
    let waiting = c.await_status(plan.id, "approve", Status::Waiting).await;

    let client = c.module.client().clone();
    for _ in 0..3 {
        client
            .handle_step_response(waiting.id, StepResponse::succeeded())
            .await
            .unwrap();
    }

    assert_eq!(c.finish(plan.id).await.status, Status::Succeeded);
    let kinds = c.event_kinds(plan.id).await;
    assert_eq!(kinds.iter().filter(|k| **k == "plan_ended").count(), 1);
    assert!(!kinds.contains(&"duplicate_ignored"));

    let responses = client.accumulate_responses(waiting.id).await.unwrap();
    assert!(responses.is_empty());
}

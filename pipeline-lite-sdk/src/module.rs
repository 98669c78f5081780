//! Module host: runs steps, facilitators and advisers outside the core.
//!
//! Each event from the core is handled on its own task. Results travel back
//! through the [`SdkClient`]; a handler that fails reports the failure with
//! `HandleEventError` so the core can conclude the node or the round trip.

use crate::client::SdkClient;
use anyhow::{anyhow, Result};
use pipeline_lite_core::adviser::Adviser;
use pipeline_lite_core::error::failure_info_from;
use pipeline_lite_core::execution::{ChildDispatch, ExecutableResponse};
use pipeline_lite_core::facilitator::Facilitator;
use pipeline_lite_core::protocol::ModuleEvent;
use pipeline_lite_core::registry::Registries;
use pipeline_lite_core::remote::ModuleLink;
use pipeline_lite_core::step::{Step, StepInvocation};
use pipeline_lite_core::types::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct PipelineModule {
    name: String,
    client: SdkClient,
    steps: BTreeMap<String, Arc<dyn Step>>,
    facilitators: BTreeMap<String, Arc<dyn Facilitator>>,
    advisers: BTreeMap<String, Arc<dyn Adviser>>,
}

impl PipelineModule {
    pub fn new(name: impl Into<String>, client: SdkClient) -> Self {
        Self {
            name: name.into(),
            client,
            steps: BTreeMap::new(),
            facilitators: BTreeMap::new(),
            advisers: BTreeMap::new(),
        }
    }

    pub fn with_step(mut self, step_type: impl Into<String>, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step_type.into(), step);
        self
    }

    pub fn with_facilitator(
        mut self,
        facilitator_type: impl Into<String>,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        self.facilitators.insert(facilitator_type.into(), facilitator);
        self
    }

    pub fn with_adviser(
        mut self,
        adviser_type: impl Into<String>,
        adviser: Arc<dyn Adviser>,
    ) -> Self {
        self.advisers.insert(adviser_type.into(), adviser);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &SdkClient {
        &self.client
    }

    /// Bind every type this module hosts into the core's registries,
    /// proxied through `link`.
    pub fn register_with(&self, registries: &mut Registries, link: Arc<ModuleLink>) {
        let steps: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        let facilitators: Vec<&str> = self.facilitators.keys().map(String::as_str).collect();
        let advisers: Vec<&str> = self.advisers.keys().map(String::as_str).collect();
        registries.register_module(link, &steps, &facilitators, &advisers);
    }

    /// Handle `event` on a fresh task.
    pub fn spawn_event(self: &Arc<Self>, event: ModuleEvent) {
        let module = Arc::clone(self);
        tokio::spawn(async move {
            module.handle_event(event).await;
        });
    }

    /// Handle one event, reporting any failure back to the core.
    pub async fn handle_event(&self, event: ModuleEvent) {
        let kind = event.kind();
        tracing::debug!(module = %self.name, event = kind, "Module event received");
        let correlation = Correlation::of(&event);
        if let Err(e) = self.process(event).await {
            tracing::error!(
                module = %self.name,
                event = kind,
                error = %format!("{:#}", e),
                "Module event failed"
            );
            let failure_info = failure_info_from(&e);
            let reported = match &correlation {
                Correlation::Node(id) => self.client.node_event_error(*id, failure_info).await,
                Correlation::RoundTrip(notify_id) => {
                    self.client.round_trip_error(notify_id, failure_info).await
                }
            };
            if let Err(e) = reported {
                tracing::error!(module = %self.name, error = %e, "Failed to report module error");
            }
        }
    }

    async fn process(&self, event: ModuleEvent) -> Result<()> {
        match event {
            ModuleEvent::FacilitatorEvent {
                notify_id,
                facilitator_type,
                request,
            } => {
                let facilitator = self
                    .facilitators
                    .get(&facilitator_type)
                    .ok_or_else(|| {
                        anyhow!("Module {} hosts no facilitator '{}'", self.name, facilitator_type)
                    })?;
                let response = facilitator.facilitate(&request).await?;
                self.client
                    .handle_facilitation_response(&notify_id, response)
                    .await
            }
            ModuleEvent::AdviseEvent {
                notify_id,
                adviser_type,
                event,
            } => {
                let adviser = self
                    .advisers
                    .get(&adviser_type)
                    .ok_or_else(|| {
                        anyhow!("Module {} hosts no adviser '{}'", self.name, adviser_type)
                    })?;
                let advise = adviser.advise(&event).await?;
                self.client.handle_adviser_response(&notify_id, advise).await
            }
            ModuleEvent::NodeStart {
                node_execution_id,
                step_type,
                mode,
                invocation,
            } => {
                let step = self.step(&step_type)?;
                self.start(node_execution_id, &step, mode, &invocation).await
            }
            ModuleEvent::NodeResume {
                node_execution_id,
                step_type,
                mode,
                invocation,
                responses,
            } => {
                let step = self.step(&step_type)?;
                let response = match mode {
                    ExecutionMode::Sync => {
                        tracing::warn!(
                            node_execution_id = %node_execution_id,
                            "Resume of a SYNC node ignored"
                        );
                        return Ok(());
                    }
                    ExecutionMode::Async => {
                        step.handle_async_response(&invocation, &responses).await?
                    }
                    ExecutionMode::Task => step.handle_task_result(&invocation, &responses).await?,
                    ExecutionMode::Child => {
                        step.handle_child_response(&invocation, &responses).await?
                    }
                    ExecutionMode::Children => {
                        step.handle_children_response(&invocation, &responses).await?
                    }
                };
                self.client
                    .handle_step_response(node_execution_id, response)
                    .await
            }
        }
    }

    fn step(&self, step_type: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(step_type)
            .cloned()
            .ok_or_else(|| anyhow!("Module {} hosts no step '{}'", self.name, step_type))
    }

    async fn start(
        &self,
        id: Uuid,
        step: &Arc<dyn Step>,
        mode: ExecutionMode,
        invocation: &StepInvocation,
    ) -> Result<()> {
        match mode {
            ExecutionMode::Sync => {
                let response = step.execute_sync(invocation).await?;
                self.client.handle_step_response(id, response).await
            }
            ExecutionMode::Async => {
                let pending = step.execute_async(invocation).await?;
                self.client
                    .add_executable_response(
                        id,
                        ExecutableResponse::Async {
                            callback_ids: pending.callback_ids,
                            timeout_ms: pending.timeout_ms,
                        },
                    )
                    .await
            }
            ExecutionMode::Task => {
                let request = step.obtain_task(invocation).await?;
                let task_id = self.client.queue_task(id, request).await?;
                tracing::debug!(node_execution_id = %id, task_id = %task_id, "Task queued");
                Ok(())
            }
            ExecutionMode::Child => {
                let request = step.obtain_child(invocation).await?;
                let child = ChildDispatch {
                    child_node_id: request.child_node_id,
                    notify_id: child_notify_id(id, 0),
                };
                self.client
                    .add_executable_response(
                        id,
                        ExecutableResponse::Child {
                            child_node_id: child.child_node_id.clone(),
                            notify_id: child.notify_id.clone(),
                        },
                    )
                    .await?;
                self.client
                    .queue_node_execution(id, &child.child_node_id, &child.notify_id)
                    .await?;
                Ok(())
            }
            ExecutionMode::Children => {
                let request = step.obtain_children(invocation).await?;
                let children: Vec<ChildDispatch> = request
                    .child_node_ids
                    .into_iter()
                    .enumerate()
                    .map(|(i, child_node_id)| ChildDispatch {
                        child_node_id,
                        notify_id: child_notify_id(id, i),
                    })
                    .collect();
                self.client
                    .add_executable_response(
                        id,
                        ExecutableResponse::Children {
                            children: children.clone(),
                        },
                    )
                    .await?;
                for child in &children {
                    self.client
                        .queue_node_execution(id, &child.child_node_id, &child.notify_id)
                        .await?;
                }
                Ok(())
            }
        }
    }
}

/// Deterministic per parent, so a redelivered start produces the same
/// requests and the core deduplicates them.
fn child_notify_id(parent: Uuid, index: usize) -> CorrelationId {
    format!("{}-child-{}", parent, index)
}

enum Correlation {
    Node(Uuid),
    RoundTrip(CorrelationId),
}

impl Correlation {
    fn of(event: &ModuleEvent) -> Self {
        match event {
            ModuleEvent::FacilitatorEvent { notify_id, .. }
            | ModuleEvent::AdviseEvent { notify_id, .. } => Self::RoundTrip(notify_id.clone()),
            ModuleEvent::NodeStart {
                node_execution_id, ..
            }
            | ModuleEvent::NodeResume {
                node_execution_id, ..
            } => Self::Node(*node_execution_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipeline_lite_core::ambiance::Ambiance;
    use pipeline_lite_core::protocol::{CoreChannel, SdkReply, SdkRequest};
    use pipeline_lite_core::step::ChildrenRequest;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Core stand-in that records requests and acks them.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SdkRequest>>,
    }

    #[async_trait]
    impl CoreChannel for Recorder {
        async fn call(&self, request: SdkRequest) -> Result<SdkReply> {
            let reply = match &request {
                SdkRequest::QueueNodeExecution { .. } => SdkReply::NodeQueued {
                    node_execution_id: Uuid::now_v7(),
                },
                _ => SdkReply::Ack,
            };
            self.seen.lock().unwrap().push(request);
            Ok(reply)
        }
    }

    struct Pair;

    #[async_trait]
    impl Step for Pair {
        async fn obtain_children(&self, _invocation: &StepInvocation) -> Result<ChildrenRequest> {
            Ok(ChildrenRequest {
                child_node_ids: vec!["left".into(), "right".into()],
            })
        }
    }

    fn invocation() -> StepInvocation {
        StepInvocation {
            ambiance: Ambiance::new(Uuid::now_v7(), BTreeMap::new()),
            parameters: Value::Null,
            inputs: StepInputs::new(),
            pass_through_data: None,
        }
    }

    fn module(core: Arc<Recorder>) -> PipelineModule {
        PipelineModule::new("m", SdkClient::new(core)).with_step("pair", Arc::new(Pair))
    }

    #[tokio::test]
    async fn test_children_start_parks_then_queues() {
        let core = Arc::new(Recorder::default());
        let id = Uuid::now_v7();
        module(core.clone())
            .handle_event(ModuleEvent::NodeStart {
                node_execution_id: id,
                step_type: "pair".into(),
                mode: ExecutionMode::Children,
                invocation: invocation(),
            })
            .await;

        let seen = core.seen.lock().unwrap();
        let kinds: Vec<&str> = seen.iter().map(SdkRequest::kind).collect();
        assert_eq!(
            kinds,
            vec!["AddExecutableResponse", "QueueNodeExecution", "QueueNodeExecution"]
        );
        assert!(matches!(
            &seen[1],
            SdkRequest::QueueNodeExecution { notify_id, .. } if *notify_id == child_notify_id(id, 0)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_mode_reported_as_event_error() {
        let core = Arc::new(Recorder::default());
        let id = Uuid::now_v7();
        module(core.clone())
            .handle_event(ModuleEvent::NodeStart {
                node_execution_id: id,
                step_type: "pair".into(),
                mode: ExecutionMode::Sync,
                invocation: invocation(),
            })
            .await;

        let seen = core.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            SdkRequest::HandleEventError {
                node_execution_id,
                failure_info,
                ..
            } => {
                assert_eq!(*node_execution_id, Some(id));
                assert!(failure_info.is_configuration());
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_unknown_facilitator_fails_round_trip() {
        let core = Arc::new(Recorder::default());
        module(core.clone())
            .handle_event(ModuleEvent::FacilitatorEvent {
                notify_id: "facilitate-1".into(),
                facilitator_type: "nope".into(),
                request: pipeline_lite_core::facilitator::FacilitationRequest {
                    ambiance: Ambiance::new(Uuid::now_v7(), BTreeMap::new()),
                    parameters: Value::Null,
                    step_parameters: Value::Null,
                    inputs: StepInputs::new(),
                },
            })
            .await;

        let seen = core.seen.lock().unwrap();
        assert!(matches!(
            &seen[0],
            SdkRequest::HandleEventError { notify_id: Some(n), .. } if n == "facilitate-1"
        ));
    }
}

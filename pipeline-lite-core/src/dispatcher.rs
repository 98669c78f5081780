//! Core-side handler for module requests.
//!
//! Every mutating request is deduplicated on its idempotency key before it
//! reaches the engine, so a module may redeliver freely. Only successful
//! replies are remembered; a failed request can be retried.

use crate::engine::ExecutionEngine;
use crate::protocol::{CoreChannel, SdkReply, SdkRequest};
use crate::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SdkRequestDispatcher {
    engine: Arc<ExecutionEngine>,
}

impl SdkRequestDispatcher {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    pub async fn dispatch(&self, request: SdkRequest) -> Result<SdkReply> {
        if request.is_read_only() {
            return self.route(request).await;
        }

        let key = request.idempotency_key()?;
        if let Some(cached) = self.engine.store().dedupe_get(&key).await? {
            info!(
                request = request.kind(),
                correlation = %request.correlation(),
                "Duplicate request, replaying reply"
            );
            return serde_json::from_value(cached).context("Decoding cached reply");
        }

        let kind = request.kind();
        let correlation = request.correlation();
        let reply = self.route(request).await?;
        let encoded = serde_json::to_value(&reply).context("Encoding reply")?;
        let valid_until = now() + self.engine.config().dedupe_retention();
        self.engine
            .store()
            .dedupe_put(&key, &encoded, valid_until)
            .await?;
        debug!(request = kind, correlation = %correlation, "Request handled");
        Ok(reply)
    }

    async fn route(&self, request: SdkRequest) -> Result<SdkReply> {
        let engine = &self.engine;
        match request {
            SdkRequest::QueueNodeExecution {
                parent_node_execution_id,
                child_node_id,
                notify_id,
            } => {
                let node_execution_id = engine
                    .queue_child_execution(parent_node_execution_id, &child_node_id, &notify_id)
                    .await?;
                Ok(SdkReply::NodeQueued { node_execution_id })
            }
            SdkRequest::AddExecutableResponse {
                node_execution_id,
                response,
            } => {
                engine
                    .add_executable_response(node_execution_id, response)
                    .await?;
                Ok(SdkReply::Ack)
            }
            SdkRequest::HandleStepResponse {
                node_execution_id,
                step_response,
            } => {
                engine
                    .handle_step_response(node_execution_id, step_response)
                    .await?;
                Ok(SdkReply::Ack)
            }
            SdkRequest::ResumeNodeExecution {
                node_execution_id,
                responses,
                async_error,
            } => {
                engine
                    .resume(node_execution_id, responses, async_error)
                    .await?;
                Ok(SdkReply::Ack)
            }
            SdkRequest::QueueTask {
                node_execution_id,
                task,
            } => {
                let task_id = engine.queue_task_for(node_execution_id, task).await?;
                Ok(SdkReply::TaskQueued { task_id })
            }
            SdkRequest::HandleFacilitationResponse {
                notify_id,
                response,
            } => {
                let value = serde_json::to_value(response).context("Encoding facilitation")?;
                self.complete_reply(&notify_id, Ok(value))?;
                Ok(SdkReply::Ack)
            }
            SdkRequest::HandleAdviserResponse { notify_id, advise } => {
                let value = serde_json::to_value(advise).context("Encoding advise")?;
                self.complete_reply(&notify_id, Ok(value))?;
                Ok(SdkReply::Ack)
            }
            SdkRequest::AccumulateResponses { node_execution_id } => {
                let responses = engine.accumulate_responses(node_execution_id).await?;
                Ok(SdkReply::Responses { responses })
            }
            SdkRequest::HandleEventError {
                node_execution_id,
                notify_id,
                failure_info,
            } => {
                if let Some(notify_id) = notify_id {
                    self.complete_reply(&notify_id, Err(failure_info.error_message.clone()))?;
                } else if let Some(id) = node_execution_id {
                    warn!(
                        node_execution_id = %id,
                        error = %failure_info.error_message,
                        "Module failed to handle node event"
                    );
                    engine
                        .handle_step_response(id, StepResponse::failed(failure_info))
                        .await?;
                } else {
                    warn!(
                        error = %failure_info.error_message,
                        "Event error without correlation ignored"
                    );
                }
                Ok(SdkReply::Ack)
            }
        }
    }

    /// Hand a round-trip reply to whichever module link is waiting for it.
    fn complete_reply(
        &self,
        notify_id: &str,
        result: std::result::Result<Value, String>,
    ) -> Result<()> {
        for link in self.engine.registries().modules() {
            if link.is_pending(notify_id)? {
                link.complete_reply(notify_id, result)?;
                return Ok(());
            }
        }
        warn!(notify_id = %notify_id, "Reply for unknown or expired round trip dropped");
        Ok(())
    }
}

#[async_trait]
impl CoreChannel for SdkRequestDispatcher {
    async fn call(&self, request: SdkRequest) -> Result<SdkReply> {
        self.dispatch(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::plan::{FacilitatorObtainment, Plan, PlanNode, StepType};
    use crate::registry::Registries;
    use crate::store::ExecutionStore;
    use crate::store_memory::MemoryStore;
    use crate::task::MemoryTaskQueue;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::watch;
    use uuid::Uuid;

    async fn setup() -> (
        SdkRequestDispatcher,
        Arc<ExecutionEngine>,
        Arc<MemoryStore>,
        watch::Sender<bool>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let engine = ExecutionEngine::new(
            EngineConfig::default(),
            store.clone(),
            Registries::with_defaults(store.clone()),
            Arc::new(MemoryTaskQueue::new()),
        )
        .unwrap();
        let (tx, rx) = watch::channel(false);
        engine.spawn_listener(rx).unwrap();
        (SdkRequestDispatcher::new(engine.clone()), engine, store, tx)
    }

    /// Start a one-node async plan and return its node execution once it waits.
    async fn waiting_node(engine: &Arc<ExecutionEngine>, store: &Arc<MemoryStore>) -> (Uuid, Uuid) {
        let node = PlanNode::new("a", StepType::new("fork"))
            .with_parameters(serde_json::json!({"child_node_ids": []}))
            .with_facilitator(FacilitatorObtainment::of("children"));
        let plan = engine
            .start_execution(Plan::new("a", vec![node]), BTreeMap::new(), "t")
            .await
            .unwrap();
        let poll = async {
            loop {
                let nodes = store.fetch_node_executions(plan.id).await.unwrap();
                if let Some(ne) = nodes.first() {
                    return ne.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let id = tokio::time::timeout(Duration::from_secs(5), poll).await.unwrap();
        (plan.id, id)
    }

    #[tokio::test]
    async fn test_redelivered_step_response_replays_reply() {
        let (dispatcher, engine, store, _tx) = setup().await;
        let (plan_id, id) = waiting_node(&engine, &store).await;
        engine.wait_until_finished(plan_id, Duration::from_secs(5)).await.unwrap();

        let request = SdkRequest::HandleStepResponse {
            node_execution_id: id,
            step_response: StepResponse::failed(FailureInfo::new("late", FailureType::Application)),
        };
        assert_eq!(dispatcher.call(request.clone()).await.unwrap(), SdkReply::Ack);
        assert_eq!(dispatcher.call(request.clone()).await.unwrap(), SdkReply::Ack);

        let key = request.idempotency_key().unwrap();
        assert!(store.dedupe_get(&key).await.unwrap().is_some());
        let ne = store.load_node_execution(id).await.unwrap().unwrap();
        assert_eq!(ne.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_request_not_cached() {
        let (dispatcher, _engine, store, _tx) = setup().await;
        let request = SdkRequest::HandleStepResponse {
            node_execution_id: Uuid::now_v7(),
            step_response: StepResponse::succeeded(),
        };
        assert!(dispatcher.call(request.clone()).await.is_err());
        let key = request.idempotency_key().unwrap();
        assert!(store.dedupe_get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accumulate_responses_is_read_only() {
        let (dispatcher, engine, store, _tx) = setup().await;
        let (_plan_id, id) = waiting_node(&engine, &store).await;
        let request = SdkRequest::AccumulateResponses {
            node_execution_id: id,
        };
        let reply = dispatcher.call(request.clone()).await.unwrap();
        assert!(matches!(reply, SdkReply::Responses { .. }));
        let key = request.idempotency_key().unwrap();
        assert!(store.dedupe_get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_for_unknown_round_trip_is_acked() {
        let (dispatcher, _engine, _store, _tx) = setup().await;
        let reply = dispatcher
            .call(SdkRequest::HandleAdviserResponse {
                notify_id: "advise-gone".into(),
                advise: None,
            })
            .await
            .unwrap();
        assert_eq!(reply, SdkReply::Ack);
    }
}

//! In-process transport pairing a core endpoint with a module endpoint.
//!
//! Both directions are bounded mpsc queues. Requests carry a oneshot for the
//! reply; events are fire-and-forget. Each inbox is drained by a run loop
//! that stops on its shutdown signal.

use crate::module::PipelineModule;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pipeline_lite_core::protocol::{CoreChannel, ModuleChannel, ModuleEvent, SdkReply, SdkRequest};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

struct Envelope {
    request: SdkRequest,
    reply: oneshot::Sender<Result<SdkReply>>,
}

/// Core → module sender. Hand it to a `ModuleLink`.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ModuleEvent>,
}

#[async_trait]
impl ModuleChannel for EventSender {
    async fn send(&self, event: ModuleEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("Module endpoint closed"))
    }
}

/// Module → core sender. Hand it to an `SdkClient`.
#[derive(Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl CoreChannel for RequestSender {
    async fn call(&self, request: SdkRequest) -> Result<SdkReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| anyhow!("Core endpoint closed"))?;
        rx.await.map_err(|_| anyhow!("Core dropped the request"))?
    }
}

/// Receiving end on the core side.
pub struct CoreInbox {
    rx: mpsc::Receiver<Envelope>,
}

impl CoreInbox {
    /// Serve requests with `handler` (normally the engine's dispatcher) until
    /// shutdown. Each request is handled on its own task.
    pub async fn run(
        mut self,
        handler: Arc<dyn CoreChannel>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!("Core inbox started");
        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(Envelope { request, reply }) = envelope else {
                        break;
                    };
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let kind = request.kind();
                        let result = handler.call(request).await;
                        if let Err(e) = &result {
                            tracing::warn!(
                                request = kind,
                                error = %format!("{:#}", e),
                                "Request failed"
                            );
                        }
                        // Caller may have given up; nothing to do then.
                        let _ = reply.send(result);
                    });
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("Core inbox shutting down");
                    break;
                }
            }
        }
        tracing::info!("Core inbox stopped");
    }
}

/// Receiving end on the module side.
pub struct ModuleInbox {
    rx: mpsc::Receiver<ModuleEvent>,
}

impl ModuleInbox {
    /// Feed events to `module` until shutdown.
    pub async fn run(
        mut self,
        module: Arc<PipelineModule>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(module = %module.name(), "Module inbox started");
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => module.spawn_event(event),
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    tracing::info!(module = %module.name(), "Module inbox shutting down");
                    break;
                }
            }
        }
        tracing::info!(module = %module.name(), "Module inbox stopped");
    }
}

pub struct InProcessTransport {
    pub events: EventSender,
    pub requests: RequestSender,
    pub core_inbox: CoreInbox,
    pub module_inbox: ModuleInbox,
}

/// Both directions of one core ↔ module connection.
pub fn in_process(capacity: usize) -> InProcessTransport {
    let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
    let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
    InProcessTransport {
        events: EventSender { tx: event_tx },
        requests: RequestSender { tx: request_tx },
        core_inbox: CoreInbox { rx: request_rx },
        module_inbox: ModuleInbox { rx: event_rx },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CoreChannel for Echo {
        async fn call(&self, request: SdkRequest) -> Result<SdkReply> {
            match request {
                SdkRequest::AccumulateResponses { .. } => Ok(SdkReply::Responses {
                    responses: Default::default(),
                }),
                other => Err(anyhow!("rejected {}", other.kind())),
            }
        }
    }

    #[tokio::test]
    async fn test_request_round_trip_and_shutdown() {
        let transport = in_process(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(transport.core_inbox.run(Arc::new(Echo), shutdown_rx));

        let reply = transport
            .requests
            .call(SdkRequest::AccumulateResponses {
                node_execution_id: uuid::Uuid::now_v7(),
            })
            .await
            .unwrap();
        assert!(matches!(reply, SdkReply::Responses { .. }));

        let err = transport
            .requests
            .call(SdkRequest::HandleAdviserResponse {
                notify_id: "n".into(),
                advise: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HandleAdviserResponse"));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
        assert!(transport
            .requests
            .call(SdkRequest::AccumulateResponses {
                node_execution_id: uuid::Uuid::now_v7(),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_event_send_fails_once_module_side_dropped() {
        let InProcessTransport {
            events,
            module_inbox,
            ..
        } = in_process(1);
        drop(module_inbox);
        let event = ModuleEvent::NodeResume {
            node_execution_id: uuid::Uuid::now_v7(),
            step_type: "x".into(),
            mode: pipeline_lite_core::types::ExecutionMode::Async,
            invocation: pipeline_lite_core::step::StepInvocation {
                ambiance: pipeline_lite_core::ambiance::Ambiance::new(
                    uuid::Uuid::now_v7(),
                    Default::default(),
                ),
                parameters: serde_json::Value::Null,
                inputs: Default::default(),
                pass_through_data: None,
            },
            responses: Default::default(),
        };
        assert!(events.send(event).await.is_err());
    }
}

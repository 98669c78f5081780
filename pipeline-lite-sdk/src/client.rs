//! Typed client for the module → core messages.

use anyhow::{anyhow, Result};
use pipeline_lite_core::adviser::Advise;
use pipeline_lite_core::execution::ExecutableResponse;
use pipeline_lite_core::facilitator::FacilitatorResponse;
use pipeline_lite_core::protocol::{CoreChannel, SdkReply, SdkRequest};
use pipeline_lite_core::step::TaskRequest;
use pipeline_lite_core::types::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Wraps a [`CoreChannel`] with one method per message.
///
/// Transport failures are retried with a linear backoff. This is safe for
/// every message: the core answers a redelivered request with the reply it
/// gave the first time.
#[derive(Clone)]
pub struct SdkClient {
    core: Arc<dyn CoreChannel>,
    retries: u32,
    backoff: Duration,
}

impl SdkClient {
    pub fn new(core: Arc<dyn CoreChannel>) -> Self {
        Self {
            core,
            retries: 0,
            backoff: Duration::from_millis(50),
        }
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    async fn call(&self, request: SdkRequest) -> Result<SdkReply> {
        let mut attempt = 0;
        loop {
            match self.core.call(request.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        request = request.kind(),
                        correlation = %request.correlation(),
                        attempt,
                        error = %e,
                        "Core call failed, retrying"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ack(&self, request: SdkRequest) -> Result<()> {
        let kind = request.kind();
        match self.call(request).await? {
            SdkReply::Ack => Ok(()),
            other => Err(anyhow!("Unexpected reply to {}: {:?}", kind, other)),
        }
    }

    pub async fn queue_node_execution(
        &self,
        parent_node_execution_id: Uuid,
        child_node_id: &str,
        notify_id: &str,
    ) -> Result<Uuid> {
        let reply = self
            .call(SdkRequest::QueueNodeExecution {
                parent_node_execution_id,
                child_node_id: child_node_id.to_string(),
                notify_id: notify_id.to_string(),
            })
            .await?;
        match reply {
            SdkReply::NodeQueued { node_execution_id } => Ok(node_execution_id),
            other => Err(anyhow!("Unexpected reply to QueueNodeExecution: {:?}", other)),
        }
    }

    pub async fn add_executable_response(
        &self,
        node_execution_id: Uuid,
        response: ExecutableResponse,
    ) -> Result<()> {
        self.ack(SdkRequest::AddExecutableResponse {
            node_execution_id,
            response,
        })
        .await
    }

    pub async fn handle_step_response(
        &self,
        node_execution_id: Uuid,
        step_response: StepResponse,
    ) -> Result<()> {
        self.ack(SdkRequest::HandleStepResponse {
            node_execution_id,
            step_response,
        })
        .await
    }

    pub async fn resume_node_execution(
        &self,
        node_execution_id: Uuid,
        responses: ResponseMap,
        async_error: bool,
    ) -> Result<()> {
        self.ack(SdkRequest::ResumeNodeExecution {
            node_execution_id,
            responses,
            async_error,
        })
        .await
    }

    pub async fn queue_task(
        &self,
        node_execution_id: Uuid,
        task: TaskRequest,
    ) -> Result<CorrelationId> {
        match self
            .call(SdkRequest::QueueTask {
                node_execution_id,
                task,
            })
            .await?
        {
            SdkReply::TaskQueued { task_id } => Ok(task_id),
            other => Err(anyhow!("Unexpected reply to QueueTask: {:?}", other)),
        }
    }

    pub async fn handle_facilitation_response(
        &self,
        notify_id: &str,
        response: Option<FacilitatorResponse>,
    ) -> Result<()> {
        self.ack(SdkRequest::HandleFacilitationResponse {
            notify_id: notify_id.to_string(),
            response,
        })
        .await
    }

    pub async fn handle_adviser_response(
        &self,
        notify_id: &str,
        advise: Option<Advise>,
    ) -> Result<()> {
        self.ack(SdkRequest::HandleAdviserResponse {
            notify_id: notify_id.to_string(),
            advise,
        })
        .await
    }

    pub async fn accumulate_responses(&self, node_execution_id: Uuid) -> Result<ResponseMap> {
        match self
            .call(SdkRequest::AccumulateResponses { node_execution_id })
            .await?
        {
            SdkReply::Responses { responses } => Ok(responses),
            other => Err(anyhow!("Unexpected reply to AccumulateResponses: {:?}", other)),
        }
    }

    /// Report that handling a node event failed.
    pub async fn node_event_error(
        &self,
        node_execution_id: Uuid,
        failure_info: FailureInfo,
    ) -> Result<()> {
        self.ack(SdkRequest::HandleEventError {
            node_execution_id: Some(node_execution_id),
            notify_id: None,
            failure_info,
        })
        .await
    }

    /// Report that answering a facilitation or advise round trip failed.
    pub async fn round_trip_error(&self, notify_id: &str, failure_info: FailureInfo) -> Result<()> {
        self.ack(SdkRequest::HandleEventError {
            node_execution_id: None,
            notify_id: Some(notify_id.to_string()),
            failure_info,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then acks.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<SdkRequest>>,
    }

    #[async_trait]
    impl CoreChannel for Flaky {
        async fn call(&self, request: SdkRequest) -> Result<SdkReply> {
            self.seen.lock().unwrap().push(request);
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow!("connection reset"));
            }
            Ok(SdkReply::Ack)
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_redeliver_same_request() {
        let core = flaky(2);
        let client = SdkClient::new(core.clone()).with_retries(3, Duration::from_millis(10));
        client
            .handle_step_response(Uuid::now_v7(), StepResponse::succeeded())
            .await
            .unwrap();

        let seen = core.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|r| *r == seen[0]));
    }

    #[tokio::test]
    async fn test_gives_up_without_retries() {
        let client = SdkClient::new(flaky(1));
        assert!(client
            .handle_adviser_response("advise-1", Some(Advise::End))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mismatched_reply_is_error() {
        let client = SdkClient::new(flaky(0));
        let err = client
            .queue_node_execution(Uuid::now_v7(), "child", "n-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("QueueNodeExecution"));
    }
}

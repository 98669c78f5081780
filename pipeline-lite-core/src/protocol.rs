//! Distributed execution protocol.
//!
//! Modules host steps, facilitators and advisers out of the core process.
//! The core sends them [`ModuleEvent`]s; they answer with [`SdkRequest`]s,
//! each carrying the node execution id or notify id it belongs to. Delivery
//! is at-least-once in both directions.

use crate::adviser::{Advise, AdvisingEvent};
use crate::execution::ExecutableResponse;
use crate::facilitator::{FacilitationRequest, FacilitatorResponse};
use crate::step::{StepInvocation, TaskRequest};
use crate::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ── Module → core ──

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SdkRequest {
    /// Trigger a child node on behalf of a waiting parent.
    QueueNodeExecution {
        parent_node_execution_id: Uuid,
        child_node_id: String,
        notify_id: CorrelationId,
    },
    /// Record what the step left running and park the node on it.
    AddExecutableResponse {
        node_execution_id: Uuid,
        response: ExecutableResponse,
    },
    HandleStepResponse {
        node_execution_id: Uuid,
        step_response: StepResponse,
    },
    ResumeNodeExecution {
        node_execution_id: Uuid,
        #[serde(default)]
        responses: ResponseMap,
        #[serde(default)]
        async_error: bool,
    },
    QueueTask {
        node_execution_id: Uuid,
        task: TaskRequest,
    },
    HandleFacilitationResponse {
        notify_id: CorrelationId,
        response: Option<FacilitatorResponse>,
    },
    HandleAdviserResponse {
        notify_id: CorrelationId,
        advise: Option<Advise>,
    },
    /// Responses delivered so far for what a node is waiting on.
    AccumulateResponses { node_execution_id: Uuid },
    /// The module failed to handle an event. Exactly one of the ids is set.
    HandleEventError {
        #[serde(default)]
        node_execution_id: Option<Uuid>,
        #[serde(default)]
        notify_id: Option<CorrelationId>,
        failure_info: FailureInfo,
    },
}

impl SdkRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueNodeExecution { .. } => "QueueNodeExecution",
            Self::AddExecutableResponse { .. } => "AddExecutableResponse",
            Self::HandleStepResponse { .. } => "HandleStepResponse",
            Self::ResumeNodeExecution { .. } => "ResumeNodeExecution",
            Self::QueueTask { .. } => "QueueTask",
            Self::HandleFacilitationResponse { .. } => "HandleFacilitationResponse",
            Self::HandleAdviserResponse { .. } => "HandleAdviserResponse",
            Self::AccumulateResponses { .. } => "AccumulateResponses",
            Self::HandleEventError { .. } => "HandleEventError",
        }
    }

    /// Correlation key for logs.
    pub fn correlation(&self) -> String {
        match self {
            Self::QueueNodeExecution { notify_id, .. }
            | Self::HandleFacilitationResponse { notify_id, .. }
            | Self::HandleAdviserResponse { notify_id, .. } => notify_id.clone(),
            Self::AddExecutableResponse {
                node_execution_id, ..
            }
            | Self::HandleStepResponse {
                node_execution_id, ..
            }
            | Self::ResumeNodeExecution {
                node_execution_id, ..
            }
            | Self::QueueTask {
                node_execution_id, ..
            }
            | Self::AccumulateResponses { node_execution_id } => node_execution_id.to_string(),
            Self::HandleEventError {
                node_execution_id,
                notify_id,
                ..
            } => notify_id
                .clone()
                .or_else(|| node_execution_id.map(|id| id.to_string()))
                .unwrap_or_default(),
        }
    }

    /// Reads are answered fresh every time and never cached.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::AccumulateResponses { .. })
    }

    /// SHA-256 over the canonical JSON of the request.
    pub fn idempotency_key(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self).context("Serializing request for dedupe")?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SdkReply {
    Ack,
    NodeQueued { node_execution_id: Uuid },
    TaskQueued { task_id: CorrelationId },
    Responses { responses: ResponseMap },
}

// ── Core → module ──

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModuleEvent {
    FacilitatorEvent {
        notify_id: CorrelationId,
        facilitator_type: String,
        request: FacilitationRequest,
    },
    AdviseEvent {
        notify_id: CorrelationId,
        adviser_type: String,
        event: AdvisingEvent,
    },
    NodeStart {
        node_execution_id: Uuid,
        step_type: String,
        mode: ExecutionMode,
        invocation: StepInvocation,
    },
    NodeResume {
        node_execution_id: Uuid,
        step_type: String,
        mode: ExecutionMode,
        invocation: StepInvocation,
        responses: ResponseMap,
    },
}

impl ModuleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FacilitatorEvent { .. } => "FacilitatorEvent",
            Self::AdviseEvent { .. } => "AdviseEvent",
            Self::NodeStart { .. } => "NodeStart",
            Self::NodeResume { .. } => "NodeResume",
        }
    }
}

// ── Channels ──

/// Core → module direction. Fire-and-forget: answers come back as
/// [`SdkRequest`]s through the module's [`CoreChannel`].
#[async_trait]
pub trait ModuleChannel: Send + Sync {
    async fn send(&self, event: ModuleEvent) -> Result<()>;
}

/// Module → core direction.
#[async_trait]
pub trait CoreChannel: Send + Sync {
    async fn call(&self, request: SdkRequest) -> Result<SdkReply>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_stable_and_distinct() {
        let id = Uuid::now_v7();
        let a = SdkRequest::HandleStepResponse {
            node_execution_id: id,
            step_response: StepResponse::succeeded(),
        };
        let b = SdkRequest::HandleStepResponse {
            node_execution_id: id,
            step_response: StepResponse::with_status(Status::Failed),
        };
        assert_eq!(a.idempotency_key().unwrap(), a.clone().idempotency_key().unwrap());
        assert_ne!(a.idempotency_key().unwrap(), b.idempotency_key().unwrap());
        assert_eq!(a.idempotency_key().unwrap().len(), 64);
    }

    #[test]
    fn test_request_envelope_tagging() {
        let req = SdkRequest::HandleFacilitationResponse {
            notify_id: "n-1".into(),
            response: Some(FacilitatorResponse::mode(ExecutionMode::Sync)),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "HandleFacilitationResponse");
        assert_eq!(json["response"]["execution_mode"], "SYNC");
        assert_eq!(req.correlation(), "n-1");
    }
}

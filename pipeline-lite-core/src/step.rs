//! Step trait: the unit of business logic the engine drives.
//!
//! A step implements only the modes it supports; every other mode answers
//! with [`EngineError::UnsupportedMode`], which ends the node as a
//! configuration failure.

use crate::ambiance::Ambiance;
use crate::error::EngineError;
use crate::plan::{CHILDREN_NODES_PARAM, CHILD_NODE_PARAM};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything a step sees when it is started or resumed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub ambiance: Ambiance,
    /// Step parameters after expression rendering.
    pub parameters: Value,
    pub inputs: StepInputs,
    #[serde(default)]
    pub pass_through_data: Option<Value>,
}

impl StepInvocation {
    pub fn step_type(&self) -> &str {
        self.ambiance
            .current_level()
            .map(|l| l.step_type.as_str())
            .unwrap_or_default()
    }

    fn unsupported(&self, mode: ExecutionMode) -> anyhow::Error {
        EngineError::UnsupportedMode {
            step_type: self.step_type().to_string(),
            mode,
        }
        .into()
    }
}

// ─── Mode requests ────────────────────────────────────────────

/// Returned by an async step: the callback ids the node will wait on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<CorrelationId>,
    /// Give up waiting after this long; the node resumes with an EXPIRED error.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Work a TASK step wants queued for a delegate executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub child_node_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildrenRequest {
    pub child_node_ids: Vec<String>,
}

// ─── Step trait ───────────────────────────────────────────────

#[async_trait]
pub trait Step: Send + Sync {
    async fn execute_sync(&self, invocation: &StepInvocation) -> Result<StepResponse> {
        Err(invocation.unsupported(ExecutionMode::Sync))
    }

    async fn execute_async(&self, invocation: &StepInvocation) -> Result<AsyncExecutableResponse> {
        Err(invocation.unsupported(ExecutionMode::Async))
    }

    async fn handle_async_response(
        &self,
        _invocation: &StepInvocation,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        Ok(response_from_callbacks(responses))
    }

    async fn obtain_task(&self, invocation: &StepInvocation) -> Result<TaskRequest> {
        Err(invocation.unsupported(ExecutionMode::Task))
    }

    async fn handle_task_result(
        &self,
        _invocation: &StepInvocation,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        Ok(response_from_callbacks(responses))
    }

    async fn obtain_child(&self, invocation: &StepInvocation) -> Result<ChildRequest> {
        Err(invocation.unsupported(ExecutionMode::Child))
    }

    async fn handle_child_response(
        &self,
        _invocation: &StepInvocation,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        Ok(aggregate_child_responses(responses))
    }

    async fn obtain_children(&self, invocation: &StepInvocation) -> Result<ChildrenRequest> {
        Err(invocation.unsupported(ExecutionMode::Children))
    }

    async fn handle_children_response(
        &self,
        _invocation: &StepInvocation,
        responses: &ResponseMap,
    ) -> Result<StepResponse> {
        Ok(aggregate_child_responses(responses))
    }
}

// ─── Default response handling ────────────────────────────────

/// Combine the notify payloads of finished children into one response.
///
/// Status is the aggregate of the children's statuses; failure messages are
/// joined in correlation-id order.
pub fn aggregate_child_responses(responses: &ResponseMap) -> StepResponse {
    let mut statuses = Vec::with_capacity(responses.len());
    let mut messages = Vec::new();
    let mut failure_types = Vec::new();
    for data in responses.values() {
        match data {
            ResponseData::StepNotify(notify) => {
                statuses.push(notify.status);
                if let Some(info) = &notify.failure_info {
                    messages.push(format!("{}: {}", notify.identifier, info.error_message));
                    extend_unique(&mut failure_types, &info.failure_types);
                }
            }
            ResponseData::Error(info) => {
                statuses.push(Status::Errored);
                messages.push(info.error_message.clone());
                extend_unique(&mut failure_types, &info.failure_types);
            }
            _ => statuses.push(Status::Succeeded),
        }
    }
    let status = Status::aggregate(&statuses);
    let failure_info = if status.is_broken() {
        if failure_types.is_empty() {
            failure_types.push(FailureType::Application);
        }
        Some(FailureInfo {
            error_message: messages.join("; "),
            failure_types,
        })
    } else {
        None
    };
    StepResponse {
        status,
        step_outcomes: Vec::new(),
        failure_info,
    }
}

fn extend_unique(into: &mut Vec<FailureType>, from: &[FailureType]) {
    for t in from {
        if !into.contains(t) {
            into.push(*t);
        }
    }
}

/// Default handling for async callbacks and task results: fail on the first
/// error, otherwise succeed publishing each payload as an outcome named after
/// its correlation id.
pub fn response_from_callbacks(responses: &ResponseMap) -> StepResponse {
    for data in responses.values() {
        match data {
            ResponseData::Error(info) => return StepResponse::failed(info.clone()),
            ResponseData::Task(result) if result.status != TaskStatus::Completed => {
                let failure_type = if result.status == TaskStatus::Expired {
                    FailureType::Expired
                } else {
                    FailureType::Application
                };
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("task {} {}", result.task_id, result.status));
                return StepResponse::failed(FailureInfo::new(message, failure_type));
            }
            _ => {}
        }
    }
    let mut response = StepResponse::succeeded();
    for (id, data) in responses {
        let payload = match data {
            ResponseData::Custom { payload } => Some(payload.clone()),
            ResponseData::Task(result) => result.payload.clone(),
            _ => None,
        };
        if let Some(payload) = payload {
            response = response.with_outcome(id.clone(), payload);
        }
    }
    response
}

// ─── Built-in steps ───────────────────────────────────────────

/// Does nothing and succeeds.
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    async fn execute_sync(&self, _invocation: &StepInvocation) -> Result<StepResponse> {
        Ok(StepResponse::succeeded())
    }
}

/// Runs one child node (named by `child_node_id`) and reports its result.
pub struct SectionStep;

#[async_trait]
impl Step for SectionStep {
    async fn obtain_child(&self, invocation: &StepInvocation) -> Result<ChildRequest> {
        let child_node_id = invocation
            .parameters
            .get(CHILD_NODE_PARAM)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidPlan(format!("missing '{}'", CHILD_NODE_PARAM)))?;
        Ok(ChildRequest {
            child_node_id: child_node_id.to_string(),
        })
    }
}

/// Runs child nodes (named by `child_node_ids`) concurrently and reports the
/// aggregate.
pub struct ForkStep;

#[async_trait]
impl Step for ForkStep {
    async fn obtain_children(&self, invocation: &StepInvocation) -> Result<ChildrenRequest> {
        let ids = invocation
            .parameters
            .get(CHILDREN_NODES_PARAM)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                EngineError::InvalidPlan(format!("missing '{}'", CHILDREN_NODES_PARAM))
            })?;
        Ok(ChildrenRequest {
            child_node_ids: ids
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn notify(status: Status, message: Option<&str>) -> ResponseData {
        ResponseData::StepNotify(StepResponseNotifyData {
            node_execution_id: Uuid::now_v7(),
            node_id: "c".into(),
            identifier: "c".into(),
            group: None,
            status,
            step_outcomes: Vec::new(),
            failure_info: message.map(|m| FailureInfo::new(m, FailureType::Application)),
        })
    }

    #[test]
    fn test_aggregate_waits_for_failure() {
        let mut responses = ResponseMap::new();
        responses.insert("n1".into(), notify(Status::Succeeded, None));
        responses.insert("n2".into(), notify(Status::Failed, Some("bad input")));
        responses.insert("n3".into(), notify(Status::Succeeded, None));

        let combined = aggregate_child_responses(&responses);
        assert_eq!(combined.status, Status::Failed);
        let info = combined.failure_info.unwrap();
        assert!(info.error_message.contains("bad input"));
        assert_eq!(info.failure_types, vec![FailureType::Application]);
    }

    #[test]
    fn test_callbacks_publish_payloads() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "cb-1".into(),
            ResponseData::Custom {
                payload: serde_json::json!({"approved": true}),
            },
        );
        let response = response_from_callbacks(&responses);
        assert_eq!(response.status, Status::Succeeded);
        assert_eq!(
            response.outcome_map().get("cb-1"),
            Some(&serde_json::json!({"approved": true}))
        );
    }

    #[test]
    fn test_expired_task_fails_with_expired_type() {
        let mut responses = ResponseMap::new();
        responses.insert(
            "t-1".into(),
            ResponseData::Task(TaskResult {
                task_id: "t-1".into(),
                status: TaskStatus::Expired,
                payload: None,
                error: None,
            }),
        );
        let response = response_from_callbacks(&responses);
        assert_eq!(response.status, Status::Failed);
        assert_eq!(
            response.failure_info.unwrap().failure_types,
            vec![FailureType::Expired]
        );
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_configuration_error() {
        let invocation = StepInvocation {
            ambiance: Ambiance::new(Uuid::now_v7(), BTreeMap::new()),
            parameters: Value::Null,
            inputs: StepInputs::new(),
            pass_through_data: None,
        };
        let err = NoopStep.obtain_task(&invocation).await.unwrap_err();
        let info = crate::error::failure_info_from(&err);
        assert!(info.is_configuration());
    }
}

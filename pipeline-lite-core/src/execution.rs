//! Persisted runtime records: plan executions and node executions.
//!
//! Records are plain values built with constructor functions. After creation
//! they change only through filtered updates in the store (see
//! [`NodeExecutionUpdate`]).

use crate::ambiance::{Ambiance, Level};
use crate::plan::{Plan, PlanNode};
use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Plan execution ───────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan: Plan,
    pub input_args: BTreeMap<String, Value>,
    pub status: Status,
    pub created_by: String,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub last_updated_at: Timestamp,
    #[serde(default)]
    pub valid_until: Option<Timestamp>,
}

impl PlanExecution {
    pub fn new(plan: Plan, input_args: BTreeMap<String, Value>, created_by: &str) -> Self {
        let now = now();
        Self {
            id: Uuid::now_v7(),
            plan,
            input_args,
            status: Status::Running,
            created_by: created_by.to_string(),
            started_at: now,
            ended_at: None,
            last_updated_at: now,
            valid_until: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.status, Status::Running | Status::Paused)
    }
}

// ─── Executable responses ─────────────────────────────────────

/// What a dispatched step left behind while the node waits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    Async {
        callback_ids: Vec<CorrelationId>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Task {
        task_id: CorrelationId,
        task_type: String,
    },
    Child {
        child_node_id: String,
        notify_id: CorrelationId,
    },
    Children {
        children: Vec<ChildDispatch>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildDispatch {
    pub child_node_id: String,
    pub notify_id: CorrelationId,
}

impl ExecutableResponse {
    /// Correlation ids the node waits on for this response.
    pub fn correlation_ids(&self) -> Vec<CorrelationId> {
        match self {
            Self::Sync => Vec::new(),
            Self::Async { callback_ids, .. } => callback_ids.clone(),
            Self::Task { task_id, .. } => vec![task_id.clone()],
            Self::Child { notify_id, .. } => vec![notify_id.clone()],
            Self::Children { children } => children.iter().map(|c| c.notify_id.clone()).collect(),
        }
    }
}

// ─── Node execution ───────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub node: PlanNode,
    pub levels: Vec<Level>,
    pub status: Status,
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub resolved_step_parameters: Option<Value>,
    #[serde(default)]
    pub additional_inputs: StepInputs,
    /// Inputs resolved from ref objects at start, reused on resume.
    #[serde(default)]
    pub resolved_inputs: StepInputs,
    #[serde(default)]
    pub pass_through_data: Option<Value>,

    // Links
    pub previous_id: Option<Uuid>,
    pub next_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub notify_id: Option<CorrelationId>,

    #[serde(default)]
    pub retry_ids: Vec<Uuid>,
    #[serde(default)]
    pub old_retry: bool,

    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    pub failure_info: Option<FailureInfo>,
    /// Initial wait chosen by the facilitator, in milliseconds.
    pub initial_wait_ms: Option<u64>,

    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub last_updated_at: Timestamp,
    #[serde(default)]
    pub valid_until: Option<Timestamp>,
}

impl NodeExecution {
    /// Fresh QUEUED record for `node`, addressed by `ambiance` (whose last
    /// level must already belong to `id`).
    pub fn queued(id: Uuid, ambiance: &Ambiance, node: &PlanNode) -> Self {
        let now = now();
        Self {
            id,
            plan_execution_id: ambiance.plan_execution_id,
            node: node.clone(),
            levels: ambiance.levels.clone(),
            status: Status::Queued,
            mode: None,
            resolved_step_parameters: None,
            additional_inputs: StepInputs::new(),
            resolved_inputs: StepInputs::new(),
            pass_through_data: None,
            previous_id: None,
            next_id: None,
            parent_id: None,
            notify_id: None,
            retry_ids: Vec::new(),
            old_retry: false,
            executable_responses: Vec::new(),
            failure_info: None,
            initial_wait_ms: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_updated_at: now,
            valid_until: None,
        }
    }

    /// Rebuild the ambiance from the stored level snapshot.
    pub fn ambiance(&self, input_args: &BTreeMap<String, Value>) -> Ambiance {
        Ambiance {
            plan_execution_id: self.plan_execution_id,
            levels: self.levels.clone(),
            input_args: input_args.clone(),
            started_at: Some(self.created_at),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Step parameters after expression rendering, falling back to the plan's.
    pub fn step_parameters(&self) -> &Value {
        self.resolved_step_parameters
            .as_ref()
            .unwrap_or(&self.node.step_parameters)
    }

    /// Correlation ids of the most recent executable response.
    pub fn awaited_ids(&self) -> Vec<CorrelationId> {
        self.executable_responses
            .last()
            .map(ExecutableResponse::correlation_ids)
            .unwrap_or_default()
    }
}

// ─── Filtered updates ─────────────────────────────────────────

/// Partial update applied atomically by the store.
///
/// `None` fields are left untouched. When `status` is set, the update only
/// applies if the current status is in `expected` (or, when `expected` is
/// empty, in the target's allowed start set). Updates that carry no status
/// change apply to any record, terminal or not.
#[derive(Clone, Debug, Default)]
pub struct NodeExecutionUpdate {
    pub status: Option<Status>,
    pub expected: Vec<Status>,
    pub mode: Option<ExecutionMode>,
    pub resolved_step_parameters: Option<Value>,
    pub additional_inputs: Option<StepInputs>,
    pub resolved_inputs: Option<StepInputs>,
    pub pass_through_data: Option<Value>,
    pub next_id: Option<Uuid>,
    pub push_executable_response: Option<ExecutableResponse>,
    pub failure_info: Option<FailureInfo>,
    pub initial_wait_ms: Option<u64>,
    pub old_retry: Option<bool>,
    pub valid_until: Option<Timestamp>,
}

impl NodeExecutionUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn expecting(mut self, expected: &[Status]) -> Self {
        self.expected = expected.to_vec();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_failure(mut self, failure_info: Option<FailureInfo>) -> Self {
        self.failure_info = failure_info;
        self
    }

    pub fn with_executable_response(mut self, response: ExecutableResponse) -> Self {
        self.push_executable_response = Some(response);
        self
    }

    /// Statuses the record must currently be in for a status change to apply.
    pub fn allowed_from(&self) -> Vec<Status> {
        match self.status {
            Some(target) if self.expected.is_empty() => target.node_allowed_start_set().to_vec(),
            Some(_) => self.expected.clone(),
            None => Vec::new(),
        }
    }

    /// Apply to `record` in place if the status filter admits it.
    /// Returns `false` (leaving the record untouched) when filtered out.
    pub fn apply(&self, record: &mut NodeExecution) -> bool {
        if let Some(target) = self.status {
            if record.status.is_terminal() || !self.allowed_from().contains(&record.status) {
                return false;
            }
            let now = now();
            if target == Status::Running && record.started_at.is_none() {
                record.started_at = Some(now);
            }
            if target.is_terminal() {
                record.ended_at = Some(now);
            }
            record.status = target;
        }
        if let Some(mode) = self.mode {
            record.mode = Some(mode);
        }
        if let Some(params) = &self.resolved_step_parameters {
            record.resolved_step_parameters = Some(params.clone());
        }
        if let Some(inputs) = &self.additional_inputs {
            record.additional_inputs = inputs.clone();
        }
        if let Some(inputs) = &self.resolved_inputs {
            record.resolved_inputs = inputs.clone();
        }
        if let Some(data) = &self.pass_through_data {
            record.pass_through_data = Some(data.clone());
        }
        if let Some(next) = self.next_id {
            record.next_id = Some(next);
        }
        if let Some(response) = &self.push_executable_response {
            record.executable_responses.push(response.clone());
        }
        if let Some(info) = &self.failure_info {
            record.failure_info = Some(info.clone());
        }
        if let Some(wait) = self.initial_wait_ms {
            record.initial_wait_ms = Some(wait);
        }
        if let Some(old) = self.old_retry {
            record.old_retry = old;
        }
        if let Some(until) = self.valid_until {
            record.valid_until = Some(until);
        }
        record.last_updated_at = now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepType;

    fn record() -> NodeExecution {
        let node = PlanNode::new("a", StepType::new("noop"));
        let amb = Ambiance::new(Uuid::now_v7(), BTreeMap::new());
        NodeExecution::queued(Uuid::now_v7(), &amb, &node)
    }

    #[test]
    fn test_status_filter_uses_allowed_start_set() {
        let mut ne = record();
        assert!(!NodeExecutionUpdate::status(Status::Succeeded).apply(&mut ne));
        assert_eq!(ne.status, Status::Queued);

        assert!(NodeExecutionUpdate::status(Status::Running).apply(&mut ne));
        assert!(ne.started_at.is_some());
        assert!(NodeExecutionUpdate::status(Status::Succeeded).apply(&mut ne));
        assert!(ne.ended_at.is_some());
    }

    #[test]
    fn test_terminal_status_is_never_overwritten() {
        let mut ne = record();
        assert!(NodeExecutionUpdate::status(Status::Aborted).apply(&mut ne));
        let update = NodeExecutionUpdate::status(Status::Running).expecting(&[Status::Aborted]);
        assert!(!update.apply(&mut ne));
        assert_eq!(ne.status, Status::Aborted);
    }

    #[test]
    fn test_link_update_applies_to_terminal_record() {
        let mut ne = record();
        NodeExecutionUpdate::status(Status::Errored).apply(&mut ne);
        let next = Uuid::now_v7();
        let update = NodeExecutionUpdate {
            next_id: Some(next),
            ..Default::default()
        };
        assert!(update.apply(&mut ne));
        assert_eq!(ne.next_id, Some(next));
    }

    #[test]
    fn test_awaited_ids_follow_last_response() {
        let mut ne = record();
        ne.executable_responses.push(ExecutableResponse::Children {
            children: vec![
                ChildDispatch {
                    child_node_id: "x".into(),
                    notify_id: "n1".into(),
                },
                ChildDispatch {
                    child_node_id: "y".into(),
                    notify_id: "n2".into(),
                },
            ],
        });
        assert_eq!(ne.awaited_ids(), vec!["n1".to_string(), "n2".to_string()]);
    }
}

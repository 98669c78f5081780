use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Wall-clock timestamp (UTC).
pub type Timestamp = DateTime<Utc>;

/// Correlation id used by the wait/notify engine (notify ids, callback ids,
/// task ids, delay ids).
pub type CorrelationId = String;

/// Resolved step inputs, keyed by ref object name.
pub type StepInputs = BTreeMap<String, Value>;

/// Responses collected for a waiting node, keyed by correlation id.
pub type ResponseMap = BTreeMap<CorrelationId, ResponseData>;

// ─── Status ───────────────────────────────────────────────────

/// Lifecycle status shared by node executions and plan executions.
///
/// Node executions move `Queued → Running → {Waiting ⇄ Running} → terminal`.
/// Plan executions only use `Running`, `Paused` and the terminal statuses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    Waiting,
    Paused,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
    Errored,
}

const NO_STATUSES: &[Status] = &[];
const FROM_QUEUED_OR_WAITING: &[Status] = &[Status::Queued, Status::Waiting];
const FROM_QUEUED_OR_RUNNING: &[Status] = &[Status::Queued, Status::Running];
const FROM_RUNNING_OR_WAITING: &[Status] = &[Status::Running, Status::Waiting];
const FROM_ANY_ACTIVE: &[Status] = &[Status::Queued, Status::Running, Status::Waiting];
const FROM_PAUSED: &[Status] = &[Status::Paused];
const FROM_RUNNING: &[Status] = &[Status::Running];
const FROM_RUNNING_OR_PAUSED: &[Status] = &[Status::Running, Status::Paused];
const FROM_REOPENABLE: &[Status] = &[Status::Failed, Status::Errored, Status::Aborted];

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Paused => "PAUSED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
            Self::Skipped => "SKIPPED",
            Self::Errored => "ERRORED",
        }
    }

    /// Terminal statuses accept no further status writes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Aborted | Self::Skipped | Self::Errored
        )
    }

    /// Statuses from which `resume` may re-enter a step.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    /// Statuses of a node that has not concluded yet.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Waiting)
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, Self::Failed | Self::Aborted | Self::Errored)
    }

    /// Statuses a node execution may be in before moving to `self`.
    ///
    /// `Queued` has no predecessors: a node never re-enters it.
    pub fn node_allowed_start_set(&self) -> &'static [Status] {
        match self {
            Self::Queued | Self::Paused => NO_STATUSES,
            Self::Running => FROM_QUEUED_OR_WAITING,
            Self::Waiting => FROM_QUEUED_OR_RUNNING,
            Self::Succeeded => FROM_RUNNING_OR_WAITING,
            Self::Failed | Self::Aborted | Self::Skipped | Self::Errored => FROM_ANY_ACTIVE,
        }
    }

    /// Statuses a plan execution may be in before moving to `self`.
    pub fn plan_allowed_start_set(&self) -> &'static [Status] {
        match self {
            Self::Running => FROM_PAUSED,
            Self::Paused => FROM_RUNNING,
            Self::Queued | Self::Waiting => NO_STATUSES,
            _ => FROM_RUNNING_OR_PAUSED,
        }
    }

    /// Statuses a plan may be reopened from by a retry interrupt.
    pub fn plan_reopenable_set() -> &'static [Status] {
        FROM_REOPENABLE
    }

    /// Combine the terminal statuses of several children into one.
    ///
    /// Errored dominates Failed, which dominates Aborted; anything else
    /// (including an empty set) resolves to Succeeded.
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a Status>) -> Status {
        let mut result = Status::Succeeded;
        for status in statuses {
            result = match (result, status) {
                (Status::Errored, _) | (_, Status::Errored) => Status::Errored,
                (Status::Failed, _) | (_, Status::Failed) => Status::Failed,
                (Status::Aborted, _) | (_, Status::Aborted) => Status::Aborted,
                (current, _) => current,
            };
        }
        result
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Execution mode ───────────────────────────────────────────

/// How a step is driven once facilitated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    Child,
    Children,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Async => "ASYNC",
            Self::Task => "TASK",
            Self::Child => "CHILD",
            Self::Children => "CHILDREN",
        }
    }

    /// Modes whose node waits on external work rather than on child nodes.
    pub fn is_external_wait(&self) -> bool {
        matches!(self, Self::Async | Self::Task)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Failure info ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Plan or registry misconfiguration. Never retried automatically.
    Configuration,
    /// The step itself reported a failure.
    Application,
    /// Store or remote channel unavailable.
    Connectivity,
    /// External work did not report back in time.
    Expired,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub error_message: String,
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(error_message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            error_message: error_message.into(),
            failure_types: vec![failure_type],
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.failure_types.contains(&FailureType::Configuration)
    }
}

// ─── Outcomes ─────────────────────────────────────────────────

/// Ref kind of the built-in outcome resolver.
pub const OUTCOME_REF_TYPE: &str = "outcome";

/// A named result a step hands to later steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Resolver kind that consumes this outcome.
    #[serde(default = "default_ref_type")]
    pub ref_type: String,
    pub data: Value,
}

fn default_ref_type() -> String {
    OUTCOME_REF_TYPE.to_string()
}

impl Outcome {
    pub fn new(data: Value) -> Self {
        Self {
            ref_type: default_ref_type(),
            data,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub name: String,
    pub outcome: Option<Outcome>,
    /// Ancestor group the outcome is published to. `None` = the producing node.
    #[serde(default)]
    pub group: Option<String>,
}

// ─── Step response ────────────────────────────────────────────

/// What a step reports when it finishes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub step_outcomes: Vec<StepOutcome>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

impl StepResponse {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            step_outcomes: Vec::new(),
            failure_info: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(Status::Succeeded)
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            step_outcomes: Vec::new(),
            failure_info: Some(failure_info),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Aborted,
            step_outcomes: Vec::new(),
            failure_info: Some(FailureInfo::new(reason, FailureType::Application)),
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, data: Value) -> Self {
        self.step_outcomes.push(StepOutcome {
            name: name.into(),
            outcome: Some(Outcome::new(data)),
            group: None,
        });
        self
    }

    /// Outcome data keyed by name, for advising events and notify payloads.
    pub fn outcome_map(&self) -> BTreeMap<String, Value> {
        self.step_outcomes
            .iter()
            .filter_map(|o| o.outcome.as_ref().map(|out| (o.name.clone(), out.data.clone())))
            .collect()
    }
}

/// Payload delivered to a waiting parent when a child lineage ends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResponseNotifyData {
    pub node_execution_id: Uuid,
    pub node_id: String,
    pub identifier: String,
    pub group: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub step_outcomes: Vec<StepOutcome>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

// ─── Task results ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a queued task, reported by whoever executed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: CorrelationId,
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// ─── Resume payloads ──────────────────────────────────────────

/// Everything that can be delivered against a correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    /// A child lineage ended.
    StepNotify(StepResponseNotifyData),
    /// A queued task reported back.
    Task(TaskResult),
    /// A scheduled delay elapsed.
    Delay,
    /// The party we waited on failed to answer.
    Error(FailureInfo),
    /// Opaque payload from an external system (async steps).
    Custom { payload: Value },
}

impl ResponseData {
    pub fn is_error(&self) -> bool {
        match self {
            Self::Error(_) => true,
            Self::Task(result) => result.status != TaskStatus::Completed,
            _ => false,
        }
    }
}

pub(crate) fn now() -> Timestamp {
    Utc::now()
}

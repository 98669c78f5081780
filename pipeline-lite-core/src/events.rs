use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orchestration events: the append-only audit trail of a plan execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OrchestrationEvent {
    PlanStarted {
        plan_id: Uuid,
        starting_node_id: String,
        created_by: String,
    },
    PlanStatusUpdated {
        from: Status,
        to: Status,
    },
    PlanEnded {
        status: Status,
        at: Timestamp,
    },
    NodeQueued {
        node_execution_id: Uuid,
        node_id: String,
        previous_id: Option<Uuid>,
        parent_id: Option<Uuid>,
    },
    NodeStatusUpdated {
        node_execution_id: Uuid,
        from: Status,
        to: Status,
    },
    Facilitated {
        node_execution_id: Uuid,
        facilitator_type: String,
        mode: ExecutionMode,
        initial_wait_ms: Option<u64>,
    },
    OutcomeConsumed {
        node_execution_id: Uuid,
        name: String,
        group: Option<String>,
    },
    AdviseTaken {
        node_execution_id: Uuid,
        adviser_type: String,
        advise: String,
    },
    InterruptRegistered {
        interrupt_id: Uuid,
        interrupt_type: String,
        node_execution_id: Option<Uuid>,
    },
    InterruptProcessed {
        interrupt_id: Uuid,
        node_execution_id: Option<Uuid>,
    },
    NotifyDelivered {
        correlation_id: CorrelationId,
    },
    /// A callback, resume or status write arrived for a record that had
    /// already moved on.
    DuplicateIgnored {
        node_execution_id: Option<Uuid>,
        detail: String,
    },
    NodesErroredOut {
        count: usize,
    },
}

impl OrchestrationEvent {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlanStarted { .. } => "plan_started",
            Self::PlanStatusUpdated { .. } => "plan_status_updated",
            Self::PlanEnded { .. } => "plan_ended",
            Self::NodeQueued { .. } => "node_queued",
            Self::NodeStatusUpdated { .. } => "node_status_updated",
            Self::Facilitated { .. } => "facilitated",
            Self::OutcomeConsumed { .. } => "outcome_consumed",
            Self::AdviseTaken { .. } => "advise_taken",
            Self::InterruptRegistered { .. } => "interrupt_registered",
            Self::InterruptProcessed { .. } => "interrupt_processed",
            Self::NotifyDelivered { .. } => "notify_delivered",
            Self::DuplicateIgnored { .. } => "duplicate_ignored",
            Self::NodesErroredOut { .. } => "nodes_errored_out",
        }
    }
}

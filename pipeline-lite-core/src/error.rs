use crate::types::{ExecutionMode, FailureInfo, FailureType};
use uuid::Uuid;

/// Domain errors raised by the engine and its collaborators.
///
/// Engine entry points return `anyhow::Result`; these variants travel inside
/// the `anyhow::Error` and are recovered with `downcast_ref` when a failure
/// has to be classified.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("plan has no starting node")]
    NoStartingNode,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("plan node not found: {0}")]
    PlanNodeNotFound(String),

    #[error("no step registered for type '{0}'")]
    UnknownStep(String),

    #[error("no facilitator registered for type '{0}'")]
    UnknownFacilitator(String),

    #[error("no adviser registered for type '{0}'")]
    UnknownAdviser(String),

    #[error("no resolver registered for ref type '{0}'")]
    UnknownResolver(String),

    #[error("no facilitator returned a response for node '{0}'")]
    NoFacilitatorMatched(String),

    #[error("step '{step_type}' does not support {mode} execution")]
    UnsupportedMode {
        step_type: String,
        mode: ExecutionMode,
    },

    #[error("node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),

    #[error("plan execution not found: {0}")]
    PlanExecutionNotFound(Uuid),

    #[error("remote module '{module}' failed: {message}")]
    Remote { module: String, message: String },

    #[error("remote call to '{module}' timed out after {timeout_ms}ms")]
    RemoteTimeout { module: String, timeout_ms: u64 },

    #[error("expression error: {0}")]
    Expression(String),

    #[error("step failed: {0}")]
    StepFailed(String),
}

impl EngineError {
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::NoStartingNode
            | Self::InvalidPlan(_)
            | Self::PlanNodeNotFound(_)
            | Self::UnknownStep(_)
            | Self::UnknownFacilitator(_)
            | Self::UnknownAdviser(_)
            | Self::UnknownResolver(_)
            | Self::NoFacilitatorMatched(_)
            | Self::UnsupportedMode { .. }
            | Self::Expression(_) => FailureType::Configuration,
            Self::NodeExecutionNotFound(_) | Self::PlanExecutionNotFound(_) => FailureType::Unknown,
            Self::Remote { .. } => FailureType::Connectivity,
            Self::RemoteTimeout { .. } => FailureType::Expired,
            Self::StepFailed(_) => FailureType::Application,
        }
    }
}

/// Classify an arbitrary error into the failure info recorded on a node.
pub fn failure_info_from(error: &anyhow::Error) -> FailureInfo {
    let failure_type = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map(EngineError::failure_type)
        .unwrap_or(FailureType::Unknown);
    FailureInfo::new(format!("{:#}", error), failure_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classifies_wrapped_engine_error() {
        let err: anyhow::Result<()> = Err(EngineError::NoFacilitatorMatched("a".into()).into());
        let err = err.context("facilitating node").unwrap_err();
        let info = failure_info_from(&err);
        assert_eq!(info.failure_types, vec![FailureType::Configuration]);
        assert!(info.error_message.contains("no facilitator returned"));
    }

    #[test]
    fn test_unknown_error_classified_unknown() {
        let err = anyhow::anyhow!("disk on fire");
        let info = failure_info_from(&err);
        assert_eq!(info.failure_types, vec![FailureType::Unknown]);
    }
}

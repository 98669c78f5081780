use crate::ambiance::Ambiance;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Facilitator parameter: only match when this input is present and truthy.
pub const IF_INPUT_PARAM: &str = "if_input";
/// Facilitator parameter: park the node this long before invoking it.
pub const INITIAL_WAIT_PARAM: &str = "initial_wait_ms";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub initial_wait_ms: Option<u64>,
    #[serde(default)]
    pub pass_through_data: Option<Value>,
}

impl FacilitatorResponse {
    pub fn mode(execution_mode: ExecutionMode) -> Self {
        Self {
            execution_mode,
            initial_wait_ms: None,
            pass_through_data: None,
        }
    }
}

/// What a facilitator is asked to decide on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FacilitationRequest {
    pub ambiance: Ambiance,
    /// Obtainment parameters of this facilitator.
    pub parameters: Value,
    pub step_parameters: Value,
    pub inputs: StepInputs,
}

/// Decides how a step is executed. `None` means "not me": the engine moves
/// on to the next facilitator obtainment.
#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn facilitate(
        &self,
        request: &FacilitationRequest,
    ) -> Result<Option<FacilitatorResponse>>;
}

/// Built-in facilitator that always picks one mode, subject to the
/// `if_input` and `initial_wait_ms` parameters.
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[async_trait]
impl Facilitator for ModeFacilitator {
    async fn facilitate(
        &self,
        request: &FacilitationRequest,
    ) -> Result<Option<FacilitatorResponse>> {
        if let Some(key) = request.parameters.get(IF_INPUT_PARAM).and_then(Value::as_str) {
            if !request.inputs.get(key).is_some_and(truthy) {
                return Ok(None);
            }
        }
        Ok(Some(FacilitatorResponse {
            execution_mode: self.mode,
            initial_wait_ms: request
                .parameters
                .get(INITIAL_WAIT_PARAM)
                .and_then(Value::as_u64)
                .filter(|ms| *ms > 0),
            pass_through_data: request.parameters.get("pass_through").cloned(),
        }))
    }
}

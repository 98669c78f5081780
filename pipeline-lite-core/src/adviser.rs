use crate::ambiance::Ambiance;
use crate::plan::NEXT_NODE_PARAM;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// What should happen after a node concluded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Advise {
    NextStep { next_node_id: String },
    Retry {
        #[serde(default)]
        wait_ms: Option<u64>,
    },
    End,
}

impl Advise {
    pub fn describe(&self) -> String {
        match self {
            Self::NextStep { next_node_id } => format!("next_step:{}", next_node_id),
            Self::Retry { wait_ms } => format!("retry:{}ms", wait_ms.unwrap_or(0)),
            Self::End => "end".to_string(),
        }
    }
}

/// Facts an adviser decides on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdvisingEvent {
    pub ambiance: Ambiance,
    pub node_execution_id: Uuid,
    pub node_id: String,
    pub status: Status,
    #[serde(default)]
    pub outcomes: BTreeMap<String, Value>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    /// How many times this plan node has already been retried in the lineage.
    pub retry_count: usize,
    /// Obtainment parameters of this adviser.
    #[serde(default)]
    pub parameters: Value,
}

/// Decides the next transition. `None` means "not me": the engine moves on to
/// the next adviser obtainment, and ends the lineage when none answers.
#[async_trait]
pub trait Adviser: Send + Sync {
    async fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>>;
}

fn next_or_end(parameters: &Value) -> Advise {
    match parameters.get(NEXT_NODE_PARAM).and_then(Value::as_str) {
        Some(next) => Advise::NextStep {
            next_node_id: next.to_string(),
        },
        None => Advise::End,
    }
}

// ─── Built-in advisers ────────────────────────────────────────

/// Moves on when the node succeeded (or was skipped).
pub struct OnSuccessAdviser;

#[async_trait]
impl Adviser for OnSuccessAdviser {
    async fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        if matches!(event.status, Status::Succeeded | Status::Skipped) {
            return Ok(Some(next_or_end(&event.parameters)));
        }
        Ok(None)
    }
}

/// Moves on when the node failed, was aborted or errored.
pub struct OnFailAdviser;

#[async_trait]
impl Adviser for OnFailAdviser {
    async fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        if event.status.is_broken() {
            return Ok(Some(next_or_end(&event.parameters)));
        }
        Ok(None)
    }
}

/// Unconditional transition.
pub struct NextStepAdviser;

#[async_trait]
impl Adviser for NextStepAdviser {
    async fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        Ok(Some(next_or_end(&event.parameters)))
    }
}

/// Retries FAILED nodes.
///
/// Parameters: `retry_count` (default 1), `waits_ms` (array, indexed by
/// attempt; the last entry repeats). Configuration failures are never
/// retried.
pub struct RetryAdviser;

#[async_trait]
impl Adviser for RetryAdviser {
    async fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        if event.status != Status::Failed {
            return Ok(None);
        }
        if event
            .failure_info
            .as_ref()
            .is_some_and(FailureInfo::is_configuration)
        {
            return Ok(None);
        }
        let max = event
            .parameters
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        if event.retry_count >= max {
            return Ok(None);
        }
        let waits: Vec<u64> = event
            .parameters
            .get("waits_ms")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        let wait_ms = waits
            .get(event.retry_count)
            .or_else(|| waits.last())
            .copied()
            .filter(|ms| *ms > 0);
        Ok(Some(Advise::Retry { wait_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(status: Status, retry_count: usize, parameters: Value) -> AdvisingEvent {
        AdvisingEvent {
            ambiance: Ambiance::new(Uuid::now_v7(), BTreeMap::new()),
            node_execution_id: Uuid::now_v7(),
            node_id: "a".into(),
            status,
            outcomes: BTreeMap::new(),
            failure_info: None,
            retry_count,
            parameters,
        }
    }

    #[tokio::test]
    async fn test_on_success_routes_or_ends() {
        let to_b = OnSuccessAdviser
            .advise(&event(Status::Succeeded, 0, json!({"next_node_id": "b"})))
            .await
            .unwrap();
        assert_eq!(
            to_b,
            Some(Advise::NextStep {
                next_node_id: "b".into()
            })
        );
        let end = OnSuccessAdviser
            .advise(&event(Status::Succeeded, 0, Value::Null))
            .await
            .unwrap();
        assert_eq!(end, Some(Advise::End));
        let skip = OnSuccessAdviser
            .advise(&event(Status::Failed, 0, Value::Null))
            .await
            .unwrap();
        assert!(skip.is_none());
    }

    #[tokio::test]
    async fn test_retry_respects_budget_and_waits() {
        let params = json!({"retry_count": 2, "waits_ms": [100, 250]});
        let first = RetryAdviser
            .advise(&event(Status::Failed, 0, params.clone()))
            .await
            .unwrap();
        assert_eq!(first, Some(Advise::Retry { wait_ms: Some(100) }));
        let second = RetryAdviser
            .advise(&event(Status::Failed, 1, params.clone()))
            .await
            .unwrap();
        assert_eq!(second, Some(Advise::Retry { wait_ms: Some(250) }));
        let exhausted = RetryAdviser
            .advise(&event(Status::Failed, 2, params))
            .await
            .unwrap();
        assert!(exhausted.is_none());
    }

    #[tokio::test]
    async fn test_retry_skips_configuration_failures() {
        let mut e = event(Status::Failed, 0, Value::Null);
        e.failure_info = Some(FailureInfo::new("no step", FailureType::Configuration));
        assert!(RetryAdviser.advise(&e).await.unwrap().is_none());
    }
}

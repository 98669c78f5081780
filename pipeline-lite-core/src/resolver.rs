use crate::ambiance::Ambiance;
use crate::error::EngineError;
use crate::plan::RefObject;
use crate::store::{ExecutionStore, OutcomeScope};
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Produces step inputs and stores step outputs for one ref kind.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Value bound to `ref_object`, or `None` if nothing was published yet.
    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> Result<Option<Value>>;

    /// Publish an outcome produced by the node `ambiance` addresses.
    async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        outcome: &Outcome,
        group: Option<&str>,
    ) -> Result<()>;
}

/// Outcomes are visible to the producing node's siblings and their
/// descendants. Publishing to a group moves the outcome up to the nearest
/// ancestor level of that group.
pub struct OutcomeResolver {
    store: Arc<dyn ExecutionStore>,
}

impl OutcomeResolver {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Scopes visible from `ambiance`, innermost first, ending at the root.
    pub fn lookup_scopes(ambiance: &Ambiance) -> Vec<OutcomeScope> {
        let mut scopes: Vec<OutcomeScope> = ambiance
            .levels
            .iter()
            .rev()
            .map(|l| Some(l.runtime_id))
            .collect();
        scopes.push(None);
        scopes
    }

    fn publish_scope(ambiance: &Ambiance, group: Option<&str>) -> Result<OutcomeScope> {
        match group {
            Some(group) => ambiance
                .level_for_group(group)
                .map(|l| Some(l.runtime_id))
                .ok_or_else(|| {
                    EngineError::InvalidPlan(format!("no level of group '{}' in ambiance", group))
                        .into()
                }),
            None => {
                let depth = ambiance.levels.len();
                Ok(if depth >= 2 {
                    Some(ambiance.levels[depth - 2].runtime_id)
                } else {
                    None
                })
            }
        }
    }

    /// Look up an outcome by name as seen from `ambiance`.
    pub async fn find(&self, ambiance: &Ambiance, name: &str) -> Result<Option<Outcome>> {
        self.store
            .find_outcome(
                ambiance.plan_execution_id,
                &Self::lookup_scopes(ambiance),
                name,
            )
            .await
    }
}

#[async_trait]
impl Resolver for OutcomeResolver {
    async fn resolve(&self, ambiance: &Ambiance, ref_object: &RefObject) -> Result<Option<Value>> {
        Ok(self.find(ambiance, &ref_object.key).await?.map(|o| o.data))
    }

    async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        outcome: &Outcome,
        group: Option<&str>,
    ) -> Result<()> {
        let scope = Self::publish_scope(ambiance, group)?;
        self.store
            .save_outcome(ambiance.plan_execution_id, scope, name, outcome)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::Level;
    use crate::store_memory::MemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn level(group: Option<&str>) -> Level {
        Level {
            runtime_id: Uuid::now_v7(),
            setup_id: "n".into(),
            identifier: "n".into(),
            step_type: "noop".into(),
            group: group.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_sibling_sees_outcome() {
        let resolver = OutcomeResolver::new(Arc::new(MemoryStore::new()));
        let root = Ambiance::new(Uuid::now_v7(), BTreeMap::new());
        let parent = root.with_level(level(None));
        let a = parent.with_level(level(None));
        let b = parent.with_level(level(None));

        resolver
            .consume(&a, "total", &Outcome::new(json!(42)), None)
            .await
            .unwrap();
        let seen = resolver
            .resolve(&b, &RefObject::outcome("sum", "total"))
            .await
            .unwrap();
        assert_eq!(seen, Some(json!(42)));

        // Not visible outside the parent.
        let other_top = root.with_level(level(None));
        assert!(resolver
            .resolve(&other_top, &RefObject::outcome("sum", "total"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_group_publishes_to_ancestor() {
        let resolver = OutcomeResolver::new(Arc::new(MemoryStore::new()));
        let root = Ambiance::new(Uuid::now_v7(), BTreeMap::new());
        let stage = root.with_level(level(Some("stage")));
        let section = stage.with_level(level(None));
        let step = section.with_level(level(None));

        resolver
            .consume(&step, "artifact", &Outcome::new(json!("img:1")), Some("stage"))
            .await
            .unwrap();

        // A sibling of the section (inside the stage) sees it.
        let sibling = stage.with_level(level(None));
        assert_eq!(
            resolver
                .resolve(&sibling, &RefObject::outcome("a", "artifact"))
                .await
                .unwrap(),
            Some(json!("img:1"))
        );

        let err = resolver
            .consume(&step, "x", &Outcome::new(json!(1)), Some("pipeline"))
            .await
            .unwrap_err();
        assert!(crate::error::failure_info_from(&err).is_configuration());
    }
}

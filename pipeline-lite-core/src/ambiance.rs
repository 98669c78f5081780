//! Ambiance: the hierarchical address of a running node.
//!
//! An ambiance is an ordered stack of levels, outermost first. The last level
//! always belongs to the node execution the ambiance is handed to. Nested work
//! derives its ambiance by copy-on-append, so a parent's stack is never
//! touched by its children.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Level {
    /// Node execution id.
    pub runtime_id: Uuid,
    /// Plan node id.
    pub setup_id: String,
    pub identifier: String,
    pub step_type: String,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub input_args: BTreeMap<String, Value>,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
}

impl Ambiance {
    pub fn new(plan_execution_id: Uuid, input_args: BTreeMap<String, Value>) -> Self {
        Self {
            plan_execution_id,
            levels: Vec::new(),
            input_args,
            started_at: Some(crate::types::now()),
        }
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Node execution the ambiance currently addresses.
    pub fn current_runtime_id(&self) -> Option<Uuid> {
        self.levels.last().map(|l| l.runtime_id)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Copy with `level` appended.
    pub fn with_level(&self, level: Level) -> Self {
        let mut levels = Vec::with_capacity(self.levels.len() + 1);
        levels.extend(self.levels.iter().cloned());
        levels.push(level);
        Self {
            plan_execution_id: self.plan_execution_id,
            levels,
            input_args: self.input_args.clone(),
            started_at: self.started_at,
        }
    }

    /// Copy with the current level dropped. Used when a node hands over to
    /// its successor at the same depth.
    pub fn clone_for_finish(&self) -> Self {
        let mut copy = self.clone();
        copy.levels.pop();
        copy
    }

    /// Ambiance for a sibling or successor: same depth, new last level.
    pub fn replace_current(&self, level: Level) -> Self {
        self.clone_for_finish().with_level(level)
    }

    /// Nearest level (innermost first) whose group matches.
    pub fn level_for_group(&self, group: &str) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }

    /// Runtime ids from outermost to innermost.
    pub fn runtime_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.levels.iter().map(|l| l.runtime_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(id: Uuid, setup: &str, group: Option<&str>) -> Level {
        Level {
            runtime_id: id,
            setup_id: setup.to_string(),
            identifier: setup.to_string(),
            step_type: "noop".to_string(),
            group: group.map(str::to_string),
        }
    }

    #[test]
    fn test_with_level_leaves_parent_untouched() {
        let root = Ambiance::new(Uuid::now_v7(), BTreeMap::new());
        let a = Uuid::now_v7();
        let parent = root.with_level(level(a, "a", Some("stage")));
        let b = Uuid::now_v7();
        let child = parent.with_level(level(b, "b", None));

        assert_eq!(parent.depth(), 1);
        assert_eq!(child.depth(), parent.depth() + 1);
        assert_eq!(child.current_runtime_id(), Some(b));
        assert_eq!(parent.current_runtime_id(), Some(a));
    }

    #[test]
    fn test_replace_current_keeps_depth() {
        let root = Ambiance::new(Uuid::now_v7(), BTreeMap::new());
        let first = root.with_level(level(Uuid::now_v7(), "a", None));
        let next_id = Uuid::now_v7();
        let next = first.replace_current(level(next_id, "b", None));
        assert_eq!(next.depth(), 1);
        assert_eq!(next.current_runtime_id(), Some(next_id));
    }

    #[test]
    fn test_level_for_group_finds_innermost() {
        let root = Ambiance::new(Uuid::now_v7(), BTreeMap::new());
        let outer = Uuid::now_v7();
        let inner = Uuid::now_v7();
        let amb = root
            .with_level(level(outer, "a", Some("stage")))
            .with_level(level(inner, "b", Some("stage")))
            .with_level(level(Uuid::now_v7(), "c", None));
        assert_eq!(amb.level_for_group("stage").map(|l| l.runtime_id), Some(inner));
        assert!(amb.level_for_group("pipeline").is_none());
    }
}

//! Plan model and startup-time plan validation.
//!
//! A `Plan` is built by an external planner and never mutated by the engine.
//! Node executions keep a snapshot of the `PlanNode` they run.

use crate::registry::Registries;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Step parameter naming the single child node of a CHILD step.
pub const CHILD_NODE_PARAM: &str = "child_node_id";
/// Step parameter naming the child nodes of a CHILDREN step.
pub const CHILDREN_NODES_PARAM: &str = "child_node_ids";
/// Adviser parameter naming the node to run next.
pub const NEXT_NODE_PARAM: &str = "next_node_id";

// ─── Plan nodes ───────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepType {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
}

impl StepType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
        }
    }

    pub fn grouped(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: Some(group.into()),
        }
    }
}

/// Reference to a value a resolver can produce, bound to a step input name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefObject {
    /// Input name the resolved value is bound to.
    pub name: String,
    /// Key the resolver looks up (e.g. an outcome name).
    pub key: String,
    pub ref_type: String,
}

impl RefObject {
    pub fn outcome(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            ref_type: crate::types::OUTCOME_REF_TYPE.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    #[serde(rename = "type")]
    pub facilitator_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl FacilitatorObtainment {
    pub fn of(facilitator_type: impl Into<String>) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
            parameters: Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    #[serde(rename = "type")]
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters,
        }
    }

    /// `next_node_id` parameter, when the adviser routes to a fixed node.
    pub fn next_node_id(&self) -> Option<&str> {
        self.parameters.get(NEXT_NODE_PARAM).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub name: String,
    pub identifier: String,
    pub step_type: StepType,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default)]
    pub ref_objects: Vec<RefObject>,
    #[serde(default)]
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,
    #[serde(default)]
    pub adviser_obtainments: Vec<AdviserObtainment>,
}

impl PlanNode {
    /// Node with the given id (also used as name and identifier) and step type.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            identifier: id.clone(),
            id,
            step_type,
            step_parameters: Value::Null,
            ref_objects: Vec::new(),
            facilitator_obtainments: Vec::new(),
            adviser_obtainments: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_ref(mut self, ref_object: RefObject) -> Self {
        self.ref_objects.push(ref_object);
        self
    }

    pub fn with_facilitator(mut self, obtainment: FacilitatorObtainment) -> Self {
        self.facilitator_obtainments.push(obtainment);
        self
    }

    pub fn with_adviser(mut self, obtainment: AdviserObtainment) -> Self {
        self.adviser_obtainments.push(obtainment);
        self
    }

    /// Child node ids named in the step parameters.
    pub fn child_node_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        if let Some(id) = self.step_parameters.get(CHILD_NODE_PARAM).and_then(Value::as_str) {
            ids.push(id);
        }
        if let Some(list) = self
            .step_parameters
            .get(CHILDREN_NODES_PARAM)
            .and_then(Value::as_array)
        {
            ids.extend(list.iter().filter_map(Value::as_str));
        }
        ids
    }
}

// ─── Plan ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub starting_node_id: String,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn new(starting_node_id: impl Into<String>, nodes: Vec<PlanNode>) -> Self {
        Self {
            id: Uuid::now_v7(),
            starting_node_id: starting_node_id.into(),
            nodes,
        }
    }

    pub fn fetch_node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn starting_node(&self) -> Option<&PlanNode> {
        if self.starting_node_id.is_empty() {
            return None;
        }
        self.fetch_node(&self.starting_node_id)
    }
}

// ─── Validation ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PlanValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for PlanValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn push(errors: &mut Vec<PlanValidationError>, rule: &str, message: String) {
    errors.push(PlanValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a plan against the registries. Returns all errors found.
pub fn validate_plan(plan: &Plan, registries: &Registries) -> Vec<PlanValidationError> {
    let mut errors = Vec::new();

    // P1: Starting node exists
    if plan.starting_node().is_none() {
        push(
            &mut errors,
            "P1",
            format!("Starting node '{}' not found", plan.starting_node_id),
        );
    }

    // P2: Node ids are unique
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &plan.nodes {
        if index.contains_key(node.id.as_str()) {
            push(&mut errors, "P2", format!("Duplicate node id: {}", node.id));
        } else {
            index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
    }

    for node in &plan.nodes {
        // P3: At least one facilitator
        if node.facilitator_obtainments.is_empty() {
            push(
                &mut errors,
                "P3",
                format!("Node '{}' has no facilitator obtainment", node.id),
            );
        }

        // P4: Types are registered
        if !registries.steps.contains(&node.step_type.name) {
            push(
                &mut errors,
                "P4",
                format!(
                    "Node '{}' uses unregistered step type '{}'",
                    node.id, node.step_type.name
                ),
            );
        }
        for f in &node.facilitator_obtainments {
            if !registries.facilitators.contains(&f.facilitator_type) {
                push(
                    &mut errors,
                    "P4",
                    format!(
                        "Node '{}' uses unregistered facilitator '{}'",
                        node.id, f.facilitator_type
                    ),
                );
            }
        }
        for a in &node.adviser_obtainments {
            if !registries.advisers.contains(&a.adviser_type) {
                push(
                    &mut errors,
                    "P4",
                    format!(
                        "Node '{}' uses unregistered adviser '{}'",
                        node.id, a.adviser_type
                    ),
                );
            }
        }
        for r in &node.ref_objects {
            if !registries.resolvers.contains(&r.ref_type) {
                push(
                    &mut errors,
                    "P4",
                    format!(
                        "Node '{}' input '{}' uses unregistered resolver '{}'",
                        node.id, r.name, r.ref_type
                    ),
                );
            }
        }

        let Some(&from) = index.get(node.id.as_str()) else {
            continue;
        };

        // P5: Adviser targets exist
        for a in &node.adviser_obtainments {
            if let Some(next) = a.next_node_id() {
                match index.get(next) {
                    Some(&to) => {
                        graph.add_edge(from, to, ());
                    }
                    None => push(
                        &mut errors,
                        "P5",
                        format!(
                            "Node '{}' adviser '{}' references unknown node '{}'",
                            node.id, a.adviser_type, next
                        ),
                    ),
                }
            }
        }

        // P6: Child references exist
        for child in node.child_node_ids() {
            match index.get(child) {
                Some(&to) => {
                    graph.add_edge(from, to, ());
                }
                None => push(
                    &mut errors,
                    "P6",
                    format!("Node '{}' references unknown child node '{}'", node.id, child),
                ),
            }
        }
    }

    // P7: Every node reachable from the start
    if let Some(&start) = index.get(plan.starting_node_id.as_str()) {
        let mut reached = HashSet::new();
        let mut bfs = Bfs::new(&graph, start);
        while let Some(nx) = bfs.next(&graph) {
            reached.insert(nx);
        }
        for (id, nx) in &index {
            if !reached.contains(nx) {
                push(
                    &mut errors,
                    "P7",
                    format!("Node '{}' is unreachable from the starting node", id),
                );
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registries;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn sync_node(id: &str) -> PlanNode {
        PlanNode::new(id, StepType::new("noop")).with_facilitator(FacilitatorObtainment::of("sync"))
    }

    fn rule_set(errors: &[PlanValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.rule.as_str()).collect()
    }

    fn registries() -> Registries {
        Registries::with_defaults(std::sync::Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_valid_chain_has_no_errors() {
        let plan = Plan::new(
            "a",
            vec![
                sync_node("a").with_adviser(AdviserObtainment::new(
                    "on_success",
                    json!({"next_node_id": "b"}),
                )),
                sync_node("b"),
            ],
        );
        let errors = validate_plan(&plan, &registries());
        assert!(errors.is_empty(), "unexpected: {:?}", errors);
    }

    #[test]
    fn test_missing_start_and_duplicates() {
        let plan = Plan::new("zzz", vec![sync_node("a"), sync_node("a")]);
        let errors = validate_plan(&plan, &registries());
        let rules = rule_set(&errors);
        assert!(rules.contains(&"P1"));
        assert!(rules.contains(&"P2"));
    }

    #[test]
    fn test_missing_facilitator_and_unknown_types() {
        let plan = Plan::new(
            "a",
            vec![PlanNode::new("a", StepType::new("mystery"))
                .with_adviser(AdviserObtainment::new("fortune_teller", Value::Null))],
        );
        let errors = validate_plan(&plan, &registries());
        let rules = rule_set(&errors);
        assert!(rules.contains(&"P3"));
        assert_eq!(rules.iter().filter(|r| **r == "P4").count(), 2);
    }

    #[test]
    fn test_dangling_references_and_unreachable() {
        let plan = Plan::new(
            "a",
            vec![
                sync_node("a")
                    .with_adviser(AdviserObtainment::new(
                        "on_success",
                        json!({"next_node_id": "ghost"}),
                    ))
                    .with_parameters(json!({"child_node_id": "phantom"})),
                sync_node("island"),
            ],
        );
        let errors = validate_plan(&plan, &registries());
        let rules = rule_set(&errors);
        assert!(rules.contains(&"P5"));
        assert!(rules.contains(&"P6"));
        assert!(errors
            .iter()
            .any(|e| e.rule == "P7" && e.message.contains("island")));
    }
}

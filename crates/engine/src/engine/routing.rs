//! Outgoing edge selection
//!
//! Pure functions over a compiled node and an evaluation scope. Edges are
//! already sorted by ascending priority with default edges last.

use serde_json::{Map, Value};

use crate::activity::ActivityError;
use crate::definition::{CompiledEdge, CompiledNode, NodeIndex, NodeKind};

pub(crate) const NO_MATCHING_EDGE: &str = "NoMatchingEdge";

fn condition_holds(edge: &CompiledEdge, scope: &Map<String, Value>) -> Result<bool, ActivityError> {
    match &edge.condition {
        None => Ok(true),
        Some(condition) => condition.evaluate_bool(scope).map_err(|e| {
            ActivityError::non_retryable(format!(
                "condition '{}' failed: {}",
                condition.source(),
                e
            ))
            .with_code(e.code())
        }),
    }
}

fn no_match(node: &CompiledNode) -> ActivityError {
    ActivityError::non_retryable(format!(
        "no outgoing edge of '{}' matched and no default edge exists",
        node.id()
    ))
    .with_code(NO_MATCHING_EDGE)
}

fn default_target(node: &CompiledNode) -> Option<NodeIndex> {
    node.outgoing.iter().find(|e| e.is_default).map(|e| e.target)
}

/// First edge whose condition holds, else the default edge
pub(crate) fn select_exclusive(
    node: &CompiledNode,
    scope: &Map<String, Value>,
) -> Result<NodeIndex, ActivityError> {
    for edge in node.outgoing.iter().filter(|e| !e.is_default) {
        if condition_holds(edge, scope)? {
            return Ok(edge.target);
        }
    }
    default_target(node).ok_or_else(|| no_match(node))
}

/// Every edge whose condition holds, else the default edge
pub(crate) fn select_parallel(
    node: &CompiledNode,
    scope: &Map<String, Value>,
) -> Result<Vec<NodeIndex>, ActivityError> {
    let mut targets = Vec::new();
    for edge in node.outgoing.iter().filter(|e| !e.is_default) {
        if condition_holds(edge, scope)? {
            targets.push(edge.target);
        }
    }
    if targets.is_empty() {
        targets.extend(default_target(node));
    }
    if targets.is_empty() {
        return Err(no_match(node));
    }
    Ok(targets)
}

/// Next node(s) after `node` completes; empty when the token ends here
pub(crate) fn next_nodes(
    node: &CompiledNode,
    scope: &Map<String, Value>,
) -> Result<Vec<NodeIndex>, ActivityError> {
    if node.kind == NodeKind::End || node.outgoing.is_empty() {
        return Ok(vec![]);
    }
    match node.kind {
        NodeKind::ParallelGateway => select_parallel(node, scope),
        _ => select_exclusive(node, scope).map(|target| vec![target]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ExecutionResult, ExecutorRegistry};
    use crate::definition::{CompiledWorkflow, Edge, Node, WorkflowDefinition};
    use serde_json::json;

    fn compile(def: WorkflowDefinition) -> CompiledWorkflow {
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("work", |_| async { Ok(ExecutionResult::done()) });
        CompiledWorkflow::compile(def, &executors).unwrap()
    }

    fn scope(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn gateway(kind: Node, edges: Vec<Edge>) -> CompiledWorkflow {
        let mut def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(kind)
            .with_node(Node::end("a"))
            .with_node(Node::end("b"))
            .with_node(Node::end("c"))
            .with_edge(Edge::new("start", "gw"));
        def.edges.extend(edges);
        compile(def)
    }

    fn ids(compiled: &CompiledWorkflow, targets: &[NodeIndex]) -> Vec<String> {
        targets
            .iter()
            .map(|t| compiled.node(*t).id().to_string())
            .collect()
    }

    #[test]
    fn test_exclusive_picks_first_true_by_priority() {
        let compiled = gateway(
            Node::exclusive("gw"),
            vec![
                Edge::new("gw", "a").when("false").with_priority(1),
                Edge::new("gw", "b").when("true").with_priority(2),
                Edge::new("gw", "c").default_edge(),
            ],
        );
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let target = select_exclusive(gw, &Map::new()).unwrap();
        assert_eq!(compiled.node(target).id(), "b");
    }

    #[test]
    fn test_exclusive_falls_back_to_default() {
        let compiled = gateway(
            Node::exclusive("gw"),
            vec![
                Edge::new("gw", "a").when("amount > 100"),
                Edge::new("gw", "c").default_edge(),
            ],
        );
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let target = select_exclusive(gw, &scope(json!({"amount": 5}))).unwrap();
        assert_eq!(compiled.node(target).id(), "c");
    }

    #[test]
    fn test_exclusive_without_default_faults() {
        let compiled = gateway(
            Node::exclusive("gw"),
            vec![
                Edge::new("gw", "a").when("amount > 100"),
                Edge::new("gw", "b").when("amount > 50"),
            ],
        );
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let err = select_exclusive(gw, &scope(json!({"amount": 5}))).unwrap_err();
        assert_eq!(err.code(), NO_MATCHING_EDGE);
        assert!(!err.retryable);
    }

    #[test]
    fn test_condition_on_unknown_variable_faults() {
        let compiled = gateway(
            Node::exclusive("gw"),
            vec![
                Edge::new("gw", "a").when("missing == 1"),
                Edge::new("gw", "c").default_edge(),
            ],
        );
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let err = select_exclusive(gw, &Map::new()).unwrap_err();
        assert_eq!(err.code(), "UnknownVariable");
    }

    #[test]
    fn test_parallel_activates_all_matching() {
        let compiled = gateway(
            Node::parallel("gw"),
            vec![
                Edge::new("gw", "a").when("labs"),
                Edge::new("gw", "b").when("imaging"),
                Edge::new("gw", "c"),
            ],
        );
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let targets = select_parallel(gw, &scope(json!({"labs": true, "imaging": false}))).unwrap();
        assert_eq!(ids(&compiled, &targets), vec!["a", "c"]);
    }

    #[test]
    fn test_parallel_default_when_nothing_matches() {
        let compiled = gateway(
            Node::parallel("gw"),
            vec![
                Edge::new("gw", "a").when("labs"),
                Edge::new("gw", "c").default_edge(),
            ],
        );
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let targets = select_parallel(gw, &scope(json!({"labs": false}))).unwrap();
        assert_eq!(ids(&compiled, &targets), vec!["c"]);
    }

    #[test]
    fn test_end_node_has_no_next() {
        let compiled = gateway(Node::exclusive("gw"), vec![Edge::new("gw", "a")]);
        let (_, end) = compiled.node_by_id("a").unwrap();
        assert!(next_nodes(end, &Map::new()).unwrap().is_empty());
    }
}

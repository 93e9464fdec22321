//! Compiled, immutable workflow graph
//!
//! Nodes live in an arena indexed by position; edges and boundary events
//! refer to their endpoints by index, so cyclic graphs need no shared
//! ownership. Conditions and mappings are parsed once here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::kind::NodeKind;
use super::model::{
    BoundaryEvent, ErrorHandler, Node, Parameter, VariableDefinition, VariableScope,
    WorkflowDefinition,
};
use crate::activity::{ActivityExecutor, ExecutorRegistry};
use crate::error::RegistryError;
use crate::expression::Expression;

pub type NodeIndex = usize;

#[derive(Debug, Clone)]
pub struct CompiledEdge {
    pub target: NodeIndex,
    pub condition: Option<Expression>,
    pub is_default: bool,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub struct CompiledBoundary {
    pub event: BoundaryEvent,
    pub target: NodeIndex,
}

pub struct CompiledNode {
    pub model: Node,
    pub kind: NodeKind,
    pub executor: Arc<dyn ActivityExecutor>,
    /// Outgoing edges by ascending priority, default edges last
    pub outgoing: Vec<CompiledEdge>,
    /// Number of incoming sequence edges
    pub incoming: usize,
    pub boundaries: Vec<CompiledBoundary>,
    pub input_mappings: Vec<(String, Expression)>,
    pub output_mappings: Vec<(String, Expression)>,
}

impl CompiledNode {
    pub fn id(&self) -> &str {
        &self.model.id
    }

    /// A parallel gateway with more than one incoming edge
    pub fn is_join(&self) -> bool {
        self.kind == NodeKind::ParallelGateway && self.incoming > 1
    }

    pub fn boundary(&self, boundary_id: &str) -> Option<&CompiledBoundary> {
        self.boundaries.iter().find(|b| b.event.id == boundary_id)
    }

    /// Error boundary catching `code`, if any
    pub fn error_boundary(&self, code: &str) -> Option<&CompiledBoundary> {
        self.boundaries.iter().find(|b| b.event.catches(code))
    }
}

impl fmt::Debug for CompiledNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledNode")
            .field("id", &self.model.id)
            .field("kind", &self.kind)
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.incoming)
            .finish()
    }
}

/// A validated definition bound to its executors
#[derive(Debug)]
pub struct CompiledWorkflow {
    definition: WorkflowDefinition,
    nodes: Vec<CompiledNode>,
    index: HashMap<String, NodeIndex>,
    start: NodeIndex,
    node_variables: Vec<VariableDefinition>,
}

impl CompiledWorkflow {
    /// Compile a definition that has already passed validation
    pub fn compile(
        definition: WorkflowDefinition,
        executors: &ExecutorRegistry,
    ) -> Result<Self, RegistryError> {
        let index: HashMap<String, NodeIndex> = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let lookup = |id: &str| {
            index
                .get(id)
                .copied()
                .ok_or_else(|| RegistryError::UnknownNode(id.to_string()))
        };

        let mut nodes = Vec::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            let kind = NodeKind::from_node(node)?;
            let executor = executors.resolve(&node.id, &kind)?;

            let boundaries = node
                .boundary_events
                .iter()
                .map(|event| {
                    Ok(CompiledBoundary {
                        event: event.clone(),
                        target: lookup(&event.target_node_id)?,
                    })
                })
                .collect::<Result<Vec<_>, RegistryError>>()?;

            nodes.push(CompiledNode {
                model: node.clone(),
                kind,
                executor,
                outgoing: vec![],
                incoming: 0,
                boundaries,
                input_mappings: parse_mappings(&node.id, &node.input_mappings)?,
                output_mappings: parse_mappings(&node.id, &node.output_mappings)?,
            });
        }

        for edge in &definition.edges {
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;
            let condition = edge
                .condition
                .as_deref()
                .map(|c| parse_expression(&edge.source, c))
                .transpose()?;

            nodes[source].outgoing.push(CompiledEdge {
                target,
                condition,
                is_default: edge.is_default,
                priority: edge.priority,
            });
            nodes[target].incoming += 1;
        }

        for node in &mut nodes {
            // Stable sort keeps declaration order among equal priorities
            node.outgoing.sort_by_key(|e| (e.is_default, e.priority));
        }

        let start = nodes
            .iter()
            .position(|n| n.kind == NodeKind::Start)
            .ok_or(RegistryError::MissingStartNode)?;

        let node_variables = definition
            .variables
            .iter()
            .filter(|v| v.scope == VariableScope::Node)
            .cloned()
            .collect();

        Ok(Self {
            definition,
            nodes,
            index,
            start,
            node_variables,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn workflow_id(&self) -> &str {
        &self.definition.workflow_id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn start(&self) -> NodeIndex {
        self.start
    }

    pub fn node(&self, index: NodeIndex) -> &CompiledNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.index.get(node_id).copied()
    }

    pub fn node_by_id(&self, node_id: &str) -> Option<(NodeIndex, &CompiledNode)> {
        self.index_of(node_id).map(|i| (i, &self.nodes[i]))
    }

    pub fn input_parameters(&self) -> &[Parameter] {
        &self.definition.input_parameters
    }

    pub fn output_parameters(&self) -> &[Parameter] {
        &self.definition.output_parameters
    }

    /// Variables injected into node input and never persisted
    pub fn node_variables(&self) -> &[VariableDefinition] {
        &self.node_variables
    }

    pub fn is_node_variable(&self, name: &str) -> bool {
        self.node_variables.iter().any(|v| v.name == name)
    }

    /// Matching error handler: node-level first, then definition-level
    pub fn error_handler(&self, node: NodeIndex, code: &str) -> Option<&ErrorHandler> {
        self.nodes[node]
            .model
            .error_handlers
            .iter()
            .chain(self.definition.error_handlers.iter())
            .find(|h| h.matches(code))
    }

    /// Definition-level handler governing cancellation
    pub fn cancellation_handler(&self) -> Option<&ErrorHandler> {
        self.definition
            .error_handlers
            .iter()
            .find(|h| h.matches("Cancelled"))
    }
}

fn parse_expression(node_id: &str, source: &str) -> Result<Expression, RegistryError> {
    Expression::parse(source).map_err(|e| RegistryError::InvalidExpression {
        node_id: node_id.to_string(),
        expression: source.to_string(),
        message: e.to_string(),
    })
}

fn parse_mappings<'a, I>(node_id: &str, mappings: I) -> Result<Vec<(String, Expression)>, RegistryError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    mappings
        .into_iter()
        .map(|(name, source)| Ok((name.clone(), parse_expression(node_id, source)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ExecutionResult;
    use crate::definition::{Edge, NodeType};

    fn executors() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("work", |_| async { Ok(ExecutionResult::done()) });
        registry
    }

    #[test]
    fn test_outgoing_sorted_by_priority_with_default_last() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::exclusive("gw"))
            .with_node(Node::end("a"))
            .with_node(Node::end("b"))
            .with_node(Node::end("c"))
            .with_edge(Edge::new("start", "gw"))
            .with_edge(Edge::new("gw", "c").default_edge())
            .with_edge(Edge::new("gw", "b").when("true").with_priority(2))
            .with_edge(Edge::new("gw", "a").when("false").with_priority(1));

        let compiled = CompiledWorkflow::compile(def, &executors()).unwrap();
        let (_, gw) = compiled.node_by_id("gw").unwrap();
        let targets: Vec<&str> = gw
            .outgoing
            .iter()
            .map(|e| compiled.node(e.target).id())
            .collect();

        assert_eq!(targets, vec!["a", "b", "c"]);
        assert_eq!(compiled.node(compiled.start()).model.node_type, NodeType::Start);
    }

    #[test]
    fn test_join_detection() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::parallel("fork"))
            .with_node(Node::task("a", "work"))
            .with_node(Node::task("b", "work"))
            .with_node(Node::parallel("join"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "fork"))
            .with_edge(Edge::new("fork", "a"))
            .with_edge(Edge::new("fork", "b"))
            .with_edge(Edge::new("a", "join"))
            .with_edge(Edge::new("b", "join"))
            .with_edge(Edge::new("join", "end"));

        let compiled = CompiledWorkflow::compile(def, &executors()).unwrap();
        assert!(!compiled.node_by_id("fork").unwrap().1.is_join());
        assert!(compiled.node_by_id("join").unwrap().1.is_join());
    }

    #[test]
    fn test_unregistered_task_fails_compile() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "unknown"))
            .with_edge(Edge::new("start", "a"));

        assert!(matches!(
            CompiledWorkflow::compile(def, &executors()),
            Err(RegistryError::UnknownActivityType { .. })
        ));
    }

    #[test]
    fn test_node_handlers_take_precedence() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(
                Node::task("a", "work")
                    .with_error_handler(ErrorHandler::catch_all().redirect_to("end")),
            )
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"))
            .with_error_handler(ErrorHandler::catch_all().with_compensation());

        let compiled = CompiledWorkflow::compile(def, &executors()).unwrap();
        let a = compiled.index_of("a").unwrap();
        let handler = compiled.error_handler(a, "Anything").unwrap();
        assert_eq!(handler.handler_node_id.as_deref(), Some("end"));

        let start = compiled.start();
        assert!(compiled.error_handler(start, "Anything").unwrap().compensate);
    }

    #[test]
    fn test_invalid_condition_fails_compile() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "end").when("a ==="));

        assert!(matches!(
            CompiledWorkflow::compile(def, &executors()),
            Err(RegistryError::InvalidExpression { .. })
        ));
    }
}

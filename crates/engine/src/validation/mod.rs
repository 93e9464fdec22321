//! Definition validator
//!
//! Structural checks run before a definition can be published:
//!
//! 1. exactly one start node, at least one end node, unique node ids
//! 2. edges, boundary events and handler redirects reference existing nodes
//! 3. every node except start is reachable from start
//! 4. every node except end nodes can reach an end (warning only)
//! 5. at most one default edge per node
//! 6. cycles must have conditional or boundary exits
//!
//! Node configs and expressions are parsed as part of the same pass so a
//! published definition never fails to compile.

use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::{Deserialize, Serialize};

use crate::definition::{NodeKind, NodeType, WorkflowDefinition};
use crate::expression::Expression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// Finding codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationCode {
    MissingStartNode,
    MultipleStartNodes,
    MissingEndNode,
    DuplicateNodeId,
    UnknownEdgeSource,
    UnknownEdgeTarget,
    UnknownBoundaryTarget,
    UnknownHandlerNode,
    InvalidNodeConfig,
    InvalidExpression,
    StartNodeHasIncoming,
    NoIncomingEdge,
    UnreachableNode,
    DeadEnd,
    EndNodeHasOutgoing,
    MultipleDefaultEdges,
    UnconditionalCycle,
    PotentialInfiniteLoop,
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub severity: Severity,
    pub code: ValidationCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Aggregated result of validating one definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationError> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationError> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    /// Active definitions have zero error-severity findings
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn has(&self, code: ValidationCode) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let errors: Vec<String> = self.errors().map(ToString::to_string).collect();
        write!(
            f,
            "{} error(s), {} warning(s)",
            errors.len(),
            self.warnings().count()
        )?;
        if !errors.is_empty() {
            write!(f, ": {}", errors.join("; "))?;
        }
        Ok(())
    }
}

/// Validate `def`, returning every finding
pub fn validate(def: &WorkflowDefinition) -> ValidationReport {
    let mut v = Validator {
        def,
        findings: Vec::new(),
    };
    v.run();
    ValidationReport { findings: v.findings }
}

struct Validator<'a> {
    def: &'a WorkflowDefinition,
    findings: Vec<ValidationError>,
}

impl<'a> Validator<'a> {
    fn run(&mut self) {
        let def = self.def;

        // (a) start / end / ids
        let starts: Vec<&str> = def
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .map(|n| n.id.as_str())
            .collect();
        match starts.len() {
            0 => self.error(ValidationCode::MissingStartNode, "definition has no start node", None),
            1 => {}
            n => self.error(
                ValidationCode::MultipleStartNodes,
                format!("definition has {} start nodes: {}", n, starts.join(", ")),
                None,
            ),
        }
        if !def.nodes.iter().any(|n| n.node_type == NodeType::End) {
            self.error(ValidationCode::MissingEndNode, "definition has no end node", None);
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, node) in def.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                self.error(
                    ValidationCode::DuplicateNodeId,
                    format!("node id '{}' is used more than once", node.id),
                    Some(&node.id),
                );
            }
        }

        self.check_configs();

        // (b) references; build the graph from the edges that resolve
        let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(def.nodes.len(), def.edges.len());
        let vertices: Vec<NodeIndex> = def.nodes.iter().map(|_| graph.add_node(())).collect();
        let mut sequence_edges: Vec<(usize, usize)> = Vec::new();
        let mut extra_links: Vec<(usize, usize)> = Vec::new();

        for edge in &def.edges {
            let source = index.get(edge.source.as_str()).copied();
            let target = index.get(edge.target.as_str()).copied();
            if source.is_none() {
                self.error(
                    ValidationCode::UnknownEdgeSource,
                    format!("edge {} -> {} has unknown source", edge.source, edge.target),
                    None,
                );
            }
            if target.is_none() {
                self.error(
                    ValidationCode::UnknownEdgeTarget,
                    format!("edge {} -> {} has unknown target", edge.source, edge.target),
                    None,
                );
            }
            if let (Some(s), Some(t)) = (source, target) {
                sequence_edges.push((s, t));
            }
        }

        for (i, node) in def.nodes.iter().enumerate() {
            for boundary in &node.boundary_events {
                match index.get(boundary.target_node_id.as_str()) {
                    Some(&t) => extra_links.push((i, t)),
                    None => self.error(
                        ValidationCode::UnknownBoundaryTarget,
                        format!(
                            "boundary event '{}' targets unknown node '{}'",
                            boundary.id, boundary.target_node_id
                        ),
                        Some(&node.id),
                    ),
                }
            }
            for handler in &node.error_handlers {
                if let Some(target) = &handler.handler_node_id {
                    match index.get(target.as_str()) {
                        Some(&t) => extra_links.push((i, t)),
                        None => self.unknown_handler(target, Some(&node.id)),
                    }
                }
            }
        }

        // Definition-level redirects can fire from any node
        for handler in &def.error_handlers {
            if let Some(target) = &handler.handler_node_id {
                match index.get(target.as_str()) {
                    Some(&t) => {
                        for (i, node) in def.nodes.iter().enumerate() {
                            if node.node_type == NodeType::Task {
                                extra_links.push((i, t));
                            }
                        }
                    }
                    None => self.unknown_handler(target, None),
                }
            }
        }

        for &(s, t) in &sequence_edges {
            graph.add_edge(vertices[s], vertices[t], ());
        }
        let mut flow = graph.clone();
        for &(s, t) in &extra_links {
            flow.add_edge(vertices[s], vertices[t], ());
        }

        // Incoming edges
        let mut incoming = vec![0usize; def.nodes.len()];
        for &(_, t) in &sequence_edges {
            incoming[t] += 1;
        }
        let mut linked = vec![false; def.nodes.len()];
        for &(_, t) in &extra_links {
            linked[t] = true;
        }
        for (i, node) in def.nodes.iter().enumerate() {
            if node.node_type == NodeType::Start {
                if incoming[i] > 0 || linked[i] {
                    self.error(
                        ValidationCode::StartNodeHasIncoming,
                        format!("start node '{}' has incoming edges", node.id),
                        Some(&node.id),
                    );
                }
            } else if incoming[i] == 0 && !linked[i] {
                self.error(
                    ValidationCode::NoIncomingEdge,
                    format!("node '{}' has no incoming edge", node.id),
                    Some(&node.id),
                );
            }
        }

        // (c) reachability from start
        if let Some(start) = def.nodes.iter().position(|n| n.node_type == NodeType::Start) {
            let mut reachable = HashSet::new();
            let mut dfs = Dfs::new(&flow, vertices[start]);
            while let Some(n) = dfs.next(&flow) {
                reachable.insert(n.index());
            }
            for (i, node) in def.nodes.iter().enumerate() {
                if !reachable.contains(&i) {
                    self.error(
                        ValidationCode::UnreachableNode,
                        format!("node '{}' is not reachable from start", node.id),
                        Some(&node.id),
                    );
                }
            }
        }

        // (d) every node can reach some end
        let mut reaches_end = HashSet::new();
        let reversed = Reversed(&flow);
        for (i, node) in def.nodes.iter().enumerate() {
            if node.node_type == NodeType::End && !reaches_end.contains(&i) {
                let mut dfs = Dfs::new(reversed, vertices[i]);
                while let Some(n) = dfs.next(reversed) {
                    reaches_end.insert(n.index());
                }
            }
        }
        for (i, node) in def.nodes.iter().enumerate() {
            if node.node_type != NodeType::End && !reaches_end.contains(&i) {
                self.warning(
                    ValidationCode::DeadEnd,
                    format!("node '{}' cannot reach an end node", node.id),
                    Some(&node.id),
                );
            }
        }

        // (e) default edges, end nodes with outgoing edges
        let mut outgoing = vec![0usize; def.nodes.len()];
        let mut defaults = vec![0usize; def.nodes.len()];
        let mut conditional = vec![false; def.nodes.len()];
        for edge in &def.edges {
            if let Some(&s) = index.get(edge.source.as_str()) {
                outgoing[s] += 1;
                if edge.is_default {
                    defaults[s] += 1;
                }
                if edge.condition.is_some() {
                    conditional[s] = true;
                }
            }
        }
        for (i, node) in def.nodes.iter().enumerate() {
            if defaults[i] > 1 {
                self.error(
                    ValidationCode::MultipleDefaultEdges,
                    format!("node '{}' has {} default edges", node.id, defaults[i]),
                    Some(&node.id),
                );
            }
            if node.node_type == NodeType::End && outgoing[i] > 0 {
                self.warning(
                    ValidationCode::EndNodeHasOutgoing,
                    format!("end node '{}' has outgoing edges that never fire", node.id),
                    Some(&node.id),
                );
            }
        }

        // (f) cycles over sequence edges only
        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || graph.find_edge(component[0], component[0]).is_some();
            if !is_cycle {
                continue;
            }

            let members: Vec<usize> = component.iter().map(|n| n.index()).collect();
            let with_exit = members
                .iter()
                .filter(|&&i| {
                    conditional[i]
                        || (defaults[i] > 0 && outgoing[i] > 1)
                        || !def.nodes[i].boundary_events.is_empty()
                })
                .count();

            let mut ids: Vec<&str> = members.iter().map(|&i| def.nodes[i].id.as_str()).collect();
            ids.sort_unstable();
            let ids = ids.join(", ");

            if with_exit == 0 {
                self.error(
                    ValidationCode::UnconditionalCycle,
                    format!("cycle through [{}] has no conditional or boundary exit", ids),
                    Some(ids.split(", ").next().unwrap_or_default()),
                );
            } else if with_exit < members.len() {
                self.warning(
                    ValidationCode::PotentialInfiniteLoop,
                    format!(
                        "cycle through [{}] has nodes without a conditional exit",
                        ids
                    ),
                    None,
                );
            }
        }
    }

    fn check_configs(&mut self) {
        let def = self.def;
        for node in &def.nodes {
            if let Err(e) = NodeKind::from_node(node) {
                self.error(ValidationCode::InvalidNodeConfig, e.to_string(), Some(&node.id));
            }
            for source in node.input_mappings.values().chain(node.output_mappings.values()) {
                self.check_expression(source, &node.id);
            }
        }
        for edge in &def.edges {
            if let Some(condition) = &edge.condition {
                self.check_expression(condition, &edge.source);
            }
        }
    }

    fn check_expression(&mut self, source: &str, node_id: &str) {
        if let Err(e) = Expression::parse(source) {
            self.error(
                ValidationCode::InvalidExpression,
                format!("expression '{}' is invalid: {}", source, e),
                Some(node_id),
            );
        }
    }

    fn unknown_handler(&mut self, target: &str, node_id: Option<&str>) {
        self.error(
            ValidationCode::UnknownHandlerNode,
            format!("error handler redirects to unknown node '{}'", target),
            node_id,
        );
    }

    fn error(&mut self, code: ValidationCode, message: impl Into<String>, node_id: Option<&str>) {
        self.push(Severity::Error, code, message.into(), node_id);
    }

    fn warning(&mut self, code: ValidationCode, message: impl Into<String>, node_id: Option<&str>) {
        self.push(Severity::Warning, code, message.into(), node_id);
    }

    fn push(&mut self, severity: Severity, code: ValidationCode, message: String, node_id: Option<&str>) {
        self.findings.push(ValidationError {
            severity,
            code,
            message,
            node_id: node_id.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{BoundaryEvent, BoundaryTrigger, Edge, Node};

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "work"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"))
    }

    #[test]
    fn test_valid_linear_definition() {
        let report = validate(&linear());
        assert!(report.is_valid(), "{}", report);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_missing_start_and_end() {
        let def = WorkflowDefinition::new("wf", 1).with_node(Node::task("a", "work"));
        let report = validate(&def);

        assert!(report.has(ValidationCode::MissingStartNode));
        assert!(report.has(ValidationCode::MissingEndNode));
        assert!(!report.is_valid());
    }

    #[test]
    fn test_multiple_start_nodes() {
        let def = linear()
            .with_node(Node::start("start2"))
            .with_edge(Edge::new("start2", "a"));
        assert!(validate(&def).has(ValidationCode::MultipleStartNodes));
    }

    #[test]
    fn test_unknown_edge_endpoints() {
        let def = linear().with_edge(Edge::new("ghost", "end")).with_edge(Edge::new("a", "nowhere"));
        let report = validate(&def);

        assert!(report.has(ValidationCode::UnknownEdgeSource));
        assert!(report.has(ValidationCode::UnknownEdgeTarget));
    }

    #[test]
    fn test_unreachable_node() {
        let def = linear()
            .with_node(Node::task("island", "work"))
            .with_node(Node::task("feeder", "work"))
            .with_edge(Edge::new("feeder", "island"))
            .with_edge(Edge::new("island", "end"));
        let report = validate(&def);

        assert!(report.has(ValidationCode::UnreachableNode));
        assert!(report.has(ValidationCode::NoIncomingEdge));
    }

    #[test]
    fn test_dead_end_is_warning() {
        let def = linear()
            .with_node(Node::signal_wait("limbo", "never"))
            .with_edge(Edge::new("a", "limbo").when("false"));
        let report = validate(&def);

        assert!(report.has(ValidationCode::DeadEnd));
        assert!(report.is_valid());
    }

    #[test]
    fn test_boundary_exit_counts_for_reachability() {
        let mut def = linear()
            .with_node(Node::task("fallback", "work"))
            .with_edge(Edge::new("fallback", "end"));
        def.nodes[1] = Node::task("a", "work").with_boundary(BoundaryEvent::new(
            "on-error",
            BoundaryTrigger::Error { error_codes: vec![] },
            "fallback",
        ));
        let report = validate(&def);

        assert!(report.is_valid(), "{}", report);
        assert!(!report.has(ValidationCode::UnreachableNode));
    }

    #[test]
    fn test_multiple_default_edges() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::exclusive("gw"))
            .with_node(Node::end("x"))
            .with_node(Node::end("y"))
            .with_edge(Edge::new("start", "gw"))
            .with_edge(Edge::new("gw", "x").default_edge())
            .with_edge(Edge::new("gw", "y").default_edge());

        assert!(validate(&def).has(ValidationCode::MultipleDefaultEdges));
    }

    #[test]
    fn test_unconditional_cycle_is_error() {
        let def = linear()
            .with_node(Node::task("b", "work"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "a"));
        let report = validate(&def);

        assert!(report.has(ValidationCode::UnconditionalCycle));
        assert!(!report.is_valid());
    }

    #[test]
    fn test_partially_conditional_cycle_is_warning() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::task("work", "work"))
            .with_node(Node::exclusive("check"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "work"))
            .with_edge(Edge::new("work", "check"))
            .with_edge(Edge::new("check", "work").when("count < 3"))
            .with_edge(Edge::new("check", "end").default_edge());
        let report = validate(&def);

        assert!(report.is_valid(), "{}", report);
        assert!(report.has(ValidationCode::PotentialInfiniteLoop));
    }

    #[test]
    fn test_fully_guarded_cycle_is_accepted() {
        let def = WorkflowDefinition::new("wf", 1)
            .with_node(Node::start("start"))
            .with_node(Node::exclusive("g1"))
            .with_node(Node::exclusive("g2"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "g1"))
            .with_edge(Edge::new("g1", "g2").when("n < 5"))
            .with_edge(Edge::new("g1", "end").default_edge())
            .with_edge(Edge::new("g2", "g1").when("true"))
            .with_edge(Edge::new("g2", "end").default_edge());
        let report = validate(&def);

        assert!(report.findings.is_empty(), "{}", report);
    }

    #[test]
    fn test_self_loop_detected() {
        let def = linear().with_edge(Edge::new("a", "a"));
        assert!(validate(&def).has(ValidationCode::UnconditionalCycle));
    }

    #[test]
    fn test_invalid_expression_and_config() {
        let mut def = linear();
        def.edges[1].condition = Some("a >".into());
        def.nodes.push(Node::new("broken", NodeType::Event));
        def.edges.push(Edge::new("a", "broken").when("true"));
        def.edges.push(Edge::new("broken", "end"));
        let report = validate(&def);

        assert!(report.has(ValidationCode::InvalidExpression));
        assert!(report.has(ValidationCode::InvalidNodeConfig));
    }

    #[test]
    fn test_unknown_handler_node() {
        let def = linear().with_error_handler(
            crate::definition::ErrorHandler::catch_all().redirect_to("missing"),
        );
        assert!(validate(&def).has(ValidationCode::UnknownHandlerNode));
    }

    #[test]
    fn test_report_display_lists_errors() {
        let def = WorkflowDefinition::new("wf", 1);
        let text = validate(&def).to_string();
        assert!(text.starts_with("2 error(s)"));
        assert!(text.contains("MissingStartNode"));
    }
}

//! Published workflow definition shapes
//!
//! These are the serialized forms collaborators hand to the engine. They are
//! immutable once published; the scheduler never reads them directly but
//! works from the [`CompiledWorkflow`](super::CompiledWorkflow) built from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::reliability::RetryPolicy;

/// A workflow graph identified by `(workflow_id, version)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub input_parameters: Vec<Parameter>,
    #[serde(default)]
    pub output_parameters: Vec<Parameter>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub error_handlers: Vec<ErrorHandler>,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: impl Into<String>, version: u32) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version,
            name: None,
            description: None,
            nodes: vec![],
            edges: vec![],
            input_parameters: vec![],
            output_parameters: vec![],
            variables: vec![],
            triggers: vec![],
            error_handlers: vec![],
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_input(mut self, parameter: Parameter) -> Self {
        self.input_parameters.push(parameter);
        self
    }

    pub fn with_output(mut self, parameter: Parameter) -> Self {
        self.output_parameters.push(parameter);
        self
    }

    pub fn with_variable(mut self, variable: VariableDefinition) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handlers.push(handler);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Whether any trigger starts this workflow on `event_name`
    pub fn is_triggered_by(&self, event_name: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, Trigger::Event { event_name: name } if name == event_name))
    }
}

/// Node type, a closed set resolved to an executor at compile time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Start,
    End,
    Task,
    ExclusiveGateway,
    ParallelGateway,
    Event,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task => "task",
            Self::ExclusiveGateway => "exclusiveGateway",
            Self::ParallelGateway => "parallelGateway",
            Self::Event => "event",
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::ExclusiveGateway | Self::ParallelGateway)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vertex of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Type-specific settings; parsed into a typed config at compile time
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary_events: Vec<BoundaryEvent>,
    /// Input field name -> expression over instance variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mappings: BTreeMap<String, String>,
    /// Variable name (dotted paths allowed) -> expression over `input` and `output`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mappings: BTreeMap<String, String>,
    /// Node-level handlers, consulted before the definition's
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_handlers: Vec<ErrorHandler>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            name: None,
            node_type,
            config: Map::new(),
            boundary_events: vec![],
            input_mappings: BTreeMap::new(),
            output_mappings: BTreeMap::new(),
            error_handlers: vec![],
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::End)
    }

    /// A task node running the executor registered for `activity_type`
    pub fn task(id: impl Into<String>, activity_type: &str) -> Self {
        Self::new(id, NodeType::Task).with_config("activityType", Value::from(activity_type))
    }

    pub fn exclusive(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::ExclusiveGateway)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::ParallelGateway)
    }

    /// An event node waiting for signal `signal_name`
    pub fn signal_wait(id: impl Into<String>, signal_name: &str) -> Self {
        Self::new(id, NodeType::Event)
            .with_config("eventType", Value::from("signal"))
            .with_config("signalName", Value::from(signal_name))
    }

    /// An event node waiting for named event `event_name`
    pub fn event_wait(id: impl Into<String>, event_name: &str) -> Self {
        Self::new(id, NodeType::Event)
            .with_config("eventType", Value::from("event"))
            .with_config("eventName", Value::from(event_name))
    }

    /// An event node that waits for `duration_ms`
    pub fn timer(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, NodeType::Event)
            .with_config("eventType", Value::from("timer"))
            .with_config("durationMs", Value::from(duration_ms))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_input_mapping(mut self, field: &str, expression: &str) -> Self {
        self.input_mappings
            .insert(field.to_string(), expression.to_string());
        self
    }

    pub fn with_output_mapping(mut self, variable: &str, expression: &str) -> Self {
        self.output_mappings
            .insert(variable.to_string(), expression.to_string());
        self
    }

    pub fn with_boundary(mut self, boundary: BoundaryEvent) -> Self {
        self.boundary_events.push(boundary);
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handlers.push(handler);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A directed, optionally conditional, connection between two nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Lower values are evaluated first
    #[serde(default)]
    pub priority: i32,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            is_default: false,
            priority: 0,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn default_edge(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// An event attached to a node that can interrupt it or run alongside it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryEvent {
    pub id: String,
    pub trigger: BoundaryTrigger,
    pub target_node_id: String,
    /// Interrupt the host node when the boundary fires
    #[serde(default = "default_true")]
    pub cancel_activity: bool,
}

fn default_true() -> bool {
    true
}

impl BoundaryEvent {
    pub fn new(id: impl Into<String>, trigger: BoundaryTrigger, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger,
            target_node_id: target.into(),
            cancel_activity: true,
        }
    }

    pub fn non_interrupting(mut self) -> Self {
        self.cancel_activity = false;
        self
    }

    /// Whether this is an error boundary catching `code`
    pub fn catches(&self, code: &str) -> bool {
        match &self.trigger {
            BoundaryTrigger::Error { error_codes } => {
                error_codes.is_empty() || error_codes.iter().any(|c| c == code || c == "*")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BoundaryTrigger {
    Error {
        #[serde(default)]
        error_codes: Vec<String>,
    },
    Timer {
        duration_ms: u64,
    },
    Signal {
        signal_name: String,
    },
    Event {
        event_name: String,
    },
}

/// Value types accepted for parameters and variables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl ValueType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// A declared workflow input or output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Parameter {
    pub fn required(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            required: false,
            ..Self::required(name, value_type)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum VariableScope {
    #[default]
    Instance,
    /// Injected into each node's input, never persisted on the instance
    Node,
}

/// A declared workflow variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub scope: VariableScope,
}

impl VariableDefinition {
    pub fn instance(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::Any,
            default: Some(default),
            scope: VariableScope::Instance,
        }
    }

    pub fn node(name: impl Into<String>, default: Value) -> Self {
        Self {
            scope: VariableScope::Node,
            ..Self::instance(name, default)
        }
    }
}

/// How an instance of a workflow comes into existence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Trigger {
    Manual,
    Scheduled { cron: String },
    Event { event_name: String },
    Webhook { path: String },
    Message { message_name: String },
}

/// Fault handling rule for activity errors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandler {
    /// Codes handled by this rule; empty matches every code
    #[serde(default)]
    pub error_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_node_id: Option<String>,
    #[serde(default)]
    pub compensate: bool,
    #[serde(default)]
    pub terminate: bool,
}

impl ErrorHandler {
    /// Handler matching every error code
    pub fn catch_all() -> Self {
        Self::default()
    }

    pub fn for_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            error_codes: codes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn redirect_to(mut self, node_id: impl Into<String>) -> Self {
        self.handler_node_id = Some(node_id.into());
        self
    }

    pub fn with_compensation(mut self) -> Self {
        self.compensate = true;
        self
    }

    pub fn with_terminate(mut self) -> Self {
        self.terminate = true;
        self
    }

    pub fn matches(&self, code: &str) -> bool {
        self.error_codes.is_empty() || self.error_codes.iter().any(|c| c == code || c == "*")
    }
}

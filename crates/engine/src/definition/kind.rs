//! Typed node configuration
//!
//! `Node::config` is an open map on the wire; compilation parses it into one
//! of these variants so type dispatch happens once per definition.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{Node, NodeType};
use crate::error::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub activity_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum EventConfig {
    Timer { duration_ms: u64 },
    Signal { signal_name: String },
    Event { event_name: String },
}

/// Node type with its parsed config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Start,
    End,
    Task(TaskConfig),
    ExclusiveGateway,
    ParallelGateway,
    Event(EventConfig),
}

impl NodeKind {
    pub fn from_node(node: &Node) -> Result<Self, RegistryError> {
        let parse_err = |e: serde_json::Error| RegistryError::InvalidNodeConfig {
            node_id: node.id.clone(),
            message: e.to_string(),
        };

        let kind = match node.node_type {
            NodeType::Start => Self::Start,
            NodeType::End => Self::End,
            NodeType::ExclusiveGateway => Self::ExclusiveGateway,
            NodeType::ParallelGateway => Self::ParallelGateway,
            NodeType::Task => Self::Task(
                serde_json::from_value(Value::Object(node.config.clone())).map_err(parse_err)?,
            ),
            NodeType::Event => Self::Event(
                serde_json::from_value(Value::Object(node.config.clone())).map_err(parse_err)?,
            ),
        };
        Ok(kind)
    }

    /// Whether completed executions are recorded for compensation
    pub fn is_compensable(&self) -> bool {
        matches!(self, Self::Task(_))
    }
}

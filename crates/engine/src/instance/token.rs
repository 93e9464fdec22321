//! Control-flow tokens and parallel fork bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// State of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// Ready to execute its node
    Ready,
    /// Suspended on one or more bookmarks
    Waiting,
    /// Its bookmark was consumed; completes the node with `resume_payload`
    Resumed,
    /// Failed attempt, next attempt at `due_at`
    RetryWaiting,
    /// Failed with no handler; kept so `Retry` can re-enter here
    Faulted,
}

/// A unit of in-flight control flow positioned at a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionToken {
    pub id: Uuid,
    pub node_id: String,
    pub state: TokenState,
    /// Failed attempts of the current node so far
    #[serde(default)]
    pub attempt: u32,
    /// Enclosing fork frames, innermost last
    #[serde(default)]
    pub forks: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
}

impl ExecutionToken {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            node_id: node_id.into(),
            state: TokenState::Ready,
            attempt: 0,
            forks: vec![],
            due_at: None,
            resume_payload: None,
        }
    }

    /// A new token at `node_id` inside the same fork frames as `self`
    pub fn sibling(&self, node_id: impl Into<String>) -> Self {
        Self {
            forks: self.forks.clone(),
            ..Self::new(node_id)
        }
    }

    /// Reposition at `node_id`, ready to run with a fresh attempt counter
    pub fn move_to(&mut self, node_id: impl Into<String>) {
        self.node_id = node_id.into();
        self.state = TokenState::Ready;
        self.attempt = 0;
        self.due_at = None;
        self.resume_payload = None;
    }

    pub fn innermost_fork(&self) -> Option<Uuid> {
        self.forks.last().copied()
    }
}

/// Branch accounting for one parallel fork
///
/// `outstanding` counts branches that can still arrive at a join,
/// including those already parked in `arrived`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkFrame {
    pub id: Uuid,
    pub gateway_id: String,
    pub outstanding: u32,
    /// Tokens parked at the join, in arrival order
    #[serde(default)]
    pub arrived: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_node: Option<String>,
    /// Fork frames of the token that forked
    #[serde(default)]
    pub parent_forks: Vec<Uuid>,
}

impl ForkFrame {
    pub fn new(gateway_id: impl Into<String>, branches: u32, parent_forks: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            gateway_id: gateway_id.into(),
            outstanding: branches,
            arrived: vec![],
            join_node: None,
            parent_forks,
        }
    }

    /// Every branch that can still arrive has arrived
    pub fn is_satisfied(&self) -> bool {
        !self.arrived.is_empty() && self.arrived.len() as u32 >= self.outstanding
    }
}

//! Workflow definitions
//!
//! - [`model`]: the published, serializable shapes
//! - [`NodeKind`]: closed node variants resolved from `type` + `config`
//! - [`CompiledWorkflow`]: the immutable arena the scheduler walks
//! - [`DefinitionRegistry`]: publish, version and look up definitions

mod compiled;
mod kind;
mod model;
mod registry;

pub use compiled::{CompiledBoundary, CompiledEdge, CompiledNode, CompiledWorkflow, NodeIndex};
pub use kind::{EventConfig, NodeKind, TaskConfig};
pub use model::{
    BoundaryEvent, BoundaryTrigger, Edge, ErrorHandler, Node, NodeType, Parameter, Trigger,
    ValueType, VariableDefinition, VariableScope, WorkflowDefinition,
};
pub use registry::{DefinitionRegistry, DefinitionSummary};

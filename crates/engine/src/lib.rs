//! # Workflow Orchestration Engine
//!
//! A durable, resumable process engine for clinical and administrative
//! workflows: patient intake, consent, lab follow-up, billing.
//!
//! ## Features
//!
//! - **Graph definitions**: validated and compiled once into an arena, with
//!   exclusive and parallel gateways, joins, timers and boundary events
//! - **Suspend anywhere**: bookmarks are durable; resumption is data-driven,
//!   so an instance survives a process restart between any two steps
//! - **Automatic retries**: per-activity retry policies with exponential backoff
//! - **Compensation**: executed activities are undone in reverse order after a
//!   fault or cancellation
//! - **Optimistic concurrency**: every step is one load, mutate, save cycle
//!   against a revisioned snapshot (in-memory or PostgreSQL)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            WorkflowEngine (lifecycle + router)               │
//! │  (start, resume, signal, broadcast, events, cancel, retry)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (per-instance lock, executes tokens, routes, compensates)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      InstanceStore                           │
//! │  (snapshot + revision, bookmark and due-time lookups)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! With [`DispatchMode::Queued`] a [`WorkerPool`] drains the work queue and
//! a due poller re-enqueues instances whose timers or retries come due.
//!
//! ## Example
//!
//! ```ignore
//! use clinicflow_engine::prelude::*;
//!
//! let mut executors = ExecutorRegistry::new();
//! executors.register_fn("notify", |input| async move {
//!     Ok(ExecutionResult::completed(json!({ "sent": true, "to": input["patientId"] })))
//! });
//!
//! let engine = WorkflowEngine::new(
//!     Arc::new(InMemoryInstanceStore::new()),
//!     executors,
//!     EngineConfig::default(),
//! );
//! engine.publish_definition(
//!     WorkflowDefinition::new("intake", 1)
//!         .with_node(Node::start("start"))
//!         .with_node(Node::task("notify", "notify"))
//!         .with_node(Node::end("end"))
//!         .with_edge(Edge::new("start", "notify"))
//!         .with_edge(Edge::new("notify", "end")),
//! )?;
//!
//! let result = engine
//!     .execute(StartWorkflowRequest::new("intake").with_input(json!({ "patientId": "p-1" })))
//!     .await?;
//! assert_eq!(result.status, InstanceStatus::Completed);
//! ```

pub mod activity;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod expression;
pub mod instance;
pub mod lifecycle;
pub mod persistence;
pub mod reliability;
pub mod requests;
pub mod router;
pub mod validation;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{
        ActivityContext, ActivityError, ActivityExecutor, ExecutionResult, ExecutorRegistry,
    };
    pub use crate::config::{DispatchMode, EngineConfig};
    pub use crate::definition::{
        BoundaryEvent, BoundaryTrigger, Edge, ErrorHandler, Node, NodeType, Parameter, Trigger,
        ValueType, VariableDefinition, WorkflowDefinition,
    };
    pub use crate::error::EngineError;
    pub use crate::instance::{HistoryEventType, InstanceStatus, WorkflowInstance};
    pub use crate::lifecycle::WorkflowEngine;
    pub use crate::persistence::{
        InMemoryInstanceStore, InstanceStore, PostgresInstanceStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::requests::{
        BroadcastSignalRequest, CancelWorkflowRequest, ResumeWorkflowRequest,
        StartWorkflowRequest, TriggerEventRequest, WorkflowExecutionResult,
    };
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};

    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use activity::{ActivityContext, ActivityError, ActivityExecutor, ExecutionResult, ExecutorRegistry};
pub use config::{DispatchMode, EngineConfig};
pub use definition::{DefinitionRegistry, WorkflowDefinition};
pub use error::{EngineError, RegistryError};
pub use expression::{Expression, ExpressionError};
pub use instance::{InstanceStatus, WorkflowInstance};
pub use lifecycle::WorkflowEngine;
pub use persistence::{InMemoryInstanceStore, InstanceStore, PostgresInstanceStore, StoreError};
pub use reliability::RetryPolicy;
pub use router::{BroadcastFailure, BroadcastReport};
pub use validation::{validate, ValidationReport};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};

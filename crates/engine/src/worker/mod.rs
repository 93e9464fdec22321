//! Queued dispatch: a priority work queue drained by a worker pool
//!
//! This module provides:
//! - [`WorkQueue`] - Deduplicating priority queue of runnable instances
//! - [`WorkerPool`] - Step loops over the queue with graceful shutdown
//! - [`DuePoller`] - Wakes instances whose retries, timers or starts are due
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        WorkerPool                         │
//! │  ┌──────────────┐          ┌──────────────────────────┐  │
//! │  │  DuePoller   │── push ─▶│        WorkQueue         │  │
//! │  │ (find_due)   │          │ (priority, then FIFO)    │  │
//! │  └──────────────┘          └────────────┬─────────────┘  │
//! │                                         │ pop            │
//! │                                         ▼                │
//! │  ┌──────────────────────────────────────────────────┐   │
//! │  │  Step loops: Scheduler::run_step                  │   │
//! │  │  [worker 0] [worker 1] ... [worker N]             │   │
//! │  │  Yielded ─▶ requeue                               │   │
//! │  └──────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use clinicflow_engine::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = EngineConfig::default().with_dispatch(DispatchMode::Queued);
//! let engine = WorkflowEngine::new(store, executors, config);
//!
//! let pool = WorkerPool::new(engine.scheduler().clone(), WorkerPoolConfig::new().with_worker_count(8));
//! pool.start()?;
//!
//! engine.start(StartWorkflowRequest::new("intake")).await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod poller;
mod pool;
mod queue;

pub use poller::{DuePoller, PollerConfig};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use queue::WorkQueue;

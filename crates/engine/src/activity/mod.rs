//! Activity executors
//!
//! Every node is backed by an [`ActivityExecutor`], resolved once when the
//! definition is compiled. Built-in executors cover start, end, gateway and
//! event nodes; task executors are supplied by the host application and
//! registered by activity type in an [`ExecutorRegistry`].
//!
//! Executors:
//! - Return `Completed`, `Suspended` or `Faulted` (see [`ExecutionResult`])
//! - May return an [`ActivityError`], classified as retryable or not
//! - Should honor the cancellation token in their [`ActivityContext`]

mod builtin;
mod context;
mod executor;
mod registry;

pub use builtin::{EndExecutor, EventExecutor, GatewayExecutor, StartExecutor};
pub use context::ActivityContext;
pub use executor::{
    async_activity_bookmark, ActivityError, ActivityExecutor, ExecutionResult, Suspension,
    ASYNC_ACTIVITY_BOOKMARK,
};
pub use registry::ExecutorRegistry;

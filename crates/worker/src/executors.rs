//! Activity executors built into the worker binary

use clinicflow_engine::prelude::*;

/// `log` writes its input to the worker log; `echo` returns its input as output
pub fn builtin() -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    executors.register_fn("log", |input| async move {
        tracing::info!(input = %input, "log activity");
        Ok(ExecutionResult::done())
    });
    executors.register_fn("echo", |input| async move { Ok(ExecutionResult::completed(input)) });
    executors
}

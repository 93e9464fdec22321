//! Executor registry keyed by activity type
//!
//! Resolution happens once per node when a definition is compiled, so the
//! scheduler never dispatches on type strings at run time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::builtin::{EndExecutor, EventExecutor, GatewayExecutor, StartExecutor};
use super::{ActivityContext, ActivityError, ActivityExecutor, ExecutionResult};
use crate::definition::NodeKind;
use crate::error::RegistryError;

type TaskFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<ExecutionResult, ActivityError>> + Send + Sync>;

/// Closure-backed task executor
struct FnExecutor {
    handler: TaskFn,
}

#[async_trait]
impl ActivityExecutor for FnExecutor {
    async fn execute(
        &self,
        _ctx: &ActivityContext<'_>,
        input: Value,
    ) -> Result<ExecutionResult, ActivityError> {
        (self.handler)(input).await
    }
}

/// Registry of task executors
///
/// # Example
///
/// ```ignore
/// let mut executors = ExecutorRegistry::new();
/// executors.register("send_email", SendEmailExecutor::new(mailer));
/// executors.register_fn("double", |input| async move {
///     let x = input["x"].as_i64().unwrap_or(0);
///     Ok(ExecutionResult::completed(json!({ "x": x * 2 })))
/// });
/// ```
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    tasks: HashMap<String, Arc<dyn ActivityExecutor>>,
    start: Arc<StartExecutor>,
    end: Arc<EndExecutor>,
    gateway: Arc<GatewayExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for task nodes of `activity_type`
    pub fn register<E: ActivityExecutor>(&mut self, activity_type: &str, executor: E) -> &mut Self {
        self.tasks
            .insert(activity_type.to_string(), Arc::new(executor));
        self
    }

    /// Register an already shared executor
    pub fn register_arc(
        &mut self,
        activity_type: &str,
        executor: Arc<dyn ActivityExecutor>,
    ) -> &mut Self {
        self.tasks.insert(activity_type.to_string(), executor);
        self
    }

    /// Register a closure over the node input
    pub fn register_fn<F, Fut>(&mut self, activity_type: &str, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionResult, ActivityError>> + Send + 'static,
    {
        let handler: TaskFn = Arc::new(move |input| Box::pin(handler(input)));
        self.register(activity_type, FnExecutor { handler })
    }

    /// Builder-style registration
    pub fn with<E: ActivityExecutor>(mut self, activity_type: &str, executor: E) -> Self {
        self.register(activity_type, executor);
        self
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.tasks.contains_key(activity_type)
    }

    pub fn activity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Resolve the executor backing a compiled node
    pub fn resolve(
        &self,
        node_id: &str,
        kind: &NodeKind,
    ) -> Result<Arc<dyn ActivityExecutor>, RegistryError> {
        let executor: Arc<dyn ActivityExecutor> = match kind {
            NodeKind::Start => self.start.clone(),
            NodeKind::End => self.end.clone(),
            NodeKind::ExclusiveGateway | NodeKind::ParallelGateway => self.gateway.clone(),
            NodeKind::Event(config) => Arc::new(EventExecutor::new(config.clone())),
            NodeKind::Task(task) => self
                .tasks
                .get(&task.activity_type)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownActivityType {
                    node_id: node_id.to_string(),
                    activity_type: task.activity_type.clone(),
                })?,
        };
        Ok(executor)
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EventConfig, TaskConfig};
    use crate::instance::Variables;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn test_builtins_always_resolve() {
        let registry = ExecutorRegistry::new();
        assert!(registry.resolve("s", &NodeKind::Start).is_ok());
        assert!(registry.resolve("e", &NodeKind::End).is_ok());
        assert!(registry.resolve("g", &NodeKind::ParallelGateway).is_ok());
        assert!(registry
            .resolve(
                "t",
                &NodeKind::Event(EventConfig::Signal {
                    signal_name: "go".into()
                })
            )
            .is_ok());
    }

    #[test]
    fn test_unknown_activity_type() {
        let registry = ExecutorRegistry::new();
        let kind = NodeKind::Task(TaskConfig {
            activity_type: "missing".into(),
        });

        assert_eq!(
            registry.resolve("a", &kind).err(),
            Some(RegistryError::UnknownActivityType {
                node_id: "a".into(),
                activity_type: "missing".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_register_fn_executor() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("double", |input| async move {
            let x = input["x"].as_i64().unwrap_or(0);
            Ok(ExecutionResult::completed(json!({ "x": x * 2 })))
        });
        assert_eq!(registry.activity_types(), vec!["double"]);

        let kind = NodeKind::Task(TaskConfig {
            activity_type: "double".into(),
        });
        let executor = registry.resolve("a", &kind).unwrap();

        let node = crate::definition::Node::task("a", "double");
        let vars = Variables::new();
        let ctx = ActivityContext::new(
            Uuid::now_v7(),
            "wf",
            1,
            None,
            &node,
            &vars,
            Uuid::now_v7(),
            CancellationToken::new(),
        );
        let result = executor.execute(&ctx, json!({"x": 21})).await.unwrap();
        assert_eq!(result, ExecutionResult::completed(json!({"x": 42})));
    }
}

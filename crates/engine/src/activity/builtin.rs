//! Built-in executors for control-flow and event nodes
//!
//! Gateways are pure: edge selection happens in the scheduler's routing
//! step, so their executors only mark the node as passed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{ActivityContext, ActivityError, ActivityExecutor, ExecutionResult};
use crate::definition::EventConfig;

#[derive(Debug, Default, Clone, Copy)]
pub struct StartExecutor;

#[async_trait]
impl ActivityExecutor for StartExecutor {
    async fn execute(
        &self,
        _ctx: &ActivityContext<'_>,
        _input: Value,
    ) -> Result<ExecutionResult, ActivityError> {
        Ok(ExecutionResult::done())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EndExecutor;

#[async_trait]
impl ActivityExecutor for EndExecutor {
    async fn execute(
        &self,
        _ctx: &ActivityContext<'_>,
        _input: Value,
    ) -> Result<ExecutionResult, ActivityError> {
        Ok(ExecutionResult::done())
    }
}

/// Exclusive and parallel gateways
#[derive(Debug, Default, Clone, Copy)]
pub struct GatewayExecutor;

#[async_trait]
impl ActivityExecutor for GatewayExecutor {
    async fn execute(
        &self,
        _ctx: &ActivityContext<'_>,
        _input: Value,
    ) -> Result<ExecutionResult, ActivityError> {
        Ok(ExecutionResult::done())
    }
}

/// Intermediate event node: suspends on a signal, a named event or a timer
#[derive(Debug, Clone)]
pub struct EventExecutor {
    config: EventConfig,
}

impl EventExecutor {
    pub fn new(config: EventConfig) -> Self {
        Self { config }
    }

    /// Timer bookmark name, unique per node and token
    pub fn timer_bookmark(node_id: &str, token: uuid::Uuid) -> String {
        format!("__timer__:{}:{}", node_id, token)
    }
}

#[async_trait]
impl ActivityExecutor for EventExecutor {
    async fn execute(
        &self,
        ctx: &ActivityContext<'_>,
        _input: Value,
    ) -> Result<ExecutionResult, ActivityError> {
        let result = match &self.config {
            EventConfig::Signal { signal_name } => ExecutionResult::suspended(signal_name.clone()),
            EventConfig::Event { event_name } => ExecutionResult::await_event(event_name.clone()),
            EventConfig::Timer { duration_ms } => {
                let delay = chrono::Duration::milliseconds(
                    i64::try_from(*duration_ms).unwrap_or(i64::MAX),
                );
                let due_at = Utc::now()
                    .checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                ExecutionResult::timer(Self::timer_bookmark(ctx.activity_id(), ctx.token), due_at)
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Node;
    use crate::instance::{BookmarkKind, Variables};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn run(executor: &dyn ActivityExecutor, node: &Node) -> ExecutionResult {
        let vars = Variables::new();
        let ctx = ActivityContext::new(
            Uuid::now_v7(),
            "wf",
            1,
            None,
            node,
            &vars,
            Uuid::now_v7(),
            CancellationToken::new(),
        );
        executor.execute(&ctx, Value::Null).await.unwrap()
    }

    #[tokio::test]
    async fn test_control_flow_executors_complete() {
        let node = Node::start("start");
        assert_eq!(run(&StartExecutor, &node).await, ExecutionResult::done());
        assert_eq!(run(&EndExecutor, &node).await, ExecutionResult::done());
        assert_eq!(run(&GatewayExecutor, &node).await, ExecutionResult::done());
    }

    #[tokio::test]
    async fn test_signal_event_suspends_on_signal_name() {
        let node = Node::signal_wait("wait", "approve");
        let executor = EventExecutor::new(EventConfig::Signal {
            signal_name: "approve".into(),
        });

        assert_eq!(run(&executor, &node).await, ExecutionResult::suspended("approve"));
    }

    #[tokio::test]
    async fn test_timer_event_sets_due_time() {
        let node = Node::timer("pause", 1_000);
        let executor = EventExecutor::new(EventConfig::Timer { duration_ms: 1_000 });
        let before = Utc::now();

        match run(&executor, &node).await {
            ExecutionResult::Suspended(s) => {
                assert_eq!(s.kind, BookmarkKind::Timer);
                assert!(s.bookmark.starts_with("__timer__:pause:"));
                let due = s.due_at.unwrap();
                assert!(due >= before + chrono::Duration::milliseconds(1_000));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

//! Activity execution context

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::definition::Node;
use crate::instance::Variables;

/// Context provided to executors during one execution attempt
///
/// Borrowed from the instance being advanced; executors that need data past
/// the call must clone it.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext<'_>, input: Value) -> Result<ExecutionResult, ActivityError> {
///     tokio::select! {
///         result = call_lab_system(&input) => Ok(ExecutionResult::completed(result?)),
///         _ = ctx.cancelled() => Err(ActivityError::non_retryable("cancelled")),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext<'a> {
    pub instance_id: Uuid,
    pub workflow_id: &'a str,
    pub workflow_version: u32,
    pub correlation_id: Option<&'a str>,

    /// Node being executed, including its raw config
    pub node: &'a Node,

    /// Instance variables as of this step
    pub variables: &'a Variables,

    /// Token executing the node
    pub token: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the matching retry policy
    pub max_attempts: u32,

    cancellation: CancellationToken,
}

impl<'a> ActivityContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: Uuid,
        workflow_id: &'a str,
        workflow_version: u32,
        correlation_id: Option<&'a str>,
        node: &'a Node,
        variables: &'a Variables,
        token: Uuid,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            workflow_id,
            workflow_version,
            correlation_id,
            node,
            variables,
            token,
            attempt: 1,
            max_attempts: 1,
            cancellation,
        }
    }

    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts.max(attempt);
        self
    }

    /// Activity ID within the workflow
    pub fn activity_id(&self) -> &str {
        &self.node.id
    }

    /// String value from the node config
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.node.config.get(key).and_then(|v| v.as_str())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the instance is cancelled or terminated
    ///
    /// Useful in `tokio::select!` around external calls.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_context_creation() {
        let node = Node::task("notify", "email").with_config("template", json!("reminder"));
        let vars = Variables::new();
        let instance_id = Uuid::now_v7();
        let ctx = ActivityContext::new(
            instance_id,
            "intake",
            2,
            Some("patient-1"),
            &node,
            &vars,
            Uuid::now_v7(),
            CancellationToken::new(),
        )
        .with_attempt(1, 3);

        assert_eq!(ctx.instance_id, instance_id);
        assert_eq!(ctx.activity_id(), "notify");
        assert_eq!(ctx.config_str("template"), Some("reminder"));
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn test_cancellation_is_observed() {
        let node = Node::task("notify", "email");
        let vars = Variables::new();
        let token = CancellationToken::new();
        let ctx = ActivityContext::new(
            Uuid::now_v7(),
            "intake",
            1,
            None,
            &node,
            &vars,
            Uuid::now_v7(),
            token.clone(),
        );

        token.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }

    #[test]
    fn test_is_last_attempt() {
        let node = Node::task("notify", "email");
        let vars = Variables::new();
        let ctx = ActivityContext::new(
            Uuid::now_v7(),
            "intake",
            1,
            None,
            &node,
            &vars,
            Uuid::now_v7(),
            CancellationToken::new(),
        )
        .with_attempt(3, 3);
        assert!(ctx.is_last_attempt());
    }
}

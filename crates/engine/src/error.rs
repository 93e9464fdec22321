//! Engine error taxonomy

use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::instance::InstanceStatus;
use crate::persistence::StoreError;
use crate::validation::ValidationReport;

/// Errors surfaced by the public engine API
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition failed structural validation; blocks publish
    #[error("workflow definition is invalid: {0}")]
    Validation(ValidationReport),

    #[error("workflow definition not found: {workflow_id} (version {version:?})")]
    DefinitionNotFound {
        workflow_id: String,
        version: Option<u32>,
    },

    #[error("workflow definition {workflow_id} v{version} is already published")]
    DefinitionExists { workflow_id: String, version: u32 },

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("instance {instance_id} has no pending bookmark '{bookmark}'")]
    NoSuchBookmark { instance_id: Uuid, bookmark: String },

    #[error("cannot {operation} instance {instance_id} while it is {status}")]
    InvalidTransition {
        instance_id: Uuid,
        status: InstanceStatus,
        operation: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Save kept conflicting after the configured number of immediate retries
    #[error("instance {instance_id} could not be saved after {attempts} conflicting attempts")]
    SchedulingConflict { instance_id: Uuid, attempts: u32 },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    /// Taxonomy code for the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::DefinitionNotFound { .. } => "DefinitionNotFound",
            Self::DefinitionExists { .. } => "DefinitionExists",
            Self::InstanceNotFound(_) => "InstanceNotFound",
            Self::NoSuchBookmark { .. } => "NoSuchBookmark",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::SchedulingConflict { .. } => "ConcurrencyConflict",
            Self::Expression(e) => e.code(),
            Self::Registry(_) => "RegistryError",
            Self::Store(_) => "StoreError",
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SchedulingConflict { .. } | Self::Store(StoreError::Database(_))
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InstanceNotFound(id) => Self::InstanceNotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Errors resolving node types and activity executors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("node '{node_id}' uses activity type '{activity_type}' with no registered executor")]
    UnknownActivityType {
        node_id: String,
        activity_type: String,
    },

    #[error("node '{node_id}' has invalid config: {message}")]
    InvalidNodeConfig { node_id: String, message: String },

    #[error("node '{node_id}' has an invalid expression '{expression}': {message}")]
    InvalidExpression {
        node_id: String,
        expression: String,
        message: String,
    },

    #[error("node '{0}' is not part of the definition")]
    UnknownNode(String),

    #[error("definition has no start node")]
    MissingStartNode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_instance_not_found() {
        let id = Uuid::now_v7();
        let err: EngineError = StoreError::InstanceNotFound(id).into();
        assert!(matches!(err, EngineError::InstanceNotFound(found) if found == id));
    }

    #[test]
    fn test_error_codes() {
        let err = EngineError::NoSuchBookmark {
            instance_id: Uuid::now_v7(),
            bookmark: "approve".into(),
        };
        assert_eq!(err.code(), "NoSuchBookmark");

        let err: EngineError = ExpressionError::UnknownVariable("x".into()).into();
        assert_eq!(err.code(), "UnknownVariable");
    }

    #[test]
    fn test_transient_classification() {
        let conflict = EngineError::SchedulingConflict {
            instance_id: Uuid::now_v7(),
            attempts: 5,
        };
        assert!(conflict.is_transient());
        assert!(!EngineError::InvalidRequest("bad".into()).is_transient());
    }
}

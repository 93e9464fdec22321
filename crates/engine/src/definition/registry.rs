//! Definition registry
//!
//! Published definitions are validated, compiled against the executor
//! registry and kept as shared immutable [`CompiledWorkflow`]s keyed by
//! `(workflow_id, version)`. Instances pin the version they started on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::compiled::CompiledWorkflow;
use super::model::WorkflowDefinition;
use crate::activity::ExecutorRegistry;
use crate::error::EngineError;
use crate::persistence::{Page, Pagination};
use crate::validation::{validate, ValidationReport};

/// Listing entry for a published definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSummary {
    pub workflow_id: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub node_count: usize,
    pub is_latest: bool,
}

/// Registry of published workflow definitions
pub struct DefinitionRegistry {
    executors: ExecutorRegistry,
    definitions: RwLock<BTreeMap<(String, u32), Arc<CompiledWorkflow>>>,
}

impl DefinitionRegistry {
    pub fn new(executors: ExecutorRegistry) -> Self {
        Self {
            executors,
            definitions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Validate, compile and store `definition`
    ///
    /// Warnings are returned alongside the compiled workflow; any error
    /// finding rejects the definition.
    pub fn publish(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<(Arc<CompiledWorkflow>, ValidationReport), EngineError> {
        if definition.version == 0 {
            return Err(EngineError::InvalidRequest(
                "definition version must be greater than 0".to_string(),
            ));
        }

        let report = validate(&definition);
        if !report.is_valid() {
            warn!(
                workflow_id = %definition.workflow_id,
                version = definition.version,
                errors = report.errors().count(),
                "rejected invalid workflow definition"
            );
            return Err(EngineError::Validation(report));
        }

        let key = (definition.workflow_id.clone(), definition.version);
        if self.definitions.read().contains_key(&key) {
            return Err(EngineError::DefinitionExists {
                workflow_id: key.0,
                version: key.1,
            });
        }

        let compiled = Arc::new(CompiledWorkflow::compile(definition, &self.executors)?);

        let mut definitions = self.definitions.write();
        if definitions.contains_key(&key) {
            return Err(EngineError::DefinitionExists {
                workflow_id: key.0,
                version: key.1,
            });
        }
        definitions.insert(key, compiled.clone());

        info!(
            workflow_id = %compiled.workflow_id(),
            version = compiled.version(),
            warnings = report.warnings().count(),
            "published workflow definition"
        );
        Ok((compiled, report))
    }

    /// Exact version, or the latest when `version` is `None`
    pub fn get(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<Arc<CompiledWorkflow>, EngineError> {
        let found = match version {
            Some(v) => self
                .definitions
                .read()
                .get(&(workflow_id.to_string(), v))
                .cloned(),
            None => self.latest(workflow_id),
        };
        found.ok_or_else(|| EngineError::DefinitionNotFound {
            workflow_id: workflow_id.to_string(),
            version,
        })
    }

    pub fn latest(&self, workflow_id: &str) -> Option<Arc<CompiledWorkflow>> {
        self.definitions
            .read()
            .range((workflow_id.to_string(), 0)..=(workflow_id.to_string(), u32::MAX))
            .next_back()
            .map(|(_, compiled)| compiled.clone())
    }

    /// Published definitions ordered by id then version
    pub fn list(&self, workflow_id: Option<&str>, page: Pagination) -> Page<DefinitionSummary> {
        let definitions = self.definitions.read();
        let mut summaries: Vec<DefinitionSummary> = Vec::new();
        let mut iter = definitions
            .iter()
            .filter(|((id, _), _)| workflow_id.map_or(true, |w| w == id))
            .peekable();

        while let Some(((id, version), compiled)) = iter.next() {
            let is_latest = iter.peek().map_or(true, |((next, _), _)| next != id);
            summaries.push(DefinitionSummary {
                workflow_id: id.clone(),
                version: *version,
                name: compiled.definition().name.clone(),
                node_count: compiled.nodes().len(),
                is_latest,
            });
        }

        page.apply(summaries)
    }

    /// Latest versions that declare an event trigger for `event_name`
    pub fn find_event_triggered(&self, event_name: &str) -> Vec<Arc<CompiledWorkflow>> {
        let definitions = self.definitions.read();
        let mut latest: BTreeMap<&str, &Arc<CompiledWorkflow>> = BTreeMap::new();
        for ((id, _), compiled) in definitions.iter() {
            latest.insert(id.as_str(), compiled);
        }
        latest
            .into_values()
            .filter(|c| c.definition().is_triggered_by(event_name))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}

impl fmt::Debug for DefinitionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefinitionRegistry")
            .field("definitions", &self.definitions.read().keys().collect::<Vec<_>>())
            .field("executors", &self.executors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ExecutionResult;
    use crate::definition::{Edge, Node, Trigger};
    use crate::validation::ValidationCode;

    fn registry() -> DefinitionRegistry {
        let mut executors = ExecutorRegistry::new();
        executors.register_fn("work", |_| async { Ok(ExecutionResult::done()) });
        DefinitionRegistry::new(executors)
    }

    fn linear(id: &str, version: u32) -> WorkflowDefinition {
        WorkflowDefinition::new(id, version)
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "work"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"))
    }

    #[test]
    fn test_publish_and_get() {
        let registry = registry();
        let (compiled, report) = registry.publish(linear("intake", 1)).unwrap();
        assert!(report.is_valid());
        assert_eq!(compiled.version(), 1);

        assert_eq!(registry.get("intake", Some(1)).unwrap().version(), 1);
        assert!(matches!(
            registry.get("intake", Some(2)),
            Err(EngineError::DefinitionNotFound { .. })
        ));
    }

    #[test]
    fn test_published_version_is_immutable() {
        let registry = registry();
        registry.publish(linear("intake", 1)).unwrap();
        assert!(matches!(
            registry.publish(linear("intake", 1)),
            Err(EngineError::DefinitionExists { version: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_definition_rejected() {
        let registry = registry();
        let def = WorkflowDefinition::new("broken", 1).with_node(Node::end("end"));

        match registry.publish(def) {
            Err(EngineError::Validation(report)) => {
                assert!(report.has(ValidationCode::MissingStartNode));
            }
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_latest_version_resolution() {
        let registry = registry();
        registry.publish(linear("intake", 1)).unwrap();
        registry.publish(linear("intake", 3)).unwrap();
        registry.publish(linear("other", 7)).unwrap();

        assert_eq!(registry.get("intake", None).unwrap().version(), 3);
        assert!(registry.latest("missing").is_none());
    }

    #[test]
    fn test_list_marks_latest() {
        let registry = registry();
        registry.publish(linear("intake", 1)).unwrap();
        registry.publish(linear("intake", 2)).unwrap();
        registry.publish(linear("other", 1)).unwrap();

        let page = registry.list(None, Pagination::default());
        assert_eq!(page.total, 3);
        let latest: Vec<(String, u32, bool)> = page
            .items
            .iter()
            .map(|s| (s.workflow_id.clone(), s.version, s.is_latest))
            .collect();
        assert_eq!(
            latest,
            vec![
                ("intake".to_string(), 1, false),
                ("intake".to_string(), 2, true),
                ("other".to_string(), 1, true),
            ]
        );

        let filtered = registry.list(Some("other"), Pagination::default());
        assert_eq!(filtered.total, 1);
    }

    #[test]
    fn test_find_event_triggered_uses_latest_versions() {
        let registry = registry();
        registry
            .publish(linear("intake", 1).with_trigger(Trigger::Event {
                event_name: "patient.registered".into(),
            }))
            .unwrap();
        registry.publish(linear("intake", 2)).unwrap();
        registry
            .publish(linear("billing", 1).with_trigger(Trigger::Event {
                event_name: "patient.registered".into(),
            }))
            .unwrap();

        let triggered = registry.find_event_triggered("patient.registered");
        let ids: Vec<&str> = triggered.iter().map(|c| c.workflow_id()).collect();
        assert_eq!(ids, vec!["billing"]);
    }
}

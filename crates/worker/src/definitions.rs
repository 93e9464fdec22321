//! Loading published definitions from disk
//!
//! Every `*.json` file in the directory holds one [`WorkflowDefinition`].
//! Files are published in name order so a later version of the same
//! workflow can sit next to the earlier one.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clinicflow_engine::prelude::*;

pub fn parse(source: &str) -> Result<WorkflowDefinition> {
    serde_json::from_str(source).context("invalid workflow definition")
}

/// Publish every definition found in `dir`, returning how many were published
pub fn publish_dir(engine: &WorkflowEngine, dir: &Path) -> Result<usize> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in &paths {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let definition = parse(&source).with_context(|| path.display().to_string())?;
        let report = engine
            .publish_definition(definition)
            .with_context(|| format!("Failed to publish {}", path.display()))?;
        for warning in report.warnings() {
            tracing::warn!(file = %path.display(), "{}", warning);
        }
    }

    if paths.is_empty() {
        bail!("no definitions found in {}", dir.display());
    }
    Ok(paths.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camel_case_definition() {
        let definition = parse(
            r#"{
                "workflowId": "intake",
                "version": 2,
                "nodes": [
                    {"id": "start", "type": "start"},
                    {"id": "end", "type": "end"}
                ],
                "edges": [{"source": "start", "target": "end"}]
            }"#,
        )
        .unwrap();
        assert_eq!(definition.workflow_id, "intake");
        assert_eq!(definition.version, 2);
        assert_eq!(definition.nodes.len(), 2);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("{\"nodes\": 3}").is_err());
    }
}

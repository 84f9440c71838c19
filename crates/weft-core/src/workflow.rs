//! Workflow entities: the parsed DAG the scheduler expands into tasks.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

use crate::document::{CommandLineTool, Requirements};
use crate::id::ResourceId;

/// A stored workflow: immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: ResourceId,
    /// The packed CWL document as received; kept for provenance.
    pub content: Json,
    pub graph: WorkflowGraph,
}

/// The executable shape of a workflow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowGraph {
    pub inputs: Vec<String>,
    pub outputs: Vec<WorkflowOutput>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub id: String,
    /// `stepName/outName` this workflow output forwards.
    pub output_source: String,
}

/// One node of the DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub run: StepRun,
    /// Input name -> source. A source is either a workflow input name or
    /// `stepName/outName`.
    #[serde(default)]
    pub in_bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub out_names: Vec<String>,
    #[serde(default)]
    pub hints: Requirements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepRun {
    Tool(Box<CommandLineTool>),
    Workflow(Box<WorkflowGraph>),
}

/// Split a binding source into `(step, output)`; a source without a
/// slash names a workflow input. Step names may themselves contain
/// slashes once sub-workflows are flattened, so split on the last one.
pub fn split_source(source: &str) -> (Option<&str>, &str) {
    match source.rsplit_once('/') {
        Some((step, out)) => (Some(step), out),
        None => (None, source),
    }
}

impl Step {
    /// Names of the steps this step consumes outputs from.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self
            .in_bindings
            .values()
            .filter_map(|source| split_source(source).0)
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_splitting() {
        assert_eq!(split_source("message"), (None, "message"));
        assert_eq!(split_source("echo/out"), (Some("echo"), "out"));
        assert_eq!(split_source("sub/inner/out"), (Some("sub/inner"), "out"));
    }

    #[test]
    fn dependencies_are_deduplicated() {
        let step = Step {
            name: "count".into(),
            run: StepRun::Tool(Box::new(CommandLineTool::default())),
            in_bindings: BTreeMap::from([
                ("a".to_string(), "echo/out".to_string()),
                ("b".to_string(), "echo/err".to_string()),
                ("c".to_string(), "message".to_string()),
            ]),
            out_names: vec![],
            hints: Requirements::new(),
        };
        assert_eq!(step.dependencies(), vec!["echo"]);
    }
}

//! DAG planning: expand a workflow graph into an ordered task plan.
//!
//! Sub-workflow steps are flattened at planning time: their inner steps
//! join the plan under `outer/inner` names, and bindings that referenced
//! the sub-workflow's outputs are rewired to the producing inner step.

use std::collections::{BTreeMap, HashMap, HashSet};

use weft_core::document::CommandLineTool;
use weft_core::{
    split_source, CwlValue, Error, Result, StepRun, TaskHints, WorkflowGraph,
};

/// One plannable unit: a tool step with fully rewired bindings.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub step_name: String,
    pub tool: CommandLineTool,
    /// Input name -> source (workflow input or `step/out`).
    pub in_bindings: BTreeMap<String, String>,
    pub topo_index: i64,
    pub hints: TaskHints,
}

impl PlannedTask {
    pub fn dependencies(&self) -> HashSet<String> {
        self.in_bindings
            .values()
            .filter_map(|source| split_source(source).0.map(str::to_string))
            .collect()
    }
}

/// Expand `graph` into tool-level tasks in topological order.
pub fn plan_tasks(graph: &WorkflowGraph) -> Result<Vec<PlannedTask>> {
    let mut flat = Vec::new();
    let mut output_aliases = HashMap::new();
    flatten(graph, "", &BTreeMap::new(), &mut flat, &mut output_aliases)?;

    // Rewire any binding that still points at a sub-workflow output.
    let flat_len = flat.len();
    for planned in &mut flat {
        for source in planned.in_bindings.values_mut() {
            let mut hops = 0;
            while let Some(real) = output_aliases.get(source.as_str()) {
                *source = real.clone();
                hops += 1;
                if hops > flat_len {
                    return Err(Error::Validation(format!(
                        "output wiring loop at {source}"
                    )));
                }
            }
        }
    }

    topo_order(flat)
}

fn flatten(
    graph: &WorkflowGraph,
    prefix: &str,
    outer_bindings: &BTreeMap<String, String>,
    out: &mut Vec<PlannedTask>,
    output_aliases: &mut HashMap<String, String>,
) -> Result<()> {
    for step in &graph.steps {
        let name = if prefix.is_empty() {
            step.name.clone()
        } else {
            format!("{prefix}/{}", step.name)
        };

        // Rewrite this step's bindings into the outer namespace.
        let mut bindings = BTreeMap::new();
        for (input, source) in &step.in_bindings {
            let rewritten = match split_source(source) {
                // Inner step output: qualify with the prefix.
                (Some(_), _) if !prefix.is_empty() => format!("{prefix}/{source}"),
                (Some(_), _) => source.clone(),
                // Workflow input: inside a sub-workflow it maps through
                // the outer step's own bindings.
                (None, _) if prefix.is_empty() => source.clone(),
                (None, _) => outer_bindings.get(source).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "step {name} reads unbound sub-workflow input {source:?}"
                    ))
                })?,
            };
            bindings.insert(input.clone(), rewritten);
        }

        match &step.run {
            StepRun::Tool(tool) => {
                let hints = TaskHints::for_step(tool, &step.hints);
                out.push(PlannedTask {
                    step_name: name,
                    tool: (**tool).clone(),
                    in_bindings: bindings,
                    topo_index: 0,
                    hints,
                });
            }
            StepRun::Workflow(inner) => {
                for output in &inner.outputs {
                    output_aliases.insert(
                        format!("{name}/{}", output.id),
                        format!("{name}/{}", output.output_source),
                    );
                }
                flatten(inner, &name, &bindings, out, output_aliases)?;
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm; also validates acyclicity.
fn topo_order(tasks: Vec<PlannedTask>) -> Result<Vec<PlannedTask>> {
    let names: HashSet<String> = tasks.iter().map(|t| t.step_name.clone()).collect();
    let mut remaining: Vec<PlannedTask> = tasks;
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut placed: HashSet<String> = HashSet::new();

    while !remaining.is_empty() {
        let mut progressed = false;
        let mut still_blocked = Vec::new();
        for task in remaining {
            let unmet = task
                .dependencies()
                .into_iter()
                .any(|dep| names.contains(&dep) && !placed.contains(&dep));
            if unmet {
                still_blocked.push(task);
            } else {
                placed.insert(task.step_name.clone());
                ordered.push(task);
                progressed = true;
            }
        }
        if !progressed {
            let stuck: Vec<String> =
                still_blocked.iter().map(|t| t.step_name.clone()).collect();
            return Err(Error::Validation(format!(
                "workflow has a dependency cycle through {stuck:?}"
            )));
        }
        remaining = still_blocked;
    }

    for (index, task) in ordered.iter_mut().enumerate() {
        task.topo_index = index as i64;
    }
    Ok(ordered)
}

/// Resolve a ready task's inputs by substituting workflow inputs and
/// upstream outputs per its wiring.
pub fn bind_inputs(
    bindings: &BTreeMap<String, String>,
    submission_inputs: &BTreeMap<String, CwlValue>,
    upstream: &HashMap<String, BTreeMap<String, CwlValue>>,
) -> BTreeMap<String, CwlValue> {
    let mut inputs = BTreeMap::new();
    for (input, source) in bindings {
        let value = match split_source(source) {
            (Some(step), output) => upstream
                .get(step)
                .and_then(|outputs| outputs.get(output))
                .cloned()
                .unwrap_or(CwlValue::Null),
            (None, name) => submission_inputs.get(name).cloned().unwrap_or(CwlValue::Null),
        };
        inputs.insert(input.clone(), value);
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::document::Requirements;
    use weft_core::{Step, WorkflowOutput};

    fn tool() -> CommandLineTool {
        serde_json::from_value(json!({"baseCommand": "true"})).unwrap()
    }

    fn tool_step(name: &str, bindings: &[(&str, &str)]) -> Step {
        Step {
            name: name.to_string(),
            run: StepRun::Tool(Box::new(tool())),
            in_bindings: bindings
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            out_names: vec!["out".to_string()],
            hints: Requirements::new(),
        }
    }

    #[test]
    fn plan_orders_by_dependencies() {
        let graph = WorkflowGraph {
            inputs: vec!["message".to_string()],
            outputs: vec![],
            steps: vec![
                tool_step("count", &[("in_file", "echo/out")]),
                tool_step("echo", &[("message", "message")]),
            ],
        };
        let plan = plan_tasks(&graph).unwrap();
        assert_eq!(plan[0].step_name, "echo");
        assert_eq!(plan[1].step_name, "count");
        assert_eq!(plan[0].topo_index, 0);
        assert_eq!(plan[1].topo_index, 1);
    }

    #[test]
    fn cycles_are_rejected() {
        let graph = WorkflowGraph {
            inputs: vec![],
            outputs: vec![],
            steps: vec![
                tool_step("a", &[("x", "b/out")]),
                tool_step("b", &[("x", "a/out")]),
            ],
        };
        let err = plan_tasks(&graph).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn sub_workflows_flatten_with_qualified_names() {
        let inner = WorkflowGraph {
            inputs: vec!["seed".to_string()],
            outputs: vec![WorkflowOutput {
                id: "result".to_string(),
                output_source: "transform/out".to_string(),
            }],
            steps: vec![tool_step("transform", &[("value", "seed")])],
        };
        let graph = WorkflowGraph {
            inputs: vec!["start".to_string()],
            outputs: vec![],
            steps: vec![
                Step {
                    name: "sub".to_string(),
                    run: StepRun::Workflow(Box::new(inner)),
                    in_bindings: BTreeMap::from([("seed".to_string(), "start".to_string())]),
                    out_names: vec!["result".to_string()],
                    hints: Requirements::new(),
                },
                tool_step("consume", &[("in_file", "sub/result")]),
            ],
        };
        let plan = plan_tasks(&graph).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].step_name, "sub/transform");
        assert_eq!(plan[0].in_bindings["value"], "start");
        // The consumer is rewired to the inner producer.
        assert_eq!(plan[1].in_bindings["in_file"], "sub/transform/out");
    }

    #[test]
    fn bind_inputs_substitutes_upstream_outputs() {
        let bindings = BTreeMap::from([
            ("in_file".to_string(), "echo/out".to_string()),
            ("label".to_string(), "name".to_string()),
        ]);
        let submission_inputs =
            BTreeMap::from([("name".to_string(), CwlValue::String("run-1".into()))]);
        let upstream = HashMap::from([(
            "echo".to_string(),
            BTreeMap::from([("out".to_string(), CwlValue::String("payload".into()))]),
        )]);

        let inputs = bind_inputs(&bindings, &submission_inputs, &upstream);
        assert_eq!(inputs["in_file"], CwlValue::String("payload".into()));
        assert_eq!(inputs["label"], CwlValue::String("run-1".into()));
    }
}

//! Command-line construction from CWL input bindings.

use std::collections::BTreeMap;

use weft_core::document::{Argument, CommandLineTool};
use weft_core::{CwlValue, Error, Result};
use weft_staging::expr::{contains_expression, interpolate, EvalContext, Evaluator};

/// A fully resolved command line plus its redirections.
#[derive(Debug, Clone, Default)]
pub struct BuiltCommand {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// `ShellCommandRequirement`: argv joins into one `sh -c` string.
    pub use_shell: bool,
}

/// Binding sort key: (position, tie-break). Arguments tie-break on
/// their index, inputs on their id, matching the CWL binding rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum TieBreak {
    Index(i64),
    Id(String),
}

struct Bound {
    position: i64,
    tie: TieBreak,
    prefix: Option<String>,
    separate: bool,
    values: Vec<String>,
}

pub fn build_command(
    tool: &CommandLineTool,
    inputs: &BTreeMap<String, CwlValue>,
    evaluator: &dyn Evaluator,
) -> Result<BuiltCommand> {
    let ctx = EvalContext {
        inputs: inputs.clone(),
        ..Default::default()
    };

    let mut bound: Vec<Bound> = Vec::new();

    for (index, argument) in tool.arguments.iter().enumerate() {
        match argument {
            Argument::Literal(text) => bound.push(Bound {
                position: 0,
                tie: TieBreak::Index(index as i64),
                prefix: None,
                separate: true,
                values: vec![resolve_text(text, evaluator, &ctx)?],
            }),
            Argument::Binding(binding) => {
                let value = binding
                    .value_from
                    .as_deref()
                    .map(|text| resolve_text(text, evaluator, &ctx))
                    .transpose()?;
                bound.push(Bound {
                    position: binding.position.unwrap_or(0),
                    tie: TieBreak::Index(index as i64),
                    prefix: binding.prefix.clone(),
                    separate: binding.separate.unwrap_or(true),
                    values: value.into_iter().collect(),
                });
            }
        }
    }

    for input in &tool.inputs {
        let Some(binding) = &input.input_binding else {
            continue;
        };
        let value = inputs
            .get(&input.id)
            .cloned()
            .or_else(|| input.default.clone())
            .unwrap_or(CwlValue::Null);
        if value.is_null() {
            continue;
        }

        let values = if let Some(value_from) = &binding.value_from {
            let item_ctx = EvalContext {
                inputs: inputs.clone(),
                self_value: Some(value.clone()),
                ..Default::default()
            };
            vec![resolve_text(value_from, evaluator, &item_ctx)?]
        } else {
            match &value {
                CwlValue::Array(items) if items.is_empty() => continue,
                CwlValue::Array(items) => {
                    let rendered: Vec<String> =
                        items.iter().map(CwlValue::to_argument_string).collect();
                    match &binding.item_separator {
                        Some(sep) => vec![rendered.join(sep)],
                        None => rendered,
                    }
                }
                CwlValue::Bool(true) => vec![],
                CwlValue::Bool(false) => continue,
                single => vec![single.to_argument_string()],
            }
        };

        bound.push(Bound {
            position: binding.position.unwrap_or(0),
            tie: TieBreak::Id(input.id.clone()),
            prefix: binding.prefix.clone(),
            separate: binding.separate.unwrap_or(true),
            values,
        });
    }

    bound.sort_by(|a, b| (a.position, &a.tie).cmp(&(b.position, &b.tie)));

    let mut argv = tool.base_command.argv();
    if argv.is_empty() && bound.is_empty() {
        return Err(Error::Validation("tool has no command to run".into()));
    }
    for binding in bound {
        match (&binding.prefix, binding.separate) {
            (Some(prefix), true) => {
                argv.push(prefix.clone());
                argv.extend(binding.values);
            }
            (Some(prefix), false) => {
                if binding.values.is_empty() {
                    argv.push(prefix.clone());
                } else {
                    for value in binding.values {
                        argv.push(format!("{prefix}{value}"));
                    }
                }
            }
            (None, _) => argv.extend(binding.values),
        }
    }
    argv.retain(|a| !a.is_empty());

    Ok(BuiltCommand {
        argv,
        stdin: tool
            .stdin
            .as_deref()
            .map(|t| resolve_text(t, evaluator, &ctx))
            .transpose()?,
        stdout: tool
            .stdout
            .as_deref()
            .map(|t| resolve_text(t, evaluator, &ctx))
            .transpose()?,
        stderr: tool
            .stderr
            .as_deref()
            .map(|t| resolve_text(t, evaluator, &ctx))
            .transpose()?,
        use_shell: tool.requirements.shell_command() || tool.hints.shell_command(),
    })
}

fn resolve_text(text: &str, evaluator: &dyn Evaluator, ctx: &EvalContext) -> Result<String> {
    if contains_expression(text) {
        interpolate(text, evaluator, ctx)
    } else {
        Ok(text.to_string())
    }
}

/// Resolved stdout file name for output collection: the tool's explicit
/// `stdout` wins; a `type: stdout` output falls back to its glob, then
/// to a name derived from the output id.
pub fn stream_capture_name(tool: &CommandLineTool, stream: &str) -> Option<String> {
    let explicit = match stream {
        "stdout" => tool.stdout.clone(),
        "stderr" => tool.stderr.clone(),
        _ => None,
    };
    if explicit.is_some() {
        return explicit;
    }
    tool.outputs.iter().find(|o| o.is_stream(stream)).map(|o| {
        o.output_binding
            .as_ref()
            .and_then(|b| b.glob.clone())
            .unwrap_or_else(|| format!("{}.{stream}", o.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::FileValue;
    use weft_staging::expr::Evaluator;

    struct NoEval;
    impl Evaluator for NoEval {
        fn evaluate(&self, expr: &str, _ctx: &EvalContext) -> Result<CwlValue> {
            Err(Error::staging(format!("unexpected expression {expr}")))
        }
    }

    fn file_input(path: &str) -> CwlValue {
        CwlValue::File(Box::new(FileValue {
            path: Some(path.to_string()),
            ..Default::default()
        }))
    }

    #[test]
    fn positions_and_prefixes_order_arguments() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": ["grep"],
            "arguments": [{"position": 2, "valueFrom": "/data/corpus.txt"}],
            "inputs": [
                {"id": "pattern", "type": "string", "inputBinding": {"position": 1}},
                {"id": "count", "type": "boolean", "inputBinding": {"position": 0, "prefix": "-c"}},
            ],
        }))
        .unwrap();
        let inputs = BTreeMap::from([
            ("pattern".to_string(), CwlValue::String("hits".into())),
            ("count".to_string(), CwlValue::Bool(true)),
        ]);

        let built = build_command(&tool, &inputs, &NoEval).unwrap();
        assert_eq!(built.argv, vec!["grep", "-c", "hits", "/data/corpus.txt"]);
    }

    #[test]
    fn arrays_join_with_item_separator() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "tar",
            "inputs": [{
                "id": "files",
                "type": {"type": "array", "items": "string"},
                "inputBinding": {"position": 1, "itemSeparator": ","},
            }],
        }))
        .unwrap();
        let inputs = BTreeMap::from([(
            "files".to_string(),
            CwlValue::Array(vec![
                CwlValue::String("a".into()),
                CwlValue::String("b".into()),
            ]),
        )]);
        let built = build_command(&tool, &inputs, &NoEval).unwrap();
        assert_eq!(built.argv, vec!["tar", "a,b"]);
    }

    #[test]
    fn file_inputs_render_their_paths() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": ["wc", "-c"],
            "inputs": [{"id": "in_file", "type": "File", "inputBinding": {"position": 1}}],
            "stdout": "count.txt",
        }))
        .unwrap();
        let inputs = BTreeMap::from([("in_file".to_string(), file_input("/work/output.txt"))]);
        let built = build_command(&tool, &inputs, &NoEval).unwrap();
        assert_eq!(built.argv, vec!["wc", "-c", "/work/output.txt"]);
        assert_eq!(built.stdout.as_deref(), Some("count.txt"));
    }

    #[test]
    fn false_flags_and_missing_optionals_are_dropped() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "ls",
            "inputs": [
                {"id": "all", "type": "boolean", "inputBinding": {"prefix": "-a"}},
                {"id": "dir", "type": "string?", "inputBinding": {"position": 1}},
            ],
        }))
        .unwrap();
        let inputs = BTreeMap::from([("all".to_string(), CwlValue::Bool(false))]);
        let built = build_command(&tool, &inputs, &NoEval).unwrap();
        assert_eq!(built.argv, vec!["ls"]);
    }

    #[test]
    fn separate_false_glues_prefix_to_value() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "sort",
            "inputs": [{
                "id": "key",
                "type": "string",
                "inputBinding": {"prefix": "-k", "separate": false},
            }],
        }))
        .unwrap();
        let inputs = BTreeMap::from([("key".to_string(), CwlValue::String("2".into()))]);
        let built = build_command(&tool, &inputs, &NoEval).unwrap();
        assert_eq!(built.argv, vec!["sort", "-k2"]);
    }

    #[test]
    fn stream_capture_prefers_explicit_redirection() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "wc",
            "outputs": [{"id": "count", "type": "stdout"}],
            "stdout": "explicit.txt",
        }))
        .unwrap();
        assert_eq!(stream_capture_name(&tool, "stdout").as_deref(), Some("explicit.txt"));

        let bare: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "wc",
            "outputs": [{"id": "count", "type": "stdout"}],
        }))
        .unwrap();
        assert_eq!(stream_capture_name(&bare, "stdout").as_deref(), Some("count.stdout"));
    }
}

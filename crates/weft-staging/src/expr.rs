//! Expression shape handling.
//!
//! The evaluator itself is external; this module only detects where
//! expressions occur, splits interpolated strings into segments, and
//! applies the `\$(` / `\${` unescape rule.

use std::collections::BTreeMap;

use weft_core::{CwlValue, Error, Result};

/// Context handed to the opaque evaluator.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub inputs: BTreeMap<String, CwlValue>,
    pub self_value: Option<CwlValue>,
    pub runtime: BTreeMap<String, CwlValue>,
    pub expression_lib: Vec<String>,
}

/// Opaque CWL expression evaluation: `Evaluate(expr, ctx) -> value`.
/// `expr` is passed with its `$(...)` / `${...}` wrapper intact.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expr: &str, ctx: &EvalContext) -> Result<CwlValue>;
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Expression(String),
}

/// Split a string into literal text and `$(...)`/`${...}` expressions.
/// Backslash-escaped openers become literal text.
pub fn scan(input: &str) -> Vec<Segment> {
    let chars: Vec<char> = input.chars().collect();
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        // \$( or \${ escapes the opener.
        if chars[i] == '\\'
            && i + 2 < chars.len()
            && chars[i + 1] == '$'
            && (chars[i + 2] == '(' || chars[i + 2] == '{')
        {
            text.push('$');
            text.push(chars[i + 2]);
            i += 3;
            continue;
        }
        if chars[i] == '$' && i + 1 < chars.len() && (chars[i + 1] == '(' || chars[i + 1] == '{') {
            let open = chars[i + 1];
            let close = if open == '(' { ')' } else { '}' };
            let mut depth = 0usize;
            let mut end = None;
            for (j, &c) in chars.iter().enumerate().skip(i + 1) {
                if c == open {
                    depth += 1;
                } else if c == close {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(j);
                        break;
                    }
                }
            }
            if let Some(end) = end {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Expression(chars[i..=end].iter().collect()));
                i = end + 1;
                continue;
            }
            // Unterminated opener: treat the rest as text.
        }
        text.push(chars[i]);
        i += 1;
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    segments
}

/// When the whole (trimmed) string is exactly one expression, return it.
pub fn single_expression(input: &str) -> Option<String> {
    let trimmed = input.trim();
    match scan(trimmed).as_slice() {
        [Segment::Expression(expr)] => Some(expr.clone()),
        _ => None,
    }
}

pub fn contains_expression(input: &str) -> bool {
    scan(input)
        .iter()
        .any(|s| matches!(s, Segment::Expression(_)))
}

/// Evaluate every embedded expression and join the results. Structured
/// results are JSON-serialized with a trailing newline; scalars are
/// stringified bare.
pub fn interpolate(input: &str, evaluator: &dyn Evaluator, ctx: &EvalContext) -> Result<String> {
    let mut out = String::new();
    for segment in scan(input) {
        match segment {
            Segment::Text(t) => out.push_str(&t),
            Segment::Expression(expr) => {
                let value = evaluator.evaluate(&expr, ctx)?;
                out.push_str(&render(&value)?);
            }
        }
    }
    Ok(out)
}

fn render(value: &CwlValue) -> Result<String> {
    match value {
        CwlValue::Null => Ok("null".to_string()),
        CwlValue::Bool(b) => Ok(b.to_string()),
        CwlValue::Int(i) => Ok(i.to_string()),
        CwlValue::Float(f) => Ok(f.to_string()),
        CwlValue::String(s) => Ok(s.clone()),
        structured => {
            let json = serde_json::to_string(&structured.to_json())
                .map_err(|e| Error::staging(format!("serializing expression result: {e}")))?;
            Ok(format!("{json}\n"))
        }
    }
}

/// Evaluates CWL *parameter references*: dotted property access rooted
/// at `inputs`, `self`, or `runtime`, with `["key"]` / `[0]` indexing.
/// Anything beyond that (real `InlineJavascriptRequirement` code) needs
/// the external expression engine and is rejected here.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertyEvaluator;

impl Evaluator for PropertyEvaluator {
    fn evaluate(&self, expr: &str, ctx: &EvalContext) -> Result<CwlValue> {
        let inner = expr
            .strip_prefix("$(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| {
                Error::staging(format!(
                    "expression {expr:?} needs an external evaluator (InlineJavascriptRequirement)"
                ))
            })?;
        let mut parts = parse_reference(inner).ok_or_else(|| {
            Error::staging(format!(
                "expression {expr:?} is not a parameter reference"
            ))
        })?;

        let root = parts.remove(0);
        let mut current = match root.as_str() {
            "inputs" => CwlValue::Record(ctx.inputs.clone()),
            "self" => ctx.self_value.clone().unwrap_or(CwlValue::Null),
            "runtime" => CwlValue::Record(ctx.runtime.clone()),
            other => {
                return Err(Error::staging(format!(
                    "unknown reference root {other:?} in {expr:?}"
                )))
            }
        };

        for part in parts {
            current = access(&current, &part).ok_or_else(|| {
                Error::staging(format!("{expr:?}: no field {part:?}"))
            })?;
        }
        Ok(current)
    }
}

/// Split `inputs.reads["path"]` style references into segments; None
/// when the text is not a plain reference.
fn parse_reference(inner: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut rest = inner.trim();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix('[') {
            let end = after.find(']')?;
            let key = after[..end].trim().trim_matches(|c| c == '"' || c == '\'');
            parts.push(key.to_string());
            rest = &after[end + 1..];
            continue;
        }
        let end = rest
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(rest.len());
        let segment = &rest[..end];
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return None;
        }
        parts.push(segment.to_string());
        rest = &rest[end..];
    }
    if parts.is_empty() { None } else { Some(parts) }
}

fn access(value: &CwlValue, key: &str) -> Option<CwlValue> {
    match value {
        CwlValue::Record(fields) => fields.get(key).cloned(),
        CwlValue::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
        CwlValue::File(file) => match key {
            "path" => file.path.clone().map(CwlValue::String),
            "location" => file.location.clone().map(CwlValue::String),
            "basename" => file
                .effective_basename()
                .map(CwlValue::String),
            "nameroot" => file.effective_basename().map(|b| {
                CwlValue::String(match b.rsplit_once('.') {
                    Some((root, _)) => root.to_string(),
                    None => b,
                })
            }),
            "nameext" => file.effective_basename().map(|b| {
                CwlValue::String(match b.rsplit_once('.') {
                    Some((_, ext)) => format!(".{ext}"),
                    None => String::new(),
                })
            }),
            "size" => file.size.map(CwlValue::Int),
            "contents" => file.contents.clone().map(CwlValue::String),
            _ => None,
        },
        CwlValue::Directory(dir) => match key {
            "path" => dir.path.clone().map(CwlValue::String),
            "location" => dir.location.clone().map(CwlValue::String),
            "basename" => dir.effective_basename().map(CwlValue::String),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Evaluator for Upper {
        fn evaluate(&self, expr: &str, _ctx: &EvalContext) -> Result<CwlValue> {
            Ok(CwlValue::String(expr.to_uppercase()))
        }
    }

    #[test]
    fn scans_mixed_content() {
        let segments = scan("a $(x) b ${y} c");
        assert_eq!(
            segments,
            vec![
                Segment::Text("a ".into()),
                Segment::Expression("$(x)".into()),
                Segment::Text(" b ".into()),
                Segment::Expression("${y}".into()),
                Segment::Text(" c".into()),
            ]
        );
    }

    #[test]
    fn escaped_openers_are_literal() {
        let segments = scan(r"cost: \$(5)");
        assert_eq!(segments, vec![Segment::Text("cost: $(5)".into())]);
    }

    #[test]
    fn nested_parens_balance() {
        assert_eq!(
            single_expression("$(fn(a, b))").as_deref(),
            Some("$(fn(a, b))")
        );
    }

    #[test]
    fn partial_expression_is_not_single() {
        assert!(single_expression("prefix $(x)").is_none());
        assert!(single_expression("plain").is_none());
    }

    #[test]
    fn interpolation_replaces_expressions() {
        let out = interpolate("say $(hi)!", &Upper, &EvalContext::default()).unwrap();
        assert_eq!(out, "say $(HI)!");
    }

    #[test]
    fn property_evaluator_walks_file_fields() {
        use weft_core::FileValue;

        let ctx = EvalContext {
            inputs: BTreeMap::from([(
                "reads".to_string(),
                CwlValue::File(Box::new(FileValue {
                    path: Some("/data/sample.fastq.gz".into()),
                    ..Default::default()
                })),
            )]),
            ..Default::default()
        };
        let evaluator = PropertyEvaluator;
        assert_eq!(
            evaluator.evaluate("$(inputs.reads.path)", &ctx).unwrap(),
            CwlValue::String("/data/sample.fastq.gz".into())
        );
        assert_eq!(
            evaluator.evaluate("$(inputs.reads.nameext)", &ctx).unwrap(),
            CwlValue::String(".gz".into())
        );
        assert_eq!(
            evaluator.evaluate(r#"$(inputs["reads"].basename)"#, &ctx).unwrap(),
            CwlValue::String("sample.fastq.gz".into())
        );
    }

    #[test]
    fn property_evaluator_rejects_javascript() {
        let err = PropertyEvaluator
            .evaluate("${ return 1 + 1; }", &EvalContext::default())
            .unwrap_err();
        assert!(err.to_string().contains("external evaluator"));
        assert!(PropertyEvaluator
            .evaluate("$(1 + 1)", &EvalContext::default())
            .is_err());
    }

    #[test]
    fn structured_results_serialize_with_newline() {
        struct List;
        impl Evaluator for List {
            fn evaluate(&self, _e: &str, _c: &EvalContext) -> Result<CwlValue> {
                Ok(CwlValue::Array(vec![CwlValue::Int(1), CwlValue::Int(2)]))
            }
        }
        let out = interpolate("$(xs)", &List, &EvalContext::default()).unwrap();
        assert_eq!(out, "[1,2]\n");
    }
}

//! Output collection: glob matching, file metadata, preservation.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use weft_core::document::CommandLineTool;
use weft_core::{CwlValue, DirectoryValue, Error, FileValue, Result};
use weft_staging::expr::{contains_expression, interpolate, EvalContext, Evaluator};

use crate::command::stream_capture_name;

/// Largest file content inlined via `loadContents`.
const LOAD_CONTENTS_LIMIT: u64 = 64 * 1024;

/// Describe one on-disk file as a CWL File with size and sha1 checksum.
pub fn file_metadata(path: &Path) -> Result<FileValue> {
    let bytes = fs::read(path)
        .map_err(|e| Error::System(format!("reading output {}: {e}", path.display())))?;
    let path_str = path.to_string_lossy().into_owned();
    Ok(FileValue {
        location: Some(format!("file://{path_str}")),
        path: Some(path_str),
        basename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        size: Some(bytes.len() as i64),
        checksum: Some(format!("sha1${}", hex::encode(Sha1::digest(&bytes)))),
        ..Default::default()
    })
}

/// Collect the tool's declared outputs from `workdir` after a run.
pub fn collect_outputs(
    tool: &CommandLineTool,
    workdir: &Path,
    inputs: &BTreeMap<String, CwlValue>,
    evaluator: &dyn Evaluator,
) -> Result<BTreeMap<String, CwlValue>> {
    let ctx = EvalContext {
        inputs: inputs.clone(),
        ..Default::default()
    };
    let mut outputs = BTreeMap::new();

    for output in &tool.outputs {
        // stdout/stderr outputs read the captured stream file.
        let stream = ["stdout", "stderr"]
            .into_iter()
            .find(|s| output.is_stream(s));
        if let Some(stream) = stream {
            let name = stream_capture_name(tool, stream)
                .unwrap_or_else(|| format!("{}.{stream}", output.id));
            let capture = workdir.join(&name);
            if capture.exists() {
                outputs.insert(
                    output.id.clone(),
                    CwlValue::File(Box::new(file_metadata(&capture)?)),
                );
            }
            continue;
        }

        let Some(binding) = &output.output_binding else {
            continue;
        };
        let Some(glob_pattern) = &binding.glob else {
            continue;
        };
        let pattern = if contains_expression(glob_pattern) {
            interpolate(glob_pattern, evaluator, &ctx)?
        } else {
            glob_pattern.clone()
        };

        let mut matches = glob_under(workdir, &pattern)?;
        matches.sort();
        debug!(output = %output.id, pattern = %pattern, count = matches.len(), "globbed output");

        let mut values = Vec::new();
        for path in matches {
            if path.is_dir() {
                values.push(CwlValue::Directory(Box::new(directory_metadata(&path)?)));
            } else {
                let mut file = file_metadata(&path)?;
                if binding.load_contents.unwrap_or(false)
                    && file.size.unwrap_or(0) as u64 <= LOAD_CONTENTS_LIMIT
                {
                    file.contents = fs::read_to_string(&path).ok();
                }
                values.push(CwlValue::File(Box::new(file)));
            }
        }

        let wants_array = output.ty.as_ref().is_some_and(is_array_type);
        let value = if wants_array {
            CwlValue::Array(values)
        } else {
            match values.len() {
                0 => CwlValue::Null,
                1 => values.into_iter().next().unwrap_or(CwlValue::Null),
                _ => CwlValue::Array(values),
            }
        };
        if !value.is_null() {
            outputs.insert(output.id.clone(), value);
        }
    }
    Ok(outputs)
}

fn directory_metadata(path: &Path) -> Result<DirectoryValue> {
    let path_str = path.to_string_lossy().into_owned();
    Ok(DirectoryValue {
        location: Some(format!("file://{path_str}")),
        path: Some(path_str),
        basename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
        ..Default::default()
    })
}

fn glob_under(workdir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = workdir.join(pattern);
    let paths = glob::glob(&full.to_string_lossy())
        .map_err(|e| Error::Validation(format!("glob {pattern:?}: {e}")))?;
    let mut matches = Vec::new();
    for entry in paths {
        matches
            .push(entry.map_err(|e| Error::System(format!("globbing {pattern:?}: {e}")))?);
    }
    Ok(matches)
}

/// Copy collected output files out of the workdir so the workdir can be
/// deleted after success; rewrites each value's path to the preserved
/// location.
pub fn preserve_outputs(
    outputs: &mut BTreeMap<String, CwlValue>,
    preserve_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(preserve_dir)
        .map_err(|e| Error::System(format!("creating {}: {e}", preserve_dir.display())))?;
    for value in outputs.values_mut() {
        preserve_value(value, preserve_dir)?;
    }
    Ok(())
}

fn preserve_value(value: &mut CwlValue, dir: &Path) -> Result<()> {
    match value {
        CwlValue::File(file) => {
            if let Some(source) = file.source_path() {
                let basename = file
                    .effective_basename()
                    .unwrap_or_else(|| "output".to_string());
                let dest = dir.join(&basename);
                fs::copy(&source, &dest)
                    .map_err(|e| Error::System(format!("preserving {source}: {e}")))?;
                let dest_str = dest.to_string_lossy().into_owned();
                file.location = Some(format!("file://{dest_str}"));
                file.path = Some(dest_str);
            }
            Ok(())
        }
        CwlValue::Directory(directory) => {
            if let Some(source) = directory.source_path() {
                let basename = directory
                    .effective_basename()
                    .unwrap_or_else(|| "output".to_string());
                let dest = dir.join(&basename);
                copy_tree(Path::new(&source), &dest)?;
                let dest_str = dest.to_string_lossy().into_owned();
                directory.location = Some(format!("file://{dest_str}"));
                directory.path = Some(dest_str);
            }
            Ok(())
        }
        CwlValue::Array(items) => {
            for item in items {
                preserve_value(item, dir)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::System(format!("creating {}: {e}", dest.display())))?;
    for entry in fs::read_dir(source)
        .map_err(|e| Error::System(format!("reading {}: {e}", source.display())))?
    {
        let entry = entry.map_err(|e| Error::System(format!("reading dir entry: {e}")))?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|e| Error::System(format!("copying {}: {e}", entry.path().display())))?;
        }
    }
    Ok(())
}

/// Whether the untyped `type` field declares an array: either the
/// `{type: array, items: ...}` long form or the `File[]` shorthand.
fn is_array_type(ty: &serde_json::Value) -> bool {
    match ty {
        serde_json::Value::String(s) => s.ends_with("[]"),
        serde_json::Value::Object(map) => {
            map.get("type").and_then(serde_json::Value::as_str) == Some("array")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoEval;
    impl Evaluator for NoEval {
        fn evaluate(&self, expr: &str, _ctx: &EvalContext) -> Result<CwlValue> {
            Err(Error::staging(format!("unexpected expression {expr}")))
        }
    }

    #[test]
    fn metadata_reports_size_and_sha1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "hello\n").unwrap();

        let file = file_metadata(&path).unwrap();
        assert_eq!(file.size, Some(6));
        // sha1 of "hello\n"
        assert_eq!(
            file.checksum.as_deref(),
            Some("sha1$f572d396fae9206628714fb2ce00f72e94f2258f")
        );
    }

    #[test]
    fn glob_collects_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("skip.log"), "x").unwrap();

        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "true",
            "outputs": [{
                "id": "texts",
                "type": {"type": "array", "items": "File"},
                "outputBinding": {"glob": "*.txt"},
            }],
        }))
        .unwrap();

        let outputs = collect_outputs(&tool, dir.path(), &BTreeMap::new(), &NoEval).unwrap();
        match &outputs["texts"] {
            CwlValue::Array(files) => assert_eq!(files.len(), 2),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn single_match_yields_single_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("result.json"), "{}").unwrap();

        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "true",
            "outputs": [{
                "id": "result",
                "type": "File",
                "outputBinding": {"glob": "result.json"},
            }],
        }))
        .unwrap();
        let outputs = collect_outputs(&tool, dir.path(), &BTreeMap::new(), &NoEval).unwrap();
        assert!(outputs["result"].as_file().is_some());
    }

    #[test]
    fn stdout_output_reads_capture_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("count.txt"), "      6\n").unwrap();

        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "wc",
            "outputs": [{"id": "count", "type": "stdout"}],
            "stdout": "count.txt",
        }))
        .unwrap();
        let outputs = collect_outputs(&tool, dir.path(), &BTreeMap::new(), &NoEval).unwrap();
        let file = outputs["count"].as_file().unwrap();
        assert_eq!(file.basename.as_deref(), Some("count.txt"));
        assert_eq!(file.size, Some(8));
    }

    #[test]
    fn preserved_outputs_point_outside_the_workdir() {
        let workdir = tempfile::tempdir().unwrap();
        let keep = tempfile::tempdir().unwrap();
        let produced = workdir.path().join("out.bin");
        fs::write(&produced, "payload").unwrap();

        let mut outputs = BTreeMap::from([(
            "out".to_string(),
            CwlValue::File(Box::new(file_metadata(&produced).unwrap())),
        )]);
        preserve_outputs(&mut outputs, keep.path()).unwrap();

        let file = outputs["out"].as_file().unwrap();
        let new_path = file.path.as_deref().unwrap();
        assert!(new_path.starts_with(keep.path().to_str().unwrap()));
        assert_eq!(fs::read_to_string(new_path).unwrap(), "payload");
    }
}

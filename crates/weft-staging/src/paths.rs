//! Path resolution side effects around staging.

use std::collections::BTreeMap;
use std::path::Path;

use weft_core::{CwlValue, DirectoryValue, FileValue};

use crate::iwd::StageResult;

/// Rewrite relative `location`/`path` fields to be absolute relative to
/// `cwl_dir` (the directory of the CWL document). URIs are preserved
/// unchanged.
pub fn resolve_object_paths(value: &mut CwlValue, cwl_dir: &Path) {
    match value {
        CwlValue::File(file) => {
            resolve_file(file, cwl_dir);
            for secondary in &mut file.secondary_files {
                resolve_object_paths(secondary, cwl_dir);
            }
        }
        CwlValue::Directory(dir) => {
            resolve_dir(dir, cwl_dir);
            for item in &mut dir.listing {
                resolve_object_paths(item, cwl_dir);
            }
        }
        CwlValue::Array(items) => {
            for item in items {
                resolve_object_paths(item, cwl_dir);
            }
        }
        CwlValue::Record(fields) => {
            for item in fields.values_mut() {
                resolve_object_paths(item, cwl_dir);
            }
        }
        _ => {}
    }
}

fn is_uri(s: &str) -> bool {
    s.starts_with("file://") || s.starts_with("http:") || s.starts_with("https:")
}

fn resolve_one(field: &mut Option<String>, cwl_dir: &Path) {
    if let Some(current) = field {
        if is_uri(current) || Path::new(current.as_str()).is_absolute() {
            return;
        }
        *field = Some(cwl_dir.join(current.as_str()).to_string_lossy().into_owned());
    }
}

fn resolve_file(file: &mut FileValue, cwl_dir: &Path) {
    resolve_one(&mut file.path, cwl_dir);
    resolve_one(&mut file.location, cwl_dir);
}

fn resolve_dir(dir: &mut DirectoryValue, cwl_dir: &Path) {
    resolve_one(&mut dir.path, cwl_dir);
    resolve_one(&mut dir.location, cwl_dir);
}

/// Walk resolved inputs after staging and point File/Directory values
/// at their staged locations: entries renamed by staging rewrite via
/// `staged_paths`; otherwise a workdir file with the same basename wins.
pub fn update_input_paths(
    inputs: &mut BTreeMap<String, CwlValue>,
    workdir: &Path,
    staged: &StageResult,
) {
    for value in inputs.values_mut() {
        update_value(value, workdir, staged);
    }
}

fn update_value(value: &mut CwlValue, workdir: &Path, staged: &StageResult) {
    match value {
        CwlValue::File(file) => {
            if let Some(source) = file.source_path() {
                if let Some(new_path) = staged.staged_paths.get(&source) {
                    retarget_file(file, new_path);
                } else if let Some(basename) = file.effective_basename() {
                    let candidate = workdir.join(&basename);
                    if candidate.exists() {
                        retarget_file(file, &candidate.to_string_lossy());
                    }
                }
            }
            for secondary in &mut file.secondary_files {
                update_value(secondary, workdir, staged);
            }
        }
        CwlValue::Directory(dir) => {
            if let Some(source) = dir.source_path() {
                if let Some(new_path) = staged.staged_paths.get(&source) {
                    dir.path = Some(new_path.clone());
                    dir.location = Some(format!("file://{new_path}"));
                    dir.basename = Path::new(new_path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned());
                }
            }
            for item in &mut dir.listing {
                update_value(item, workdir, staged);
            }
        }
        CwlValue::Array(items) => {
            for item in items {
                update_value(item, workdir, staged);
            }
        }
        CwlValue::Record(fields) => {
            for item in fields.values_mut() {
                update_value(item, workdir, staged);
            }
        }
        _ => {}
    }
}

fn retarget_file(file: &mut FileValue, new_path: &str) {
    file.path = Some(new_path.to_string());
    file.location = Some(format!("file://{new_path}"));
    file.basename = Path::new(new_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn relative_paths_resolve_against_cwl_dir() {
        let mut value = CwlValue::File(Box::new(FileValue {
            location: Some("data/in.txt".into()),
            ..Default::default()
        }));
        resolve_object_paths(&mut value, Path::new("/workflows/demo"));
        assert_eq!(
            value.as_file().unwrap().location.as_deref(),
            Some("/workflows/demo/data/in.txt")
        );
    }

    #[test]
    fn uris_are_preserved() {
        let mut value = CwlValue::File(Box::new(FileValue {
            location: Some("https://example.org/in.txt".into()),
            ..Default::default()
        }));
        resolve_object_paths(&mut value, Path::new("/workflows/demo"));
        assert_eq!(
            value.as_file().unwrap().location.as_deref(),
            Some("https://example.org/in.txt")
        );
    }

    #[test]
    fn staged_rename_rewrites_inputs() {
        let workdir = tempfile::tempdir().unwrap();
        let staged_path = workdir.path().join("renamed.txt");
        fs::write(&staged_path, "x").unwrap();

        let mut staged = StageResult::default();
        staged.staged_paths.insert(
            "/data/orig.txt".to_string(),
            staged_path.to_string_lossy().into_owned(),
        );

        let mut inputs = BTreeMap::from([(
            "in_file".to_string(),
            CwlValue::File(Box::new(FileValue {
                path: Some("/data/orig.txt".into()),
                basename: Some("orig.txt".into()),
                ..Default::default()
            })),
        )]);
        update_input_paths(&mut inputs, workdir.path(), &staged);

        let file = inputs["in_file"].as_file().unwrap();
        assert_eq!(file.path.as_deref(), Some(staged_path.to_str().unwrap()));
        assert_eq!(file.basename.as_deref(), Some("renamed.txt"));
        assert!(file.location.as_deref().unwrap().starts_with("file://"));
    }

    #[test]
    fn basename_match_in_workdir_wins_for_unnamed_stages() {
        let workdir = tempfile::tempdir().unwrap();
        fs::write(workdir.path().join("in.txt"), "x").unwrap();

        let mut inputs = BTreeMap::from([(
            "in_file".to_string(),
            CwlValue::File(Box::new(FileValue {
                path: Some("/elsewhere/in.txt".into()),
                ..Default::default()
            })),
        )]);
        update_input_paths(&mut inputs, workdir.path(), &StageResult::default());

        let file = inputs["in_file"].as_file().unwrap();
        assert_eq!(
            file.path.as_deref(),
            Some(workdir.path().join("in.txt").to_str().unwrap())
        );
    }
}

//! The `InitialWorkDirRequirement` materializer.
//!
//! Resolves the requirement's listing (possibly itself an expression),
//! dispatches each item by shape (Dirent, File, Directory), and prepares
//! the task work directory with the copy/symlink semantics CWL demands.
//! Entries with absolute entrynames never land in the workdir; they are
//! emitted as [`ContainerMount`]s backed by files under a sibling
//! mounts directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value as Json};
use tracing::debug;

use weft_core::document::{CommandLineTool, DOCKER_REQUIREMENT};
use weft_core::{CwlValue, DirectoryValue, Error, FileValue, Result};

use crate::expr::{interpolate, single_expression, EvalContext, Evaluator};
use crate::paths::resolve_object_paths;

/// Options controlling one staging pass.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Copy files instead of symlinking and redirect absolute
    /// entrynames to container mounts.
    pub copy_for_container: bool,
    /// Directory of the CWL document; relative source paths resolve
    /// against it.
    pub cwl_dir: Option<PathBuf>,
    /// `InplaceUpdateRequirement`: writable entries stay symlinks so
    /// modifications reach the source.
    pub inplace_update: bool,
}

/// A bind mount produced for an absolute entryname.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub is_directory: bool,
}

/// The outcome of staging: mounts to pass to the container runtime and
/// the rename map used to rewrite input values afterwards.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub container_mounts: Vec<ContainerMount>,
    /// Original absolute source path -> staged path.
    pub staged_paths: BTreeMap<String, String>,
}

/// Stage the tool's initial work directory into `workdir`.
pub fn stage_initial_work_dir(
    tool: &CommandLineTool,
    inputs: &BTreeMap<String, CwlValue>,
    workdir: &Path,
    evaluator: &dyn Evaluator,
    opts: &StageOptions,
) -> Result<StageResult> {
    let mut result = StageResult::default();
    let Some(iwd) = tool
        .requirements
        .initial_work_dir()
        .or_else(|| tool.hints.initial_work_dir())
    else {
        return Ok(result);
    };

    fs::create_dir_all(workdir)
        .map_err(|e| Error::staging_io(format!("creating {}: {e}", workdir.display())))?;

    let ctx = EvalContext {
        inputs: inputs.clone(),
        self_value: None,
        runtime: BTreeMap::new(),
        expression_lib: tool
            .requirements
            .inline_javascript()
            .or_else(|| tool.hints.inline_javascript())
            .map(|r| r.expression_lib)
            .unwrap_or_default(),
    };

    let stager = Stager {
        workdir: workdir.to_path_buf(),
        evaluator,
        ctx,
        copy_for_container: opts.copy_for_container,
        inplace_update: opts.inplace_update || tool.requirements.inplace_update(),
        allow_absolute: tool.requirements.contains(DOCKER_REQUIREMENT),
        cwl_dir: opts.cwl_dir.clone(),
    };

    for item in stager.resolve_listing(iwd.listing)? {
        stager.stage_item(item, &mut result)?;
    }
    Ok(result)
}

/// Target of one staged entry after entryname validation.
#[derive(Debug, Clone, PartialEq)]
enum EntryTarget {
    Relative(PathBuf),
    Absolute(PathBuf),
}

struct Stager<'a> {
    workdir: PathBuf,
    evaluator: &'a dyn Evaluator,
    ctx: EvalContext,
    copy_for_container: bool,
    inplace_update: bool,
    allow_absolute: bool,
    cwl_dir: Option<PathBuf>,
}

impl Stager<'_> {
    /// The `listing` field may itself be an expression producing the
    /// listing; a string result that parses as a JSON array is
    /// unwrapped, a single object is wrapped, null is empty.
    fn resolve_listing(&self, listing: Json) -> Result<Vec<Json>> {
        match listing {
            Json::Null => Ok(vec![]),
            Json::Array(items) => Ok(items),
            Json::Object(obj) => Ok(vec![Json::Object(obj)]),
            Json::String(text) => {
                let Some(expr) = single_expression(&text) else {
                    return Err(Error::staging(format!(
                        "listing must be an array or expression, got string {text:?}"
                    )));
                };
                let value = self.evaluator.evaluate(&expr, &self.ctx)?;
                match value {
                    CwlValue::Null => Ok(vec![]),
                    CwlValue::Array(items) => {
                        Ok(items.into_iter().map(|v| v.to_json()).collect())
                    }
                    CwlValue::String(s) => match serde_json::from_str::<Json>(&s) {
                        Ok(Json::Array(items)) => Ok(items),
                        Ok(Json::Object(obj)) => Ok(vec![Json::Object(obj)]),
                        _ => Err(Error::staging(format!(
                            "listing expression produced a non-listing string: {s:?}"
                        ))),
                    },
                    single @ (CwlValue::File(_)
                    | CwlValue::Directory(_)
                    | CwlValue::Record(_)) => Ok(vec![single.to_json()]),
                    other => Err(Error::staging(format!(
                        "listing expression produced {other:?}"
                    ))),
                }
            }
            other => Err(Error::staging(format!("unsupported listing shape: {other}"))),
        }
    }

    fn stage_item(&self, item: Json, result: &mut StageResult) -> Result<()> {
        match item {
            Json::Object(obj) if obj.contains_key("entry") => self.stage_dirent(obj, result),
            Json::String(text) => {
                let Some(expr) = single_expression(&text) else {
                    return Err(Error::staging(format!(
                        "bare string listing item must be an expression: {text:?}"
                    )));
                };
                let value = self.evaluator.evaluate(&expr, &self.ctx)?;
                self.stage_value(value, None, false, &self.workdir, result)
            }
            other => match CwlValue::from_json(other) {
                CwlValue::Null => Ok(()),
                value @ (CwlValue::File(_) | CwlValue::Directory(_)) => {
                    self.stage_value(value, None, false, &self.workdir, result)
                }
                unsupported => Err(Error::staging(format!(
                    "unsupported listing item: {unsupported:?}"
                ))),
            },
        }
    }

    fn stage_dirent(&self, obj: Map<String, Json>, result: &mut StageResult) -> Result<()> {
        let writable = obj.get("writable").and_then(Json::as_bool).unwrap_or(false);
        let entryname = match obj.get("entryname").and_then(Json::as_str) {
            Some(raw) => Some(self.resolve_entryname(raw)?),
            None => None,
        };

        match obj.get("entry").cloned().unwrap_or(Json::Null) {
            Json::Null => Ok(()),
            Json::String(text) => {
                if let Some(expr) = single_expression(&text) {
                    let value = self.evaluator.evaluate(&expr, &self.ctx)?;
                    self.stage_value(value, entryname, writable, &self.workdir, result)
                } else {
                    let content = interpolate(&text, self.evaluator, &self.ctx)?;
                    let target = entryname.ok_or_else(|| {
                        Error::staging("Dirent with string entry requires an entryname")
                    })?;
                    self.write_entry(&target, content.as_bytes(), result)
                }
            }
            Json::Object(map) => {
                let value = CwlValue::from_json(Json::Object(map));
                self.stage_value(value, entryname, writable, &self.workdir, result)
            }
            other => Err(Error::staging(format!(
                "unsupported Dirent entry: {other}"
            ))),
        }
    }

    /// Stage an evaluated value. Files and directories recurse; arrays
    /// and records are JSON-serialized; scalars are stringified.
    fn stage_value(
        &self,
        value: CwlValue,
        entryname: Option<EntryTarget>,
        writable: bool,
        into: &Path,
        result: &mut StageResult,
    ) -> Result<()> {
        match value {
            CwlValue::Null => Ok(()),
            CwlValue::File(file) => self.stage_file(&file, entryname, writable, into, result),
            CwlValue::Directory(dir) => self.stage_directory(&dir, entryname, writable, into, result),
            structured @ (CwlValue::Array(_) | CwlValue::Record(_)) => {
                let target = entryname.ok_or_else(|| {
                    Error::staging("staging a serialized value requires an entryname")
                })?;
                let content = serde_json::to_string(&structured.to_json())
                    .map_err(|e| Error::staging(format!("serializing listing entry: {e}")))?;
                self.write_entry(&target, content.as_bytes(), result)
            }
            scalar => {
                let target = entryname.ok_or_else(|| {
                    Error::staging("staging a scalar value requires an entryname")
                })?;
                self.write_entry(&target, scalar.to_argument_string().as_bytes(), result)
            }
        }
    }

    fn stage_file(
        &self,
        file: &FileValue,
        entryname: Option<EntryTarget>,
        writable: bool,
        into: &Path,
        result: &mut StageResult,
    ) -> Result<()> {
        let mut file = file.clone();
        if let Some(cwl_dir) = &self.cwl_dir {
            resolve_object_paths_file(&mut file, cwl_dir);
        }

        // File literal: write the contents directly at the target.
        if file.contents.is_some() && file.source_path().is_none() {
            let contents = file.contents.clone().unwrap_or_default();
            let target = match entryname {
                Some(t) => t,
                None => EntryTarget::Relative(PathBuf::from(file.effective_basename().ok_or_else(
                    || Error::staging("file literal in listing needs a basename or entryname"),
                )?)),
            };
            self.write_entry_in(&target, contents.as_bytes(), into, result)?;
        } else {
            let source = file.source_path().ok_or_else(|| {
                Error::staging("File in listing has neither contents nor a source path")
            })?;
            let abs_source = self.absolutize(&source);

            match entryname {
                Some(EntryTarget::Absolute(container_path)) => {
                    // The file never enters the workdir; the container
                    // runtime binds the host source directly.
                    result.container_mounts.push(ContainerMount {
                        host_path: abs_source,
                        container_path,
                        is_directory: false,
                    });
                }
                other => {
                    let name = match other {
                        Some(EntryTarget::Relative(rel)) => rel,
                        _ => PathBuf::from(file.effective_basename().ok_or_else(|| {
                            Error::staging(format!("cannot derive a basename for {source}"))
                        })?),
                    };
                    let dest = into.join(&name);
                    self.place(&abs_source, &dest, writable)?;
                    result
                        .staged_paths
                        .insert(abs_source.to_string_lossy().into_owned(), dest.to_string_lossy().into_owned());
                }
            }
        }

        // Secondary files sit next to the primary under their own
        // basenames; the primary's rename does not touch them.
        for secondary in &file.secondary_files {
            match secondary {
                CwlValue::File(sf) => self.stage_file(sf, None, writable, into, result)?,
                CwlValue::Directory(sd) => {
                    self.stage_directory(sd, None, writable, into, result)?
                }
                CwlValue::Null => {}
                other => {
                    return Err(Error::staging(format!(
                        "unsupported secondaryFiles entry: {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn stage_directory(
        &self,
        dir: &DirectoryValue,
        entryname: Option<EntryTarget>,
        writable: bool,
        into: &Path,
        result: &mut StageResult,
    ) -> Result<()> {
        let mut dir = dir.clone();
        if let Some(cwl_dir) = &self.cwl_dir {
            resolve_object_paths_dir(&mut dir, cwl_dir);
        }

        // A Directory with a listing but no source is synthetic: create
        // it and stage its listing inside.
        if dir.source_path().is_none() {
            let host_dir = match &entryname {
                Some(EntryTarget::Absolute(container_path)) => {
                    let host = self.mount_source_for(container_path);
                    result.container_mounts.push(ContainerMount {
                        host_path: host.clone(),
                        container_path: container_path.clone(),
                        is_directory: true,
                    });
                    host
                }
                Some(EntryTarget::Relative(rel)) => into.join(rel),
                None => into.join(dir.effective_basename().ok_or_else(|| {
                    Error::staging("synthetic directory needs a basename or entryname")
                })?),
            };
            fs::create_dir_all(&host_dir)
                .map_err(|e| Error::staging_io(format!("creating {}: {e}", host_dir.display())))?;
            for item in dir.listing.clone() {
                self.stage_value(item, None, writable, &host_dir, result)?;
            }
            return Ok(());
        }

        let source = dir.source_path().unwrap_or_default();
        let abs_source = self.absolutize(&source);
        match entryname {
            Some(EntryTarget::Absolute(container_path)) => {
                result.container_mounts.push(ContainerMount {
                    host_path: abs_source,
                    container_path,
                    is_directory: true,
                });
            }
            other => {
                let name = match other {
                    Some(EntryTarget::Relative(rel)) => rel,
                    _ => PathBuf::from(dir.effective_basename().ok_or_else(|| {
                        Error::staging(format!("cannot derive a basename for {source}"))
                    })?),
                };
                let dest = into.join(&name);
                if self.should_copy(writable) {
                    copy_dir_recursive(&abs_source, &dest)?;
                } else {
                    symlink_any(&abs_source, &dest)?;
                }
                result
                    .staged_paths
                    .insert(abs_source.to_string_lossy().into_owned(), dest.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }

    /// Clean and validate an entryname, evaluating it first when it is
    /// an expression.
    fn resolve_entryname(&self, raw: &str) -> Result<EntryTarget> {
        let name = if let Some(expr) = single_expression(raw) {
            match self.evaluator.evaluate(&expr, &self.ctx)? {
                CwlValue::String(s) => s,
                other => {
                    return Err(Error::staging(format!(
                        "entryname expression must produce a string, got {other:?}"
                    )))
                }
            }
        } else {
            raw.to_string()
        };

        let path = Path::new(&name);
        let absolute = path.is_absolute();
        let mut cleaned = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    return Err(Error::staging(format!(
                        "entryname {name:?} must not contain '..'"
                    )))
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::Normal(part) => cleaned.push(part),
            }
        }
        if cleaned.as_os_str().is_empty() {
            return Err(Error::staging(format!("entryname {name:?} is empty")));
        }

        if absolute {
            if !self.allow_absolute {
                return Err(Error::staging(format!(
                    "absolute entryname {name:?} requires a DockerRequirement in requirements"
                )));
            }
            Ok(EntryTarget::Absolute(Path::new("/").join(cleaned)))
        } else {
            Ok(EntryTarget::Relative(cleaned))
        }
    }

    fn write_entry(
        &self,
        target: &EntryTarget,
        content: &[u8],
        result: &mut StageResult,
    ) -> Result<()> {
        self.write_entry_in(target, content, &self.workdir, result)
    }

    fn write_entry_in(
        &self,
        target: &EntryTarget,
        content: &[u8],
        into: &Path,
        result: &mut StageResult,
    ) -> Result<()> {
        let dest = match target {
            EntryTarget::Relative(rel) => into.join(rel),
            EntryTarget::Absolute(container_path) => {
                let host = self.mount_source_for(container_path);
                result.container_mounts.push(ContainerMount {
                    host_path: host.clone(),
                    container_path: container_path.clone(),
                    is_directory: false,
                });
                host
            }
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::staging_io(format!("creating {}: {e}", parent.display())))?;
        }
        debug!(dest = %dest.display(), "writing staged entry");
        fs::write(&dest, content)
            .map_err(|e| Error::staging_io(format!("writing {}: {e}", dest.display())))
    }

    /// Host-side backing file for an absolute entryname: lives in a
    /// sibling of the workdir so the workdir itself stays clean.
    fn mount_source_for(&self, container_path: &Path) -> PathBuf {
        let name = self
            .workdir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workdir".to_string());
        let base = self
            .workdir
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{name}.mounts"));
        let rel: PathBuf = container_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();
        base.join(rel)
    }

    fn should_copy(&self, writable: bool) -> bool {
        (writable && !self.inplace_update) || self.copy_for_container
    }

    fn place(&self, source: &Path, dest: &Path, writable: bool) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::staging_io(format!("creating {}: {e}", parent.display())))?;
        }
        if self.should_copy(writable) {
            fs::copy(source, dest).map_err(|e| {
                Error::staging_io(format!(
                    "copying {} to {}: {e}",
                    source.display(),
                    dest.display()
                ))
            })?;
            Ok(())
        } else {
            symlink_any(source, dest)
        }
    }

    fn absolutize(&self, source: &str) -> PathBuf {
        let path = Path::new(source);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.cwl_dir {
            Some(dir) => dir.join(path),
            None => std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf()),
        }
    }
}

fn resolve_object_paths_file(file: &mut FileValue, cwl_dir: &Path) {
    let mut value = CwlValue::File(Box::new(file.clone()));
    resolve_object_paths(&mut value, cwl_dir);
    if let CwlValue::File(resolved) = value {
        *file = *resolved;
    }
}

fn resolve_object_paths_dir(dir: &mut DirectoryValue, cwl_dir: &Path) {
    let mut value = CwlValue::Directory(Box::new(dir.clone()));
    resolve_object_paths(&mut value, cwl_dir);
    if let CwlValue::Directory(resolved) = value {
        *dir = *resolved;
    }
}

#[cfg(unix)]
fn symlink_any(source: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, dest).map_err(|e| {
        Error::staging_io(format!(
            "linking {} to {}: {e}",
            source.display(),
            dest.display()
        ))
    })
}

#[cfg(not(unix))]
fn symlink_any(source: &Path, dest: &Path) -> Result<()> {
    // Platforms without symlinks fall back to a copy.
    if source.is_dir() {
        copy_dir_recursive(source, dest)
    } else {
        fs::copy(source, dest)
            .map(|_| ())
            .map_err(|e| Error::staging_io(format!("copying {}: {e}", source.display())))
    }
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::staging_io(format!("creating {}: {e}", dest.display())))?;
    let entries = fs::read_dir(source)
        .map_err(|e| Error::staging_io(format!("reading {}: {e}", source.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::staging_io(format!("reading {}: {e}", source.display())))?;
        let target = dest.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::staging_io(format!("stat {}: {e}", entry.path().display())))?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::staging_io(format!("copying {}: {e}", entry.path().display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::EvalContext;
    use serde_json::json;
    use std::collections::HashMap;

    /// Table-driven fake for the external expression engine.
    #[derive(Default)]
    struct FakeEvaluator {
        answers: HashMap<String, CwlValue>,
    }

    impl FakeEvaluator {
        fn with(mut self, expr: &str, value: CwlValue) -> Self {
            self.answers.insert(expr.to_string(), value);
            self
        }
    }

    impl Evaluator for FakeEvaluator {
        fn evaluate(&self, expr: &str, _ctx: &EvalContext) -> Result<CwlValue> {
            self.answers
                .get(expr)
                .cloned()
                .ok_or_else(|| Error::staging(format!("no canned answer for {expr}")))
        }
    }

    fn tool_with_listing(listing: Json, docker: bool) -> CommandLineTool {
        let mut requirements = vec![json!({
            "class": "InitialWorkDirRequirement",
            "listing": listing,
        })];
        if docker {
            requirements.push(json!({"class": "DockerRequirement", "dockerPull": "alpine"}));
        }
        serde_json::from_value(json!({
            "baseCommand": "true",
            "requirements": requirements,
        }))
        .unwrap()
    }

    fn stage(
        tool: &CommandLineTool,
        workdir: &Path,
        evaluator: &dyn Evaluator,
        opts: &StageOptions,
    ) -> Result<StageResult> {
        stage_initial_work_dir(tool, &BTreeMap::new(), workdir, evaluator, opts)
    }

    #[test]
    fn writes_interpolated_content_under_entryname() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(
            json!([{"entry": "count=$(n)", "entryname": "conf/settings.ini"}]),
            false,
        );
        let evaluator = FakeEvaluator::default().with("$(n)", CwlValue::Int(3));

        stage(&tool, dir.path(), &evaluator, &StageOptions::default()).unwrap();
        let written = fs::read_to_string(dir.path().join("conf/settings.ini")).unwrap();
        assert_eq!(written, "count=3");
    }

    #[test]
    fn escaped_expression_markers_stay_literal() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(
            json!([{"entry": r"echo \$(HOME)", "entryname": "run.sh"}]),
            false,
        );
        stage(&tool, dir.path(), &FakeEvaluator::default(), &StageOptions::default()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("run.sh")).unwrap(),
            "echo $(HOME)"
        );
    }

    #[test]
    fn rejects_traversal_in_entryname() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(
            json!([{"entry": "x", "entryname": "../escape.txt"}]),
            false,
        );
        let err = stage(&tool, dir.path(), &FakeEvaluator::default(), &StageOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn absolute_entryname_needs_docker_requirement() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(
            json!([{"entry": "config content", "entryname": "/etc/myconfig.txt"}]),
            false,
        );
        let err = stage(&tool, dir.path(), &FakeEvaluator::default(), &StageOptions::default())
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("DockerRequirement in requirements"));
    }

    #[test]
    fn absolute_entryname_becomes_container_mount() {
        let base = tempfile::tempdir().unwrap();
        let workdir = base.path().join("task");
        let tool = tool_with_listing(
            json!([{"entry": "config content", "entryname": "/etc/myconfig.txt"}]),
            true,
        );
        let opts = StageOptions {
            copy_for_container: true,
            ..Default::default()
        };

        let result = stage(&tool, &workdir, &FakeEvaluator::default(), &opts).unwrap();
        assert_eq!(result.container_mounts.len(), 1);
        let mount = &result.container_mounts[0];
        assert_eq!(mount.container_path, Path::new("/etc/myconfig.txt"));
        assert!(!mount.is_directory);
        assert_eq!(
            fs::read_to_string(&mount.host_path).unwrap(),
            "config content"
        );
        assert!(!workdir.join("myconfig.txt").exists());
        assert!(!workdir.join("etc").exists());
    }

    #[test]
    fn files_symlink_by_default_and_copy_when_writable() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("input.txt");
        fs::write(&source, "payload").unwrap();

        let workdir = base.path().join("task");
        let tool = tool_with_listing(
            json!([
                {"entry": {"class": "File", "path": source.to_str().unwrap()}},
                {
                    "entry": {"class": "File", "path": source.to_str().unwrap()},
                    "entryname": "scratch.txt",
                    "writable": true,
                },
            ]),
            false,
        );

        stage(&tool, &workdir, &FakeEvaluator::default(), &StageOptions::default()).unwrap();

        let linked = workdir.join("input.txt");
        assert!(linked.symlink_metadata().unwrap().file_type().is_symlink());
        let copied = workdir.join("scratch.txt");
        assert!(!copied.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&copied).unwrap(), "payload");
    }

    #[test]
    fn writable_with_inplace_update_stays_a_symlink() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("db.sqlite");
        fs::write(&source, "v1").unwrap();

        let workdir = base.path().join("task");
        let tool = tool_with_listing(
            json!([{
                "entry": {"class": "File", "path": source.to_str().unwrap()},
                "writable": true,
            }]),
            false,
        );
        let opts = StageOptions {
            inplace_update: true,
            ..Default::default()
        };
        stage(&tool, &workdir, &FakeEvaluator::default(), &opts).unwrap();

        let staged = workdir.join("db.sqlite");
        assert!(staged.symlink_metadata().unwrap().file_type().is_symlink());
        fs::write(&staged, "v2").unwrap();
        assert_eq!(fs::read_to_string(&source).unwrap(), "v2");
    }

    #[test]
    fn entryname_rename_is_recorded_in_staged_paths() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("orig.bin");
        fs::write(&source, "x").unwrap();

        let workdir = base.path().join("task");
        let tool = tool_with_listing(
            json!([{
                "entry": {"class": "File", "path": source.to_str().unwrap()},
                "entryname": "renamed.bin",
            }]),
            false,
        );
        let result =
            stage(&tool, &workdir, &FakeEvaluator::default(), &StageOptions::default()).unwrap();
        let staged = result
            .staged_paths
            .get(source.to_str().unwrap())
            .expect("rename recorded");
        assert_eq!(Path::new(staged), workdir.join("renamed.bin"));
    }

    #[test]
    fn secondary_files_keep_their_own_basenames() {
        let base = tempfile::tempdir().unwrap();
        let primary = base.path().join("reads.bam");
        let index = base.path().join("reads.bam.bai");
        fs::write(&primary, "bam").unwrap();
        fs::write(&index, "bai").unwrap();

        let workdir = base.path().join("task");
        let tool = tool_with_listing(
            json!([{
                "entry": {
                    "class": "File",
                    "path": primary.to_str().unwrap(),
                    "secondaryFiles": [
                        {"class": "File", "path": index.to_str().unwrap()}
                    ],
                },
                "entryname": "aligned.bam",
            }]),
            false,
        );
        stage(&tool, &workdir, &FakeEvaluator::default(), &StageOptions::default()).unwrap();

        assert!(workdir.join("aligned.bam").exists());
        // The rename does not cascade to the secondary.
        assert!(workdir.join("reads.bam.bai").exists());
    }

    #[test]
    fn synthetic_directory_is_created_with_its_listing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(
            json!([{
                "class": "Directory",
                "basename": "workspace",
                "listing": [
                    {"class": "File", "basename": "seed.txt", "contents": "42\n"}
                ],
            }]),
            false,
        );
        stage(&tool, dir.path(), &FakeEvaluator::default(), &StageOptions::default()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("workspace/seed.txt")).unwrap(),
            "42\n"
        );
    }

    #[test]
    fn listing_expression_string_result_is_unwrapped() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(json!("$(self.files)"), false);
        let evaluator = FakeEvaluator::default().with(
            "$(self.files)",
            CwlValue::String(
                r#"[{"class": "File", "basename": "gen.txt", "contents": "generated"}]"#.into(),
            ),
        );
        stage(&tool, dir.path(), &evaluator, &StageOptions::default()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("gen.txt")).unwrap(),
            "generated"
        );
    }

    #[test]
    fn null_listing_expression_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(json!("$(nothing)"), false);
        let evaluator = FakeEvaluator::default().with("$(nothing)", CwlValue::Null);
        let result = stage(&tool, dir.path(), &evaluator, &StageOptions::default()).unwrap();
        assert!(result.container_mounts.is_empty());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn whole_expression_entry_stages_serialized_array() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_with_listing(
            json!([{"entry": "$(inputs.samples)", "entryname": "samples.json"}]),
            false,
        );
        let evaluator = FakeEvaluator::default().with(
            "$(inputs.samples)",
            CwlValue::Array(vec![CwlValue::String("a".into()), CwlValue::String("b".into())]),
        );
        stage(&tool, dir.path(), &evaluator, &StageOptions::default()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("samples.json")).unwrap(),
            r#"["a","b"]"#
        );
    }
}

//! File-literal materialization.
//!
//! CWL inputs may carry `File` objects with inline `contents` but no
//! `path`/`location`. Before a command can see them they must exist on
//! disk; this module writes them out and annotates the object.

use sha1::{Digest, Sha1};
use std::fs;
use std::path::{Path, PathBuf};

use weft_core::{CwlValue, Error, FileValue, Result};

/// Default literal directory, `<tmp>/cwl-literals`, resolved through
/// symlinks so container runtimes see the same absolute path the host
/// does (macOS mounts `/tmp` as a symlink).
pub fn literals_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join("cwl-literals");
    fs::create_dir_all(&dir)
        .map_err(|e| Error::staging_io(format!("creating {}: {e}", dir.display())))?;
    fs::canonicalize(&dir)
        .map_err(|e| Error::staging_io(format!("resolving {}: {e}", dir.display())))
}

/// Write a single file literal into `dir`. A no-op when the object
/// already has a `path` or `location`.
pub fn materialize_file_in(file: &mut FileValue, dir: &Path) -> Result<()> {
    if file.path.is_some() || file.location.is_some() {
        return Ok(());
    }
    let Some(contents) = file.contents.clone() else {
        return Ok(());
    };

    let basename = file
        .basename
        .clone()
        .unwrap_or_else(|| generated_basename(&contents));
    let target = dir.join(&basename);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::staging_io(format!("creating {}: {e}", parent.display())))?;
    }
    fs::write(&target, &contents)
        .map_err(|e| Error::staging_io(format!("writing {}: {e}", target.display())))?;

    let path = target.to_string_lossy().into_owned();
    file.location = Some(format!("file://{path}"));
    file.path = Some(path);
    file.basename = Some(basename);
    file.size = Some(contents.len() as i64);
    file.checksum = Some(format!("sha1${}", hex::encode(Sha1::digest(contents.as_bytes()))));
    Ok(())
}

/// Materialize one file literal into the default literal directory.
pub fn materialize_file(file: &mut FileValue) -> Result<()> {
    let dir = literals_dir()?;
    materialize_file_in(file, &dir)
}

/// Recursively materialize literals in a value tree, descending into
/// `listing` and `secondaryFiles`, into `dir`. Workers point this at
/// their own workdir so literals survive pod-local filesystems.
pub fn materialize_in_dir(value: &mut CwlValue, dir: &Path) -> Result<()> {
    match value {
        CwlValue::File(file) => {
            materialize_file_in(file, dir)?;
            for secondary in &mut file.secondary_files {
                materialize_in_dir(secondary, dir)?;
            }
        }
        CwlValue::Directory(directory) => {
            for item in &mut directory.listing {
                materialize_in_dir(item, dir)?;
            }
        }
        CwlValue::Array(items) => {
            for item in items {
                materialize_in_dir(item, dir)?;
            }
        }
        CwlValue::Record(fields) => {
            for item in fields.values_mut() {
                materialize_in_dir(item, dir)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Recursively materialize literals into the default directory.
pub fn materialize_recursive(value: &mut CwlValue) -> Result<()> {
    let dir = literals_dir()?;
    materialize_in_dir(value, &dir)
}

fn generated_basename(contents: &str) -> String {
    let digest = hex::encode(Sha1::digest(contents.as_bytes()));
    format!("literal-{}", &digest[..12])
}

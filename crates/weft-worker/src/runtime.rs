//! Execution runtimes for leased tasks.
//!
//! `none` runs the tool directly on the host; `docker` and `apptainer`
//! wrap the command so the task workdir is bound into the container at
//! the same path.

use std::path::Path;
use std::str::FromStr;

use weft_core::{Error, Result};
use weft_executor::BuiltCommand;
use weft_staging::ContainerMount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    None,
    Docker,
    Apptainer,
}

impl Runtime {
    pub fn is_container(&self) -> bool {
        !matches!(self, Runtime::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::None => "none",
            Runtime::Docker => "docker",
            Runtime::Apptainer => "apptainer",
        }
    }
}

impl FromStr for Runtime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Runtime::None),
            "docker" => Ok(Runtime::Docker),
            "apptainer" => Ok(Runtime::Apptainer),
            other => Err(Error::Validation(format!("unknown runtime {other:?}"))),
        }
    }
}

/// Wrap a built command for the configured runtime. The workdir is
/// mounted at its host path so staged input paths stay valid inside the
/// container; staging's [`ContainerMount`]s (absolute entrynames) each
/// become their own bind.
pub fn wrap(
    built: &BuiltCommand,
    runtime: Runtime,
    image: Option<&str>,
    workdir: &Path,
    mounts: &[ContainerMount],
) -> Result<BuiltCommand> {
    if runtime == Runtime::None {
        return Ok(built.clone());
    }
    let image = image.ok_or_else(|| {
        Error::Validation(format!(
            "{} runtime needs an image for this task",
            runtime.as_str()
        ))
    })?;
    let wd = workdir.to_string_lossy();

    let inner = if built.use_shell {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            built.argv.join(" "),
        ]
    } else {
        built.argv.clone()
    };

    let mut argv = match runtime {
        Runtime::Docker => {
            let mut args = vec![
                "docker".to_string(),
                "run".to_string(),
                "--rm".to_string(),
                "-i".to_string(),
                format!("--volume={wd}:{wd}"),
                format!("--workdir={wd}"),
            ];
            for mount in mounts {
                args.push(format!(
                    "--volume={}:{}",
                    mount.host_path.display(),
                    mount.container_path.display()
                ));
            }
            args.push(image.to_string());
            args
        }
        Runtime::Apptainer => {
            let reference = if image.ends_with(".sif") {
                image.to_string()
            } else {
                format!("docker://{image}")
            };
            let mut args = vec![
                "apptainer".to_string(),
                "exec".to_string(),
                "--bind".to_string(),
                wd.to_string(),
                "--pwd".to_string(),
                wd.to_string(),
            ];
            for mount in mounts {
                args.push("--bind".to_string());
                args.push(format!(
                    "{}:{}",
                    mount.host_path.display(),
                    mount.container_path.display()
                ));
            }
            args.push(reference);
            args
        }
        Runtime::None => unreachable!(),
    };
    argv.extend(inner);

    Ok(BuiltCommand {
        argv,
        stdin: built.stdin.clone(),
        stdout: built.stdout.clone(),
        stderr: built.stderr.clone(),
        use_shell: false,
    })
}

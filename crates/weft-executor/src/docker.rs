//! Docker executor.
//!
//! Stages the work directory with `copy_for_container`, translates
//! staged [`ContainerMount`]s and the workdir itself into bind mounts,
//! and runs the tool inside the image named by
//! `DockerRequirement.dockerPull`.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use weft_core::{
    CwlValue, DispatchMode, Error, ExecError, ExecErrorKind, Executor, Result, RunContext,
    RunOutcome, Task, TaskHints,
};
use weft_staging::expr::Evaluator;
use weft_staging::{
    materialize_in_dir, stage_initial_work_dir, update_input_paths, StageOptions,
};

use crate::command::{build_command, stream_capture_name};
use crate::outputs::{collect_outputs, preserve_outputs};

const DEFAULT_CONTAINER_WORKDIR: &str = "/weft/outdir";

pub struct DockerExecutor {
    docker: Docker,
    workdir_base: PathBuf,
    outputs_base: PathBuf,
    evaluator: Arc<dyn Evaluator>,
    cwl_dir: Option<PathBuf>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new(
        workdir_base: PathBuf,
        outputs_base: PathBuf,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::System(format!("docker: {e}")))?;
        Ok(Self {
            docker,
            workdir_base,
            outputs_base,
            evaluator,
            cwl_dir: None,
        })
    }

    pub fn with_client(
        docker: Docker,
        workdir_base: PathBuf,
        outputs_base: PathBuf,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            docker,
            workdir_base,
            outputs_base,
            evaluator,
            cwl_dir: None,
        }
    }

    pub fn with_cwl_dir(mut self, cwl_dir: PathBuf) -> Self {
        self.cwl_dir = Some(cwl_dir);
        self
    }

    fn container_name(task: &Task) -> String {
        format!("weft-task-{}", task.id)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => warn!(error = %e, "pull warning"),
            }
        }
        Ok(())
    }

    async fn capture_logs(&self, container: &str, workdir: &Path, stdout_name: &str, stderr_name: &str) {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stream = self.docker.logs(container, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    stdout.extend_from_slice(&message)
                }
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "log stream error");
                    break;
                }
            }
        }
        let _ = fs::write(workdir.join(stdout_name), stdout);
        let _ = fs::write(workdir.join(stderr_name), stderr);
    }

    async fn remove_container(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container, Some(options)).await {
            warn!(container = %container, error = %e, "could not remove container");
        }
    }
}

/// Rewrite workdir-host paths inside input values to their in-container
/// locations so the built command line refers to mounted paths.
fn map_to_container(value: &mut CwlValue, host: &str, container: &str) {
    match value {
        CwlValue::File(file) => {
            if let Some(path) = &file.path {
                if let Some(rest) = path.strip_prefix(host) {
                    file.path = Some(format!("{container}{rest}"));
                }
            }
            for secondary in &mut file.secondary_files {
                map_to_container(secondary, host, container);
            }
        }
        CwlValue::Directory(dir) => {
            if let Some(path) = &dir.path {
                if let Some(rest) = path.strip_prefix(host) {
                    dir.path = Some(format!("{container}{rest}"));
                }
            }
            for item in &mut dir.listing {
                map_to_container(item, host, container);
            }
        }
        CwlValue::Array(items) => {
            for item in items {
                map_to_container(item, host, container);
            }
        }
        CwlValue::Record(fields) => {
            for item in fields.values_mut() {
                map_to_container(item, host, container);
            }
        }
        _ => {}
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn supports(&self, hints: &TaskHints) -> bool {
        match hints.executor.as_deref() {
            Some(name) => name == "docker",
            None => hints.wants_container,
        }
    }

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Pooled
    }

    async fn run(&self, ctx: RunContext, task: &Task) -> Result<RunOutcome> {
        let image = task
            .hints
            .docker_image
            .clone()
            .ok_or_else(|| Error::Validation("container task has no image".into()))?;

        let workdir = self.workdir_base.join(format!("task-{}", task.id));
        fs::create_dir_all(&workdir)
            .map_err(|e| Error::System(format!("creating {}: {e}", workdir.display())))?;

        let mut inputs = task.inputs.clone();
        for value in inputs.values_mut() {
            materialize_in_dir(value, &workdir)?;
        }

        let stage_opts = StageOptions {
            copy_for_container: true,
            cwl_dir: self.cwl_dir.clone(),
            inplace_update: false,
        };
        let staged =
            stage_initial_work_dir(&task.tool, &inputs, &workdir, self.evaluator.as_ref(), &stage_opts)?;
        update_input_paths(&mut inputs, &workdir, &staged);

        let container_workdir = task
            .tool
            .docker_requirement()
            .and_then(|d| d.docker_output_directory)
            .unwrap_or_else(|| DEFAULT_CONTAINER_WORKDIR.to_string());
        let host_workdir = workdir.to_string_lossy().into_owned();
        for value in inputs.values_mut() {
            map_to_container(value, &host_workdir, &container_workdir);
        }

        let mut built = build_command(&task.tool, &inputs, self.evaluator.as_ref())?;
        if built.stdout.is_none() {
            built.stdout = stream_capture_name(&task.tool, "stdout");
        }
        if built.stderr.is_none() {
            built.stderr = stream_capture_name(&task.tool, "stderr");
        }

        let mut binds = vec![format!("{host_workdir}:{container_workdir}:rw")];
        for mount in &staged.container_mounts {
            let mode = "rw";
            binds.push(format!(
                "{}:{}:{mode}",
                mount.host_path.display(),
                mount.container_path.display()
            ));
        }

        let cmd = if built.use_shell {
            vec!["/bin/sh".to_string(), "-c".to_string(), built.argv.join(" ")]
        } else {
            built.argv.clone()
        };

        self.pull_image(&image).await?;

        let container_name = Self::container_name(task);
        let config = Config {
            image: Some(image.clone()),
            cmd: Some(cmd),
            env: Some(vec![
                format!("HOME={container_workdir}"),
                "TMPDIR=/tmp".to_string(),
            ]),
            working_dir: Some(container_workdir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(task_id = %task.id, container = %container_name, image = %image, "creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| ExecError::transport(format!("create container: {e}")))?;
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecError::transport(format!("start container: {e}")))?;

        let mut wait_stream = self.docker.wait_container(
            &container_name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let mut cancel = ctx.cancel.clone();
        let exit_code: i64 = tokio::select! {
            waited = wait_stream.next() => match waited {
                Some(Ok(response)) => response.status_code,
                // Docker reports non-zero exits as an error body with
                // the status code still attached.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    self.remove_container(&container_name).await;
                    return Err(ExecError::transport(format!("wait: {e}")).into());
                }
                None => {
                    self.remove_container(&container_name).await;
                    return Err(ExecError::transport("wait stream ended early").into());
                }
            },
            _ = wait_cancelled(&mut cancel) => {
                let _ = self.docker.stop_container(&container_name, None).await;
                self.remove_container(&container_name).await;
                return Err(ExecError::new(ExecErrorKind::Cancelled, "task cancelled").into());
            }
            _ = deadline(ctx.timeout) => {
                let _ = self.docker.stop_container(&container_name, None).await;
                self.remove_container(&container_name).await;
                return Err(ExecError::new(
                    ExecErrorKind::Timeout,
                    format!("exceeded {}s", ctx.timeout.unwrap_or_default().as_secs()),
                ).into());
            }
        };

        let stdout_name = built.stdout.clone().unwrap_or_else(|| "stdout.log".into());
        let stderr_name = built.stderr.clone().unwrap_or_else(|| "stderr.log".into());
        self.capture_logs(&container_name, &workdir, &stdout_name, &stderr_name)
            .await;
        self.remove_container(&container_name).await;

        if exit_code != 0 {
            return Err(ExecError::non_zero_exit(
                exit_code as i32,
                format!("container exited with code {exit_code}; logs in {}", workdir.display()),
            )
            .into());
        }

        let mut outputs: BTreeMap<String, CwlValue> =
            collect_outputs(&task.tool, &workdir, &inputs, self.evaluator.as_ref())?;
        let preserve_dir = self.outputs_base.join(task.id.to_string());
        preserve_outputs(&mut outputs, &preserve_dir)?;
        for log_name in [stdout_name.as_str(), stderr_name.as_str()] {
            let source = workdir.join(log_name);
            if source.exists() {
                let _ = fs::copy(&source, preserve_dir.join(log_name));
            }
        }
        if let Err(e) = fs::remove_dir_all(&workdir) {
            warn!(workdir = %workdir.display(), error = %e, "could not remove workdir");
        }

        Ok(RunOutcome {
            outputs,
            exit_code: exit_code as i32,
            logs_ref: Some(preserve_dir.to_string_lossy().into_owned()),
        })
    }
}

async fn wait_cancelled(cancel: &mut tokio::sync::watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn deadline(timeout: Option<std::time::Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_paths_are_rewritten() {
        let mut value = CwlValue::File(Box::new(weft_core::FileValue {
            path: Some("/scratch/task-1/in.txt".into()),
            ..Default::default()
        }));
        map_to_container(&mut value, "/scratch/task-1", "/weft/outdir");
        assert_eq!(
            value.as_file().unwrap().path.as_deref(),
            Some("/weft/outdir/in.txt")
        );
    }

    #[test]
    fn paths_outside_the_workdir_are_untouched() {
        let mut value = CwlValue::File(Box::new(weft_core::FileValue {
            path: Some("/data/shared.txt".into()),
            ..Default::default()
        }));
        map_to_container(&mut value, "/scratch/task-1", "/weft/outdir");
        assert_eq!(
            value.as_file().unwrap().path.as_deref(),
            Some("/data/shared.txt")
        );
    }
}

//! The worker agent loop.
//!
//! State machine: register -> lease (long-poll) -> execute -> report,
//! looping on lease. A heartbeat task renews the lease at a third of
//! its TTL while a task is executing.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use weft_core::{
    CwlValue, Error, Result, ResourceId, RunContext, Task, TaskError,
};
use weft_executor::command::{build_command, stream_capture_name};
use weft_executor::outputs::collect_outputs;
use weft_executor::run_process;
use weft_staging::{
    materialize_in_dir, stage_initial_work_dir, update_input_paths, PropertyEvaluator,
    StageOptions,
};

use crate::client::{ApiClient, RegisterRequest, ReportRequest};
use crate::runtime::{wrap, Runtime};
use crate::stager::Stager;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub hostname: String,
    pub runtime: Runtime,
    pub group: String,
    pub key: Option<String>,
    /// Long-poll window requested from the server.
    pub poll: Duration,
    /// Heartbeat cadence; leaseTTL/3 by convention.
    pub heartbeat: Duration,
    pub workdir_base: PathBuf,
    /// Per-task wall-clock limit; None runs unbounded.
    pub task_timeout: Option<Duration>,
}

pub struct Agent {
    client: Arc<ApiClient>,
    stager: Stager,
    config: AgentConfig,
    evaluator: PropertyEvaluator,
}

impl Agent {
    pub fn new(client: ApiClient, stager: Stager, config: AgentConfig) -> Self {
        Self {
            client: Arc::new(client),
            stager,
            config,
            evaluator: PropertyEvaluator,
        }
    }

    /// Register and process tasks until the process is killed. A
    /// rejected registration is fatal.
    pub async fn run(&self) -> Result<()> {
        let worker_id = self
            .client
            .register(&RegisterRequest {
                name: self.config.name.clone(),
                hostname: self.config.hostname.clone(),
                runtime: self.config.runtime.as_str().to_string(),
                group: self.config.group.clone(),
                key: self.config.key.clone(),
            })
            .await?;
        info!(worker_id = %worker_id, name = %self.config.name, "registered");

        let groups: Vec<String> = if self.config.group.is_empty() {
            vec![]
        } else {
            vec![self.config.group.clone()]
        };

        loop {
            match self.client.lease(worker_id, &groups, self.config.poll).await {
                Ok(Some(task)) => {
                    info!(task_id = %task.id, step = %task.step_name, "leased task");
                    self.execute(worker_id, task).await;
                }
                Ok(None) => {
                    // Long-poll window elapsed empty; re-poll at once.
                }
                Err(e) => {
                    warn!(error = %e, "lease failed");
                    tokio::time::sleep(self.config.poll).await;
                }
            }
        }
    }

    async fn execute(&self, worker_id: ResourceId, task: Task) {
        let workdir = self.config.workdir_base.join(format!("task-{}", task.id));

        // Renew the lease while the task runs.
        let heartbeat_client = self.client.clone();
        let heartbeat_every = self.config.heartbeat;
        let task_id = task.id;
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_every).await;
                match heartbeat_client.heartbeat(worker_id, task_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(task_id = %task_id, "lease no longer ours");
                        break;
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat failed"),
                }
            }
        });

        let result = self.run_task(&task, &workdir).await;
        heartbeat.abort();

        let report = match &result {
            Ok((outputs, exit_code, logs_ref)) => ReportRequest {
                task_id: task.id,
                outputs: outputs.clone(),
                exit_code: Some(*exit_code),
                logs_ref: logs_ref.clone(),
                error: None,
            },
            Err(e) => ReportRequest {
                task_id: task.id,
                outputs: BTreeMap::new(),
                exit_code: exit_code_of(e),
                logs_ref: Some(workdir.to_string_lossy().into_owned()),
                error: Some(TaskError {
                    kind: error_kind(e).to_string(),
                    message: e.to_string(),
                }),
            },
        };

        match self.client.report(worker_id, &report).await {
            Ok(()) => {
                info!(task_id = %task.id, ok = result.is_ok(), "reported");
                // The workdir is kept on failure for inspection.
                if result.is_ok() {
                    if let Err(e) = fs::remove_dir_all(&workdir) {
                        warn!(workdir = %workdir.display(), error = %e, "cleanup failed");
                    }
                }
            }
            Err(e) => error!(task_id = %task.id, error = %e, "report failed permanently"),
        }
    }

    async fn run_task(
        &self,
        task: &Task,
        workdir: &PathBuf,
    ) -> Result<(BTreeMap<String, CwlValue>, i32, Option<String>)> {
        fs::create_dir_all(workdir)
            .map_err(|e| Error::System(format!("creating {}: {e}", workdir.display())))?;

        let mut inputs = task.inputs.clone();
        // Literals land inside the task workdir so they survive
        // pod-local filesystems.
        for value in inputs.values_mut() {
            materialize_in_dir(value, workdir)?;
        }
        self.stager.stage_in(&mut inputs, workdir).await?;

        let stage_opts = StageOptions {
            copy_for_container: self.config.runtime.is_container(),
            cwl_dir: None,
            inplace_update: false,
        };
        let staged =
            stage_initial_work_dir(&task.tool, &inputs, workdir, &self.evaluator, &stage_opts)?;
        update_input_paths(&mut inputs, workdir, &staged);

        let mut built = build_command(&task.tool, &inputs, &self.evaluator)?;
        if built.stdout.is_none() {
            built.stdout = stream_capture_name(&task.tool, "stdout");
        }
        if built.stderr.is_none() {
            built.stderr = stream_capture_name(&task.tool, "stderr");
        }
        let wrapped = wrap(
            &built,
            self.config.runtime,
            task.hints.docker_image.as_deref(),
            workdir,
            &staged.container_mounts,
        )?;

        let ctx = RunContext::detached(self.config.task_timeout);
        let exit_code = run_process(&wrapped, workdir, &ctx.cancel, ctx.timeout).await?;
        if exit_code != 0 {
            return Err(weft_core::ExecError::non_zero_exit(
                exit_code,
                format!("command exited with code {exit_code}"),
            )
            .into());
        }

        let mut outputs = collect_outputs(&task.tool, workdir, &inputs, &self.evaluator)?;
        self.stager.stage_out(task.id, &mut outputs).await?;

        Ok((
            outputs,
            exit_code,
            Some(workdir.to_string_lossy().into_owned()),
        ))
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Staging { .. } => "staging",
        Error::Exec(e) => match e.kind {
            weft_core::ExecErrorKind::NonZeroExit => "non_zero_exit",
            weft_core::ExecErrorKind::Timeout => "timeout",
            weft_core::ExecErrorKind::Cancelled => "cancelled",
            weft_core::ExecErrorKind::Transport => "transport",
        },
        Error::Validation(_) => "validation",
        _ => "system",
    }
}

fn exit_code_of(err: &Error) -> Option<i32> {
    match err {
        Error::Exec(e) => e.exit_code,
        _ => None,
    }
}

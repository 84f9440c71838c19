//! Local process executor.
//!
//! Prepares a per-task work directory, stages the initial work
//! directory, builds the command line, and runs it as a child process
//! with captured stdout/stderr.

use async_trait::async_trait;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use weft_core::{
    DispatchMode, Error, ExecError, ExecErrorKind, Executor, Result, RunContext, RunOutcome,
    Task, TaskHints,
};
use weft_staging::expr::Evaluator;
use weft_staging::{
    materialize_in_dir, stage_initial_work_dir, update_input_paths, StageOptions,
};

use crate::command::{build_command, stream_capture_name, BuiltCommand};
use crate::outputs::{collect_outputs, preserve_outputs};

pub struct LocalExecutor {
    workdir_base: PathBuf,
    outputs_base: PathBuf,
    evaluator: Arc<dyn Evaluator>,
    cwl_dir: Option<PathBuf>,
}

impl LocalExecutor {
    pub fn new(workdir_base: PathBuf, outputs_base: PathBuf, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
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

    fn task_workdir(&self, task: &Task) -> PathBuf {
        self.workdir_base.join(format!("task-{}", task.id))
    }
}

/// Run `built` inside `workdir` with captured streams, honouring the
/// context's cancellation and timeout. Shared with the worker agent's
/// host runtime.
pub async fn run_process(
    built: &BuiltCommand,
    workdir: &Path,
    cancel: &watch::Receiver<bool>,
    timeout: Option<Duration>,
) -> Result<i32> {
    if built.argv.is_empty() {
        return Err(Error::Validation("empty command line".into()));
    }

    let stdout_name = built.stdout.clone().unwrap_or_else(|| "stdout.log".into());
    let stderr_name = built.stderr.clone().unwrap_or_else(|| "stderr.log".into());
    let stdout_file = File::create(workdir.join(&stdout_name))
        .map_err(|e| Error::System(format!("creating {stdout_name}: {e}")))?;
    let stderr_file = File::create(workdir.join(&stderr_name))
        .map_err(|e| Error::System(format!("creating {stderr_name}: {e}")))?;

    let mut command = if built.use_shell {
        let mut shell = Command::new("/bin/sh");
        shell.arg("-c").arg(built.argv.join(" "));
        shell
    } else {
        let mut direct = Command::new(&built.argv[0]);
        direct.args(&built.argv[1..]);
        direct
    };
    command
        .current_dir(workdir)
        .env("HOME", workdir)
        .env("TMPDIR", std::env::temp_dir())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .kill_on_drop(true);

    if let Some(stdin_name) = &built.stdin {
        let stdin_file = File::open(workdir.join(stdin_name))
            .map_err(|e| Error::System(format!("opening stdin {stdin_name}: {e}")))?;
        command.stdin(Stdio::from(stdin_file));
    } else {
        command.stdin(Stdio::null());
    }

    debug!(argv = ?built.argv, workdir = %workdir.display(), "spawning child");
    let mut child = command
        .spawn()
        .map_err(|e| ExecError::new(ExecErrorKind::Transport, format!("spawn failed: {e}")))?;

    let mut cancel = cancel.clone();
    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| Error::System(format!("waiting on child: {e}")))?
        }
        _ = cancel_signalled(&mut cancel) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ExecError::new(ExecErrorKind::Cancelled, "task cancelled").into());
        }
        _ = sleep_until_deadline(timeout) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(ExecError::new(
                ExecErrorKind::Timeout,
                format!("exceeded {}s", timeout.unwrap_or_default().as_secs()),
            )
            .into());
        }
    };
    Ok(status.code().unwrap_or(-1))
}

async fn cancel_signalled(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone: cancellation can never fire.
        std::future::pending::<()>().await;
    }
}

async fn sleep_until_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports(&self, hints: &TaskHints) -> bool {
        match hints.executor.as_deref() {
            Some(name) => name == "local",
            None => !hints.wants_container,
        }
    }

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Pooled
    }

    async fn run(&self, ctx: RunContext, task: &Task) -> Result<RunOutcome> {
        let workdir = self.task_workdir(task);
        fs::create_dir_all(&workdir)
            .map_err(|e| Error::System(format!("creating {}: {e}", workdir.display())))?;

        let mut inputs = task.inputs.clone();
        for value in inputs.values_mut() {
            materialize_in_dir(value, &workdir)?;
        }

        let stage_opts = StageOptions {
            copy_for_container: false,
            cwl_dir: self.cwl_dir.clone(),
            inplace_update: false,
        };
        let staged =
            stage_initial_work_dir(&task.tool, &inputs, &workdir, self.evaluator.as_ref(), &stage_opts)?;
        update_input_paths(&mut inputs, &workdir, &staged);

        let mut built = build_command(&task.tool, &inputs, self.evaluator.as_ref())?;
        if built.stdout.is_none() {
            built.stdout = stream_capture_name(&task.tool, "stdout");
        }
        if built.stderr.is_none() {
            built.stderr = stream_capture_name(&task.tool, "stderr");
        }

        info!(task_id = %task.id, step = %task.step_name, argv = ?built.argv, "running locally");
        let exit_code = run_process(&built, &workdir, &ctx.cancel, ctx.timeout).await?;
        if exit_code != 0 {
            warn!(task_id = %task.id, exit_code, "child exited non-zero");
            return Err(ExecError::non_zero_exit(
                exit_code,
                format!("command exited with code {exit_code}; logs in {}", workdir.display()),
            )
            .into());
        }

        let mut outputs = collect_outputs(&task.tool, &workdir, &inputs, self.evaluator.as_ref())?;

        // Outputs move out of the workdir so it can be reclaimed; logs
        // ride along for later retrieval.
        let preserve_dir = self.outputs_base.join(task.id.to_string());
        preserve_outputs(&mut outputs, &preserve_dir)?;
        for log_name in ["stdout.log", "stderr.log"] {
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
            exit_code,
            logs_ref: Some(preserve_dir.to_string_lossy().into_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use serde_json::json;
    use weft_core::document::CommandLineTool;
    use weft_core::{CwlValue, TaskHints};
    use weft_staging::expr::EvalContext;

    struct NoEval;
    impl Evaluator for NoEval {
        fn evaluate(&self, expr: &str, _ctx: &EvalContext) -> Result<CwlValue> {
            Err(Error::staging(format!("unexpected expression {expr}")))
        }
    }

    fn executor(base: &Path) -> LocalExecutor {
        LocalExecutor::new(
            base.join("work"),
            base.join("outputs"),
            Arc::new(NoEval),
        )
    }

    fn echo_task(message: &str) -> Task {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "echo",
            "inputs": [{"id": "message", "type": "string", "inputBinding": {"position": 1}}],
            "outputs": [{
                "id": "out",
                "type": "File",
                "outputBinding": {"glob": "output.txt"},
            }],
            "stdout": "output.txt",
        }))
        .unwrap();
        let mut task = Task::new(
            weft_core::ResourceId::new(),
            "echo",
            tool,
            0,
            TaskHints::default(),
        );
        task.inputs = BTreeMap::from([(
            "message".to_string(),
            CwlValue::String(message.to_string()),
        )]);
        task
    }

    #[tokio::test]
    async fn echo_produces_collected_stdout_file() {
        let base = tempfile::tempdir().unwrap();
        let exec = executor(base.path());
        let task = echo_task("hello");

        let outcome = exec.run(RunContext::detached(None), &task).await.unwrap();
        assert_eq!(outcome.exit_code, 0);

        let out = outcome.outputs["out"].as_file().unwrap();
        let content = fs::read_to_string(out.path.as_deref().unwrap()).unwrap();
        assert_eq!(content, "hello\n");
        assert_eq!(out.size, Some(6));
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_exec_error() {
        let base = tempfile::tempdir().unwrap();
        let exec = executor(base.path());
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": ["sh", "-c", "exit 3"],
        }))
        .unwrap();
        let task = Task::new(weft_core::ResourceId::new(), "fail", tool, 0, TaskHints::default());

        let err = exec.run(RunContext::detached(None), &task).await.unwrap_err();
        match err {
            Error::Exec(e) => {
                assert_eq!(e.kind, ExecErrorKind::NonZeroExit);
                assert_eq!(e.exit_code, Some(3));
            }
            other => panic!("expected exec error, got {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let base = tempfile::tempdir().unwrap();
        let exec = executor(base.path());
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": ["sleep", "30"],
        }))
        .unwrap();
        let task = Task::new(weft_core::ResourceId::new(), "slow", tool, 0, TaskHints::default());

        let ctx = RunContext::detached(Some(Duration::from_millis(100)));
        let err = exec.run(ctx, &task).await.unwrap_err();
        match err {
            Error::Exec(e) => assert_eq!(e.kind, ExecErrorKind::Timeout),
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_child() {
        let base = tempfile::tempdir().unwrap();
        let exec = executor(base.path());
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": ["sleep", "30"],
        }))
        .unwrap();
        let task = Task::new(weft_core::ResourceId::new(), "victim", tool, 0, TaskHints::default());

        let (tx, rx) = watch::channel(false);
        let ctx = RunContext::new(rx, None);
        let handle = tokio::spawn(async move { exec.run(ctx, &task).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        match err {
            Error::Exec(e) => assert_eq!(e.kind, ExecErrorKind::Cancelled),
            other => panic!("expected cancelled, got {other}"),
        }
    }
}

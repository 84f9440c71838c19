//! Distributed worker executor.
//!
//! Tasks selecting this executor are not run in-process: external
//! worker agents claim them over HTTP. Dispatch therefore does nothing
//! (`DispatchMode::External`); `run` exists for callers that want to
//! block until an agent reports completion, and watches the store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use weft_core::{
    DispatchMode, ExecError, ExecErrorKind, Executor, Result, RunContext, RunOutcome, Store,
    Task, TaskHints, TaskState,
};

pub const WORKER_EXECUTOR_NAME: &str = "worker";

pub struct WorkerExecutor {
    store: Arc<dyn Store>,
    poll_interval: Duration,
}

impl WorkerExecutor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl Executor for WorkerExecutor {
    fn name(&self) -> &'static str {
        WORKER_EXECUTOR_NAME
    }

    fn supports(&self, hints: &TaskHints) -> bool {
        hints.executor.as_deref() == Some(WORKER_EXECUTOR_NAME) || hints.worker_group.is_some()
    }

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::External
    }

    async fn run(&self, ctx: RunContext, task: &Task) -> Result<RunOutcome> {
        let mut cancel = ctx.cancel.clone();
        loop {
            let current = self.store.get_task(task.id).await?;
            match current.state {
                TaskState::Succeeded => {
                    return Ok(RunOutcome {
                        outputs: current.outputs,
                        exit_code: current.exit_code.unwrap_or(0),
                        logs_ref: current.logs_ref,
                    });
                }
                TaskState::Failed => {
                    let message = current
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "worker reported failure".to_string());
                    let mut err = ExecError::new(ExecErrorKind::NonZeroExit, message);
                    err.exit_code = current.exit_code;
                    return Err(err.into());
                }
                TaskState::Cancelled => {
                    return Err(
                        ExecError::new(ExecErrorKind::Cancelled, "task cancelled").into()
                    );
                }
                _ => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = watch_cancel(&mut cancel) => {
                    return Err(
                        ExecError::new(ExecErrorKind::Cancelled, "wait cancelled").into()
                    );
                }
            }
        }
    }
}

async fn watch_cancel(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use weft_core::document::CommandLineTool;
    use weft_core::{CwlValue, ResourceId, TaskCompletion};
    use weft_store::MemoryStore;

    #[tokio::test]
    async fn run_returns_once_an_agent_reports() {
        let store = Arc::new(MemoryStore::new());
        let mut task = Task::new(
            ResourceId::new(),
            "remote",
            CommandLineTool::default(),
            0,
            TaskHints {
                executor: Some("worker".to_string()),
                ..Default::default()
            },
        );
        task.state = TaskState::Claimed;
        store.create_task(&task).await.unwrap();

        let executor = WorkerExecutor::new(store.clone())
            .with_poll_interval(Duration::from_millis(10));

        let report_store = store.clone();
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            report_store
                .complete_task(
                    task_id,
                    &TaskCompletion {
                        outputs: BTreeMap::from([(
                            "out".to_string(),
                            CwlValue::String("done".into()),
                        )]),
                        exit_code: Some(0),
                        logs_ref: None,
                        error: None,
                    },
                )
                .await
                .unwrap();
        });

        let outcome = executor
            .run(RunContext::detached(None), &task)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.outputs["out"], CwlValue::String("done".into()));
    }
}

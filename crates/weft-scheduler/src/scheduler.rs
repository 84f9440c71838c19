//! The tick-based scheduler.
//!
//! A single cooperative loop advances submissions and tasks through
//! their state machines: reap leases, admit submissions, propagate
//! dependencies, dispatch ready tasks, collect outcomes, finalise
//! submissions. Per-task failures are recorded against the task and
//! never abort a tick.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use weft_core::{
    DispatchMode, Error, Executor, Result, ResourceId, RunContext, RunOutcome, Store,
    Submission, SubmissionError, SubmissionState, Task, TaskCompletion, TaskError, TaskState,
    TaskUpdate,
};
use weft_executor::ExecutorRegistry;

use crate::dag::{bind_inputs, plan_tasks};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Attempts per task before it fails for good.
    pub max_attempts: u32,
    /// First retry backoff; doubles per attempt up to `max_backoff`.
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on concurrently running local dispatches.
    pub max_parallel: usize,
    /// Default wall-clock limit per executor call.
    pub task_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            max_parallel: 4,
            task_timeout: None,
        }
    }
}

/// Outcome of one dispatched run, reported back to the collect phase.
struct TaskOutcome {
    task_id: ResourceId,
    result: Result<RunOutcome>,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<ExecutorRegistry>,
    config: SchedulerConfig,
    wake: Arc<Notify>,
    slots: Arc<Semaphore>,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<TaskOutcome>,
    /// Cancellation senders for in-flight local runs.
    running: HashMap<ResourceId, watch::Sender<bool>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ExecutorRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_parallel));
        Self {
            store,
            registry,
            config,
            wake: Arc::new(Notify::new()),
            slots,
            outcome_tx,
            outcome_rx,
            running: HashMap::new(),
        }
    }

    /// Handle API handlers use to shorten submission-to-dispatch latency.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Drive ticks until `shutdown` flips. Panics inside the loop are
    /// deliberate crashes; an orchestrator restarts the process.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.config.tick_interval, "scheduler started");
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed");
            }
        }
        info!("scheduler stopped");
    }

    /// One full pass over the six phases. Public so embedders and tests
    /// can single-step the engine.
    pub async fn tick(&mut self) -> Result<()> {
        self.reap_leases().await?;
        self.admit_submissions().await?;
        self.apply_cancellations().await?;
        self.propagate_dependencies().await?;
        self.dispatch_ready().await?;
        self.collect_outcomes().await?;
        self.finalize_submissions().await?;
        Ok(())
    }

    /// Phase 1: expired leases go back to ready (or fail once attempts
    /// run out).
    async fn reap_leases(&mut self) -> Result<()> {
        for task in self.store.reap_expired_leases(Utc::now()).await? {
            warn!(task_id = %task.id, owner = ?task.lease_owner, "lease expired");
            if task.attempt >= self.config.max_attempts {
                let completion = TaskCompletion {
                    outputs: BTreeMap::new(),
                    exit_code: None,
                    logs_ref: None,
                    error: Some(TaskError {
                        kind: "lease_lost".to_string(),
                        message: format!("lease lost after attempt {}", task.attempt),
                    }),
                };
                let _ = self.store.complete_task(task.id, &completion).await?;
            } else {
                let update = TaskUpdate {
                    attempt: Some(task.attempt + 1),
                    clear_lease: true,
                    ..Default::default()
                };
                let _ = self
                    .store
                    .update_task_state(task.id, task.state, TaskState::Ready, update)
                    .await?;
            }
        }
        Ok(())
    }

    /// Phase 2: expand pending submissions into tasks and mark source
    /// tasks ready.
    async fn admit_submissions(&mut self) -> Result<()> {
        for submission in self
            .store
            .list_submissions(Some(SubmissionState::Pending))
            .await?
        {
            if let Err(e) = self.admit_one(&submission).await {
                warn!(submission_id = %submission.id, error = %e, "admission failed");
                let _ = self
                    .store
                    .update_submission_state(
                        submission.id,
                        SubmissionState::Pending,
                        SubmissionState::Failed,
                        Some(SubmissionError {
                            task_id: submission.id,
                            step_name: String::new(),
                            kind: "validation".to_string(),
                            message: e.to_string(),
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn admit_one(&mut self, submission: &Submission) -> Result<()> {
        let workflow = self.store.get_workflow(submission.workflow_id).await?;
        let plan = plan_tasks(&workflow.graph)?;

        // A previous crash may have left tasks behind; admission is
        // idempotent per submission.
        let existing = self
            .store
            .list_tasks_by_submission(submission.id)
            .await?;
        if existing.is_empty() {
            for planned in &plan {
                let mut hints = planned.hints.clone();
                let executor = self.registry.select(&hints).ok_or_else(|| {
                    Error::Validation(format!(
                        "no executor admits step {:?} (hints {:?})",
                        planned.step_name, hints
                    ))
                })?;
                hints.executor = Some(executor.name().to_string());
                let task = Task::new(
                    submission.id,
                    planned.step_name.clone(),
                    planned.tool.clone(),
                    planned.topo_index,
                    hints,
                );
                self.store.create_task(&task).await?;
            }
        }

        let moved = self
            .store
            .update_submission_state(
                submission.id,
                SubmissionState::Pending,
                SubmissionState::Running,
                None,
            )
            .await?;
        if moved {
            info!(submission_id = %submission.id, tasks = plan.len(), "submission admitted");
        }
        Ok(())
    }

    /// Phase 2b: cancelled submissions drag their non-terminal tasks
    /// along and signal in-flight runs.
    async fn apply_cancellations(&mut self) -> Result<()> {
        for submission in self
            .store
            .list_submissions(Some(SubmissionState::Cancelled))
            .await?
        {
            let tasks = self.store.list_tasks_by_submission(submission.id).await?;
            for task in tasks.iter().filter(|t| !t.state.is_terminal()) {
                if let Some(sender) = self.running.remove(&task.id) {
                    let _ = sender.send(true);
                }
                let _ = self
                    .store
                    .update_task_state(task.id, task.state, TaskState::Cancelled, TaskUpdate::none())
                    .await?;
            }
        }
        Ok(())
    }

    /// Phase 3: pending tasks whose dependencies all succeeded become
    /// ready with bound inputs; tasks downstream of terminal failures
    /// are cancelled.
    async fn propagate_dependencies(&mut self) -> Result<()> {
        for submission in self
            .store
            .list_submissions(Some(SubmissionState::Running))
            .await?
        {
            let workflow = self.store.get_workflow(submission.workflow_id).await?;
            let plan = match plan_tasks(&workflow.graph) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(submission_id = %submission.id, error = %e, "plan failed");
                    continue;
                }
            };
            let bindings: HashMap<&str, &BTreeMap<String, String>> = plan
                .iter()
                .map(|p| (p.step_name.as_str(), &p.in_bindings))
                .collect();

            let tasks = self.store.list_tasks_by_submission(submission.id).await?;
            let mut states = HashMap::new();
            let mut upstream: HashMap<String, BTreeMap<String, weft_core::CwlValue>> =
                HashMap::new();
            for task in &tasks {
                states.insert(task.step_name.clone(), task.state);
                if task.state == TaskState::Succeeded {
                    upstream.insert(task.step_name.clone(), task.outputs.clone());
                }
            }

            for task in tasks.iter().filter(|t| t.state == TaskState::Pending) {
                let Some(task_bindings) = bindings.get(task.step_name.as_str()) else {
                    continue;
                };
                let deps: Vec<&str> = task_bindings
                    .values()
                    .filter_map(|s| weft_core::split_source(s).0)
                    .collect();

                let failed_dep = deps.iter().any(|d| {
                    matches!(
                        states.get(*d),
                        Some(TaskState::Failed) | Some(TaskState::Cancelled)
                    )
                });
                if failed_dep {
                    let _ = self
                        .store
                        .update_task_state(
                            task.id,
                            TaskState::Pending,
                            TaskState::Cancelled,
                            TaskUpdate::none(),
                        )
                        .await?;
                    continue;
                }

                let all_done = deps
                    .iter()
                    .all(|d| states.get(*d) == Some(&TaskState::Succeeded));
                if all_done {
                    let inputs = bind_inputs(task_bindings, &submission.inputs, &upstream);
                    let update = TaskUpdate {
                        inputs: Some(inputs),
                        ..Default::default()
                    };
                    let _ = self
                        .store
                        .update_task_state(task.id, TaskState::Pending, TaskState::Ready, update)
                        .await?;
                    debug!(task_id = %task.id, step = %task.step_name, "dependencies satisfied");
                }
            }
        }
        Ok(())
    }

    /// Phase 4: hand ready tasks to pooled executors. Tasks for the
    /// distributed worker executor stay put; agents claim them.
    async fn dispatch_ready(&mut self) -> Result<()> {
        let now = Utc::now();
        for submission in self
            .store
            .list_submissions(Some(SubmissionState::Running))
            .await?
        {
            let tasks = self.store.list_tasks_by_submission(submission.id).await?;
            for task in tasks
                .into_iter()
                .filter(|t| t.state == TaskState::Ready && !t.held_back(now))
            {
                let Some(executor_name) = task.hints.executor.clone() else {
                    continue;
                };
                let Some(executor) = self.registry.get(&executor_name) else {
                    warn!(task_id = %task.id, executor = %executor_name, "executor vanished");
                    continue;
                };
                if executor.dispatch_mode() == DispatchMode::External {
                    continue;
                }
                let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                    return Ok(()); // Pool exhausted; later ticks continue.
                };

                let moved = self
                    .store
                    .update_task_state(
                        task.id,
                        TaskState::Ready,
                        TaskState::Running,
                        TaskUpdate::none(),
                    )
                    .await?;
                if !moved {
                    drop(permit);
                    continue;
                }

                let (cancel_tx, cancel_rx) = watch::channel(false);
                self.running.insert(task.id, cancel_tx);
                let ctx = RunContext::new(cancel_rx, self.config.task_timeout);
                let outcome_tx = self.outcome_tx.clone();
                let wake = self.wake.clone();
                info!(task_id = %task.id, step = %task.step_name, executor = %executor_name, "dispatching");
                tokio::spawn(run_dispatched(executor, ctx, task, outcome_tx, wake, permit));
            }
        }
        Ok(())
    }

    /// Phase 5: apply completed runs, consulting the retry policy on
    /// failure.
    async fn collect_outcomes(&mut self) -> Result<()> {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.running.remove(&outcome.task_id);
            let task = match self.store.get_task(outcome.task_id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %outcome.task_id, error = %e, "collected unknown task");
                    continue;
                }
            };

            match outcome.result {
                Ok(run) => {
                    let completion = TaskCompletion {
                        outputs: run.outputs,
                        exit_code: Some(run.exit_code),
                        logs_ref: run.logs_ref,
                        error: None,
                    };
                    let _ = self.store.complete_task(task.id, &completion).await?;
                    info!(task_id = %task.id, step = %task.step_name, "task succeeded");
                }
                Err(err) => {
                    self.record_failure(&task, err).await?;
                }
            }
        }
        Ok(())
    }

    async fn record_failure(&mut self, task: &Task, err: Error) -> Result<()> {
        let retryable = err.is_retryable();
        warn!(task_id = %task.id, step = %task.step_name, error = %err, retryable, attempt = task.attempt, "task failed");

        if retryable && task.attempt < self.config.max_attempts {
            let backoff = self.backoff_for(task.attempt);
            let update = TaskUpdate {
                attempt: Some(task.attempt + 1),
                not_before: Some(Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default()),
                error: Some(task_error(&err)),
                clear_lease: true,
                ..Default::default()
            };
            let requeued = self
                .store
                .update_task_state(task.id, TaskState::Running, TaskState::Ready, update)
                .await?;
            if requeued {
                info!(task_id = %task.id, backoff = ?backoff, next_attempt = task.attempt + 1, "retry queued");
                return Ok(());
            }
            // The task moved elsewhere (e.g. cancelled) in the meantime.
            return Ok(());
        }

        let completion = TaskCompletion {
            outputs: BTreeMap::new(),
            exit_code: exit_code_of(&err),
            logs_ref: None,
            error: Some(task_error(&err)),
        };
        let _ = self.store.complete_task(task.id, &completion).await?;
        Ok(())
    }

    /// Phase 6: submissions with only terminal tasks reach their own
    /// terminal state; the first failure (topological order) is surfaced.
    async fn finalize_submissions(&mut self) -> Result<()> {
        for submission in self
            .store
            .list_submissions(Some(SubmissionState::Running))
            .await?
        {
            let tasks = self.store.list_tasks_by_submission(submission.id).await?;
            if tasks.iter().any(|t| !t.state.is_terminal()) {
                continue;
            }

            if tasks.iter().all(|t| t.state == TaskState::Succeeded) {
                let _ = self
                    .store
                    .update_submission_state(
                        submission.id,
                        SubmissionState::Running,
                        SubmissionState::Succeeded,
                        None,
                    )
                    .await?;
                info!(submission_id = %submission.id, "submission succeeded");
            } else if let Some(first_failed) = tasks
                .iter()
                .filter(|t| t.state == TaskState::Failed)
                .min_by_key(|t| t.topo_index)
            {
                let error = SubmissionError {
                    task_id: first_failed.id,
                    step_name: first_failed.step_name.clone(),
                    kind: first_failed
                        .error
                        .as_ref()
                        .map(|e| e.kind.clone())
                        .unwrap_or_else(|| "exec".to_string()),
                    message: first_failed
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "task failed".to_string()),
                };
                let _ = self
                    .store
                    .update_submission_state(
                        submission.id,
                        SubmissionState::Running,
                        SubmissionState::Failed,
                        Some(error),
                    )
                    .await?;
                warn!(submission_id = %submission.id, step = %first_failed.step_name, "submission failed");
            } else {
                // Only cancellations remain.
                let _ = self
                    .store
                    .update_submission_state(
                        submission.id,
                        SubmissionState::Running,
                        SubmissionState::Cancelled,
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config
            .retry_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }
}

async fn run_dispatched(
    executor: Arc<dyn Executor>,
    ctx: RunContext,
    task: Task,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    wake: Arc<Notify>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    let result = executor.run(ctx, &task).await;
    let _ = outcome_tx.send(TaskOutcome {
        task_id: task.id,
        result,
    });
    wake.notify_one();
}

fn task_error(err: &Error) -> TaskError {
    let kind = match err {
        Error::Validation(_) => "validation",
        Error::Staging { .. } => "staging",
        Error::Exec(e) => match e.kind {
            weft_core::ExecErrorKind::NonZeroExit => "non_zero_exit",
            weft_core::ExecErrorKind::Timeout => "timeout",
            weft_core::ExecErrorKind::Cancelled => "cancelled",
            weft_core::ExecErrorKind::Transport => "transport",
        },
        Error::LeaseLost => "lease_lost",
        Error::Rpc(_) => "rpc",
        _ => "system",
    };
    TaskError {
        kind: kind.to_string(),
        message: err.to_string(),
    }
}

fn exit_code_of(err: &Error) -> Option<i32> {
    match err {
        Error::Exec(e) => e.exit_code,
        _ => None,
    }
}

//! Executor trait: run a task, return outputs and exit status.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::hints::TaskHints;
use crate::task::Task;
use crate::value::CwlValue;

/// Per-run context handed to executors. Cancellation flows through the
/// watch channel; executors forward it (SIGTERM to children, abort for
/// HTTP calls).
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: watch::Receiver<bool>,
    /// Wall-clock limit for this run; expiry is a non-retryable
    /// `ExecError{Timeout}`.
    pub timeout: Option<Duration>,
    /// Keeps the sender of a detached context alive so the receiver
    /// never observes a closed channel; dropped with the context.
    cancel_guard: Option<Arc<watch::Sender<bool>>>,
}

impl RunContext {
    pub fn new(cancel: watch::Receiver<bool>, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            timeout,
            cancel_guard: None,
        }
    }

    /// A context that never cancels; worker agents and tests use this.
    pub fn detached(timeout: Option<Duration>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            cancel: rx,
            timeout,
            cancel_guard: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// What a successful (or cleanly failed) run returns.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub outputs: BTreeMap<String, CwlValue>,
    pub exit_code: i32,
    pub logs_ref: Option<String>,
}

/// How the scheduler drives an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Scheduler invokes `run` on a pooled slot.
    Pooled,
    /// External agents claim the task; the scheduler only watches the
    /// store for completion.
    External,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this executor can run a task with the given hints.
    fn supports(&self, hints: &TaskHints) -> bool;

    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Pooled
    }

    /// Run the task to completion. A clean non-zero exit is an
    /// `ExecError{NonZeroExit}`, not a `RunOutcome`.
    async fn run(&self, ctx: RunContext, task: &Task) -> Result<RunOutcome>;
}

//! Tasks: one instance of one step within one submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::document::CommandLineTool;
use crate::hints::TaskHints;
use crate::id::ResourceId;
use crate::value::CwlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Claimed => "claimed",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "ready" => Some(TaskState::Ready),
            "claimed" => Some(TaskState::Claimed),
            "running" => Some(TaskState::Running),
            "succeeded" => Some(TaskState::Succeeded),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task failed; `kind` is the error taxonomy name, `reason` the
/// scheduler-facing label (`staging`, `lease_lost`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: ResourceId,
    pub submission_id: ResourceId,
    pub step_name: String,
    /// The tool to run, embedded so worker agents leasing the task over
    /// HTTP need no further document lookups.
    pub tool: CommandLineTool,
    pub state: TaskState,
    /// 1-based; incremented only on the failed -> ready retry transition.
    pub attempt: u32,
    /// Position in the submission's topological order; the dispatch
    /// tie-break and the "first failure" report both use it.
    pub topo_index: i64,
    pub inputs: BTreeMap<String, CwlValue>,
    pub outputs: BTreeMap<String, CwlValue>,
    pub exit_code: Option<i32>,
    pub error: Option<TaskError>,
    pub logs_ref: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Earliest time the task may be dispatched or claimed again;
    /// written by retry backoff.
    pub not_before: Option<DateTime<Utc>>,
    pub hints: TaskHints,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        submission_id: ResourceId,
        step_name: impl Into<String>,
        tool: CommandLineTool,
        topo_index: i64,
        hints: TaskHints,
    ) -> Self {
        Task {
            id: ResourceId::new(),
            submission_id,
            step_name: step_name.into(),
            tool,
            state: TaskState::Pending,
            attempt: 1,
            topo_index,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            exit_code: None,
            error: None,
            logs_ref: None,
            lease_owner: None,
            lease_expiry: None,
            not_before: None,
            hints,
            created_at: Utc::now(),
        }
    }

    /// Whether dispatch/claim must skip this task for now.
    pub fn held_back(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|t| t > now)
    }
}

/// Field updates applied together with a CAS state transition.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub attempt: Option<u32>,
    pub inputs: Option<BTreeMap<String, CwlValue>>,
    pub error: Option<TaskError>,
    pub not_before: Option<DateTime<Utc>>,
    pub clear_lease: bool,
}

impl TaskUpdate {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Terminal report for a task: what `CompleteTask` persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub outputs: BTreeMap<String, CwlValue>,
    pub exit_code: Option<i32>,
    pub logs_ref: Option<String>,
    /// Present iff the task failed.
    pub error: Option<TaskError>,
}

//! Submissions: one requested run of a workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::ResourceId;
use crate::value::CwlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Succeeded | SubmissionState::Failed | SubmissionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Pending => "pending",
            SubmissionState::Running => "running",
            SubmissionState::Succeeded => "succeeded",
            SubmissionState::Failed => "failed",
            SubmissionState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubmissionState::Pending),
            "running" => Some(SubmissionState::Running),
            "succeeded" => Some(SubmissionState::Succeeded),
            "failed" => Some(SubmissionState::Failed),
            "cancelled" => Some(SubmissionState::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure surfaced to API clients: the first failed task in
/// topological order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionError {
    pub task_id: ResourceId,
    pub step_name: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: ResourceId,
    pub workflow_id: ResourceId,
    pub inputs: BTreeMap<String, CwlValue>,
    pub state: SubmissionState,
    /// Lower runs first; ties broken by submission age.
    pub priority: i32,
    /// Token-identified user who submitted.
    pub owner: Option<String>,
    pub error: Option<SubmissionError>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(workflow_id: ResourceId, inputs: BTreeMap<String, CwlValue>) -> Self {
        Submission {
            id: ResourceId::new(),
            workflow_id,
            inputs,
            state: SubmissionState::Pending,
            priority: 0,
            owner: None,
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}

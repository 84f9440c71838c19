//! Store trait: the transactional persistence seam.
//!
//! Every operation is atomic; state transitions are CAS-guarded so
//! concurrent schedulers/agents cannot lose updates. SQLite is the
//! typical embedding, with an in-memory implementation for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::id::ResourceId;
use crate::submission::{Submission, SubmissionError, SubmissionState};
use crate::task::{Task, TaskCompletion, TaskState, TaskUpdate};
use crate::workflow::Workflow;

/// A registered worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: ResourceId,
    pub name: String,
    pub hostname: String,
    pub runtime: String,
    pub group: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Workflows: created once, never mutated.
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()>;
    async fn get_workflow(&self, id: ResourceId) -> Result<Workflow>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;
    /// Fails with `Conflict` while submissions still reference it.
    async fn delete_workflow(&self, id: ResourceId) -> Result<()>;

    // Submissions.
    async fn create_submission(&self, submission: &Submission) -> Result<()>;
    async fn get_submission(&self, id: ResourceId) -> Result<Submission>;
    async fn list_submissions(&self, state: Option<SubmissionState>) -> Result<Vec<Submission>>;
    /// CAS transition; returns false when the current state is not `from`.
    async fn update_submission_state(
        &self,
        id: ResourceId,
        from: SubmissionState,
        to: SubmissionState,
        error: Option<SubmissionError>,
    ) -> Result<bool>;
    /// Atomic; a no-op on terminal states.
    async fn cancel_submission(&self, id: ResourceId) -> Result<()>;

    // Tasks.
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: ResourceId) -> Result<Task>;
    async fn list_tasks_by_submission(&self, submission_id: ResourceId) -> Result<Vec<Task>>;
    /// CAS on `from`; applies `update` in the same transaction. Returns
    /// false (without touching the row) when the state does not match.
    async fn update_task_state(
        &self,
        id: ResourceId,
        from: TaskState,
        to: TaskState,
        update: TaskUpdate,
    ) -> Result<bool>;
    /// Atomically pick the best admissible `ready` task for `executor`
    /// limited to `groups`, mark it claimed, and lease it to `owner`.
    /// Ordering: submission priority, submission age, topological index.
    async fn claim_next_task(
        &self,
        executor: &str,
        owner: &str,
        groups: &[String],
        lease_ttl: Duration,
    ) -> Result<Option<Task>>;
    /// Terminal transition `claimed|running -> succeeded|failed`.
    /// Returns false when the task was not in a completable state.
    async fn complete_task(&self, id: ResourceId, completion: &TaskCompletion) -> Result<bool>;
    /// Tasks whose lease expired before `now`, so the scheduler can
    /// re-queue them.
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;
    /// Extend a lease; false when the caller no longer owns it.
    async fn renew_lease(
        &self,
        task_id: ResourceId,
        owner: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool>;

    // Workers.
    async fn register_worker(&self, worker: &WorkerRecord) -> Result<()>;
    async fn get_worker(&self, id: ResourceId) -> Result<WorkerRecord>;
    async fn touch_worker(&self, id: ResourceId, now: DateTime<Utc>) -> Result<()>;
}

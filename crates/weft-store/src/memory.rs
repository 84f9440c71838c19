//! In-memory store.
//!
//! Same semantics as the SQLite implementation, held behind one mutex
//! so every operation stays atomic. Used by tests and by callers that
//! want a throwaway engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use weft_core::{
    Error, Result, ResourceId, Store, Submission, SubmissionError, SubmissionState, Task,
    TaskCompletion, TaskState, TaskUpdate, Workflow, WorkerRecord,
};

#[derive(Default)]
struct Inner {
    workflows: BTreeMap<ResourceId, Workflow>,
    submissions: BTreeMap<ResourceId, Submission>,
    tasks: BTreeMap<ResourceId, Task>,
    workers: BTreeMap<ResourceId, WorkerRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned store mutex means a panicked writer; propagating the
        // inner data is still sound for reads and the process is about
        // to die anyway.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.lock().workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: ResourceId) -> Result<Workflow> {
        self.lock()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow {id}")))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self.lock().workflows.values().cloned().collect())
    }

    async fn delete_workflow(&self, id: ResourceId) -> Result<()> {
        let mut inner = self.lock();
        let references = inner
            .submissions
            .values()
            .filter(|s| s.workflow_id == id)
            .count();
        if references > 0 {
            return Err(Error::Conflict(format!(
                "workflow {id} still has {references} submissions"
            )));
        }
        inner
            .workflows
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("workflow {id}")))
    }

    async fn create_submission(&self, submission: &Submission) -> Result<()> {
        self.lock()
            .submissions
            .insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get_submission(&self, id: ResourceId) -> Result<Submission> {
        self.lock()
            .submissions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("submission {id}")))
    }

    async fn list_submissions(&self, state: Option<SubmissionState>) -> Result<Vec<Submission>> {
        let inner = self.lock();
        let mut subs: Vec<Submission> = inner
            .submissions
            .values()
            .filter(|s| state.is_none_or(|wanted| s.state == wanted))
            .cloned()
            .collect();
        subs.sort_by_key(|s| (s.priority, s.submitted_at));
        Ok(subs)
    }

    async fn update_submission_state(
        &self,
        id: ResourceId,
        from: SubmissionState,
        to: SubmissionState,
        error: Option<SubmissionError>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(submission) = inner.submissions.get_mut(&id) else {
            return Err(Error::NotFound(format!("submission {id}")));
        };
        if submission.state != from {
            return Ok(false);
        }
        submission.state = to;
        if let Some(error) = error {
            submission.error = Some(error);
        }
        if to.is_terminal() {
            submission.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn cancel_submission(&self, id: ResourceId) -> Result<()> {
        let mut inner = self.lock();
        let Some(submission) = inner.submissions.get_mut(&id) else {
            return Err(Error::NotFound(format!("submission {id}")));
        };
        if !submission.state.is_terminal() {
            submission.state = SubmissionState::Cancelled;
            submission.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        self.lock().tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: ResourceId) -> Result<Task> {
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list_tasks_by_submission(&self, submission_id: ResourceId) -> Result<Vec<Task>> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.submission_id == submission_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.topo_index);
        Ok(tasks)
    }

    async fn update_task_state(
        &self,
        id: ResourceId,
        from: TaskState,
        to: TaskState,
        update: TaskUpdate,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Err(Error::NotFound(format!("task {id}")));
        };
        if task.state != from {
            return Ok(false);
        }
        task.state = to;
        if let Some(attempt) = update.attempt {
            task.attempt = attempt;
        }
        if let Some(inputs) = update.inputs {
            task.inputs = inputs;
        }
        if let Some(error) = update.error {
            task.error = Some(error);
        }
        task.not_before = update.not_before;
        if update.clear_lease {
            task.lease_owner = None;
            task.lease_expiry = None;
        }
        Ok(true)
    }

    async fn claim_next_task(
        &self,
        executor: &str,
        owner: &str,
        groups: &[String],
        lease_ttl: Duration,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let mut inner = self.lock();

        let mut candidates: Vec<(i32, DateTime<Utc>, i64, ResourceId)> = Vec::new();
        for task in inner.tasks.values() {
            if task.state != TaskState::Ready
                || task.hints.executor.as_deref() != Some(executor)
                || task.held_back(now)
            {
                continue;
            }
            let group_ok = match &task.hints.worker_group {
                None => true,
                Some(group) => groups.contains(group),
            };
            if !group_ok {
                continue;
            }
            let Some(submission) = inner.submissions.get(&task.submission_id) else {
                continue;
            };
            candidates.push((
                submission.priority,
                submission.submitted_at,
                task.topo_index,
                task.id,
            ));
        }
        candidates.sort();
        let Some((_, _, _, task_id)) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let expiry = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| Error::System(format!("lease ttl: {e}")))?;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        task.state = TaskState::Claimed;
        task.lease_owner = Some(owner.to_string());
        task.lease_expiry = Some(expiry);
        Ok(Some(task.clone()))
    }

    async fn complete_task(&self, id: ResourceId, completion: &TaskCompletion) -> Result<bool> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Err(Error::NotFound(format!("task {id}")));
        };
        if !matches!(task.state, TaskState::Claimed | TaskState::Running) {
            return Ok(false);
        }
        task.state = if completion.error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Succeeded
        };
        task.outputs = completion.outputs.clone();
        task.exit_code = completion.exit_code;
        if completion.logs_ref.is_some() {
            task.logs_ref = completion.logs_ref.clone();
        }
        task.error = completion.error.clone();
        task.lease_owner = None;
        task.lease_expiry = None;
        Ok(true)
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                matches!(t.state, TaskState::Claimed | TaskState::Running)
                    && t.lease_expiry.is_some_and(|expiry| expiry < now)
            })
            .cloned()
            .collect())
    }

    async fn renew_lease(
        &self,
        task_id: ResourceId,
        owner: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Err(Error::NotFound(format!("task {task_id}")));
        };
        if task.lease_owner.as_deref() != Some(owner)
            || !matches!(task.state, TaskState::Claimed | TaskState::Running)
        {
            return Ok(false);
        }
        task.lease_expiry = Some(expiry);
        Ok(true)
    }

    async fn register_worker(&self, worker: &WorkerRecord) -> Result<()> {
        self.lock().workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: ResourceId) -> Result<WorkerRecord> {
        self.lock()
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))
    }

    async fn touch_worker(&self, id: ResourceId, now: DateTime<Utc>) -> Result<()> {
        if let Some(worker) = self.lock().workers.get_mut(&id) {
            worker.last_seen = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use weft_core::document::CommandLineTool;
    use weft_core::{TaskHints, WorkflowGraph};

    async fn seed_submission(store: &MemoryStore, priority: i32) -> Submission {
        let workflow = Workflow {
            id: ResourceId::new(),
            content: serde_json::json!({}),
            graph: WorkflowGraph::default(),
        };
        let mut submission = Submission::new(workflow.id, Map::new());
        submission.priority = priority;
        store.create_workflow(&workflow).await.unwrap();
        store.create_submission(&submission).await.unwrap();
        submission
    }

    async fn seed_task(
        store: &MemoryStore,
        submission: &Submission,
        topo: i64,
        executor: &str,
    ) -> Task {
        let mut task = Task::new(
            submission.id,
            format!("step-{topo}"),
            CommandLineTool::default(),
            topo,
            TaskHints {
                executor: Some(executor.to_string()),
                ..Default::default()
            },
        );
        task.state = TaskState::Ready;
        store.create_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_ordered() {
        let store = MemoryStore::new();
        let submission = seed_submission(&store, 0).await;
        let first = seed_task(&store, &submission, 0, "worker").await;
        let _second = seed_task(&store, &submission, 1, "worker").await;

        let ttl = Duration::from_secs(60);
        let claimed = store.claim_next_task("worker", "agent-1", &[], ttl).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, TaskState::Claimed);

        // The same task cannot be claimed twice.
        let next = store.claim_next_task("worker", "agent-1", &[], ttl).await.unwrap().unwrap();
        assert_ne!(next.id, first.id);
        assert!(store.claim_next_task("worker", "agent-1", &[], ttl).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_prefers_high_priority_submissions() {
        let store = MemoryStore::new();
        let low = seed_submission(&store, 5).await;
        let high = seed_submission(&store, 0).await;
        seed_task(&store, &low, 0, "worker").await;
        let urgent = seed_task(&store, &high, 0, "worker").await;

        let claimed = store
            .claim_next_task("worker", "agent-1", &[], Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, urgent.id);
    }

    #[tokio::test]
    async fn group_pinned_tasks_need_a_matching_group() {
        let store = MemoryStore::new();
        let submission = seed_submission(&store, 0).await;
        let mut task = seed_task(&store, &submission, 0, "worker").await;
        task.hints.worker_group = Some("gpu".to_string());
        store.create_task(&task).await.unwrap();

        let ttl = Duration::from_secs(60);
        assert!(store.claim_next_task("worker", "agent-1", &[], ttl).await.unwrap().is_none());
        let claimed = store
            .claim_next_task("worker", "agent-1", &["gpu".to_string()], ttl)
            .await
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn cas_rejects_stale_transitions() {
        let store = MemoryStore::new();
        let submission = seed_submission(&store, 0).await;
        let task = seed_task(&store, &submission, 0, "local").await;

        let moved = store
            .update_task_state(task.id, TaskState::Ready, TaskState::Running, TaskUpdate::none())
            .await
            .unwrap();
        assert!(moved);
        let stale = store
            .update_task_state(task.id, TaskState::Ready, TaskState::Running, TaskUpdate::none())
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn expired_leases_are_reaped() {
        let store = MemoryStore::new();
        let submission = seed_submission(&store, 0).await;
        seed_task(&store, &submission, 0, "worker").await;

        store
            .claim_next_task("worker", "agent-1", &[], Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(5);
        let reaped = store.reap_expired_leases(later).await.unwrap();
        assert_eq!(reaped.len(), 1);
    }

    #[tokio::test]
    async fn cancel_is_a_noop_on_terminal_submissions() {
        let store = MemoryStore::new();
        let submission = seed_submission(&store, 0).await;
        store
            .update_submission_state(
                submission.id,
                SubmissionState::Pending,
                SubmissionState::Succeeded,
                None,
            )
            .await
            .unwrap();

        store.cancel_submission(submission.id).await.unwrap();
        let current = store.get_submission(submission.id).await.unwrap();
        assert_eq!(current.state, SubmissionState::Succeeded);
    }

    #[tokio::test]
    async fn workflow_deletion_requires_no_submissions() {
        let store = MemoryStore::new();
        let submission = seed_submission(&store, 0).await;
        let err = store.delete_workflow(submission.workflow_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}

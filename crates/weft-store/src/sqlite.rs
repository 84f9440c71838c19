//! SQLite implementation of the store.
//!
//! Every trait operation runs as a single transaction; CAS transitions
//! check affected-row counts instead of reading first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use weft_core::{
    CwlValue, Error, Result, ResourceId, Store, Submission, SubmissionError, SubmissionState,
    Task, TaskCompletion, TaskState, TaskUpdate, Workflow, WorkerRecord,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn internal(err: sqlx::Error) -> Error {
    Error::System(format!("store: {err}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::System(format!("store encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::System(format!("store decode: {e}")))
}

fn parse_id(text: &str) -> Result<ResourceId> {
    text.parse()
        .map_err(|e| Error::System(format!("store id {text:?}: {e}")))
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    content: String,
    graph: String,
}

impl WorkflowRow {
    fn into_workflow(self) -> Result<Workflow> {
        Ok(Workflow {
            id: parse_id(&self.id)?,
            content: from_json(&self.content)?,
            graph: from_json(&self.graph)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: String,
    workflow_id: String,
    inputs: String,
    state: String,
    priority: i64,
    owner: Option<String>,
    error: Option<String>,
    submitted_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SubmissionRow {
    fn into_submission(self) -> Result<Submission> {
        let state = SubmissionState::parse(&self.state)
            .ok_or_else(|| Error::System(format!("unknown submission state {:?}", self.state)))?;
        Ok(Submission {
            id: parse_id(&self.id)?,
            workflow_id: parse_id(&self.workflow_id)?,
            inputs: from_json::<BTreeMap<String, CwlValue>>(&self.inputs)?,
            state,
            priority: self.priority as i32,
            owner: self.owner,
            error: self.error.as_deref().map(from_json).transpose()?,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    submission_id: String,
    step_name: String,
    tool: String,
    state: String,
    attempt: i64,
    topo_index: i64,
    inputs: String,
    outputs: String,
    exit_code: Option<i64>,
    error: Option<String>,
    logs_ref: Option<String>,
    lease_owner: Option<String>,
    lease_expiry: Option<DateTime<Utc>>,
    not_before: Option<DateTime<Utc>>,
    hints: String,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let state = TaskState::parse(&self.state)
            .ok_or_else(|| Error::System(format!("unknown task state {:?}", self.state)))?;
        Ok(Task {
            id: parse_id(&self.id)?,
            submission_id: parse_id(&self.submission_id)?,
            step_name: self.step_name,
            tool: from_json(&self.tool)?,
            state,
            attempt: self.attempt as u32,
            topo_index: self.topo_index,
            inputs: from_json(&self.inputs)?,
            outputs: from_json(&self.outputs)?,
            exit_code: self.exit_code.map(|c| c as i32),
            error: self.error.as_deref().map(from_json).transpose()?,
            logs_ref: self.logs_ref,
            lease_owner: self.lease_owner,
            lease_expiry: self.lease_expiry,
            not_before: self.not_before,
            hints: from_json(&self.hints)?,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    name: String,
    hostname: String,
    runtime: String,
    worker_group: String,
    registered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl WorkerRow {
    fn into_worker(self) -> Result<WorkerRecord> {
        Ok(WorkerRecord {
            id: parse_id(&self.id)?,
            name: self.name,
            hostname: self.hostname,
            runtime: self.runtime,
            group: self.worker_group,
            registered_at: self.registered_at,
            last_seen: self.last_seen,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflows (id, content, graph, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(workflow.id.to_string())
        .bind(to_json(&workflow.content)?)
        .bind(to_json(&workflow.graph)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_workflow(&self, id: ResourceId) -> Result<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, content, graph FROM workflows WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?
        .ok_or_else(|| Error::NotFound(format!("workflow {id}")))?;
        row.into_workflow()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, content, graph FROM workflows ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    async fn delete_workflow(&self, id: ResourceId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let (references,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM submissions WHERE workflow_id = ?1")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(internal)?;
        if references > 0 {
            return Err(Error::Conflict(format!(
                "workflow {id} still has {references} submissions"
            )));
        }
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        tx.commit().await.map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("workflow {id}")));
        }
        Ok(())
    }

    async fn create_submission(&self, submission: &Submission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO submissions (id, workflow_id, inputs, state, priority, owner, error, submitted_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(submission.id.to_string())
        .bind(submission.workflow_id.to_string())
        .bind(to_json(&submission.inputs)?)
        .bind(submission.state.as_str())
        .bind(submission.priority as i64)
        .bind(submission.owner.clone())
        .bind(submission.error.as_ref().map(to_json).transpose()?)
        .bind(submission.submitted_at)
        .bind(submission.finished_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_submission(&self, id: ResourceId) -> Result<Submission> {
        let row = sqlx::query_as::<_, SubmissionRow>("SELECT * FROM submissions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or_else(|| Error::NotFound(format!("submission {id}")))?;
        row.into_submission()
    }

    async fn list_submissions(&self, state: Option<SubmissionState>) -> Result<Vec<Submission>> {
        let rows = match state {
            Some(state) => {
                sqlx::query_as::<_, SubmissionRow>(
                    "SELECT * FROM submissions WHERE state = ?1 ORDER BY priority, submitted_at",
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, SubmissionRow>(
                    "SELECT * FROM submissions ORDER BY priority, submitted_at",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(internal)?;
        rows.into_iter().map(SubmissionRow::into_submission).collect()
    }

    async fn update_submission_state(
        &self,
        id: ResourceId,
        from: SubmissionState,
        to: SubmissionState,
        error: Option<SubmissionError>,
    ) -> Result<bool> {
        let finished_at = to.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE submissions
            SET state = ?3,
                error = COALESCE(?4, error),
                finished_at = COALESCE(?5, finished_at)
            WHERE id = ?1 AND state = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(error.as_ref().map(to_json).transpose()?)
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_submission(&self, id: ResourceId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE submissions SET state = 'cancelled', finished_at = ?2
            WHERE id = ?1 AND state IN ('pending', 'running')
            "#,
        )
        .bind(id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        debug!(submission_id = %id, cancelled = result.rows_affected() > 0, "cancel requested");
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, submission_id, step_name, tool, state, attempt, topo_index,
                inputs, outputs, exit_code, error, logs_ref,
                lease_owner, lease_expiry, not_before,
                executor, worker_group, hints, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.submission_id.to_string())
        .bind(&task.step_name)
        .bind(to_json(&task.tool)?)
        .bind(task.state.as_str())
        .bind(task.attempt as i64)
        .bind(task.topo_index)
        .bind(to_json(&task.inputs)?)
        .bind(to_json(&task.outputs)?)
        .bind(task.exit_code.map(|c| c as i64))
        .bind(task.error.as_ref().map(to_json).transpose()?)
        .bind(task.logs_ref.clone())
        .bind(task.lease_owner.clone())
        .bind(task.lease_expiry)
        .bind(task.not_before)
        .bind(task.hints.executor.clone())
        .bind(task.hints.worker_group.clone())
        .bind(to_json(&task.hints)?)
        .bind(task.created_at)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_task(&self, id: ResourceId) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        row.into_task()
    }

    async fn list_tasks_by_submission(&self, submission_id: ResourceId) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE submission_id = ?1 ORDER BY topo_index",
        )
        .bind(submission_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn update_task_state(
        &self,
        id: ResourceId,
        from: TaskState,
        to: TaskState,
        update: TaskUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?3,
                attempt = COALESCE(?4, attempt),
                inputs = COALESCE(?5, inputs),
                error = COALESCE(?6, error),
                not_before = ?7,
                lease_owner = CASE WHEN ?8 THEN NULL ELSE lease_owner END,
                lease_expiry = CASE WHEN ?8 THEN NULL ELSE lease_expiry END
            WHERE id = ?1 AND state = ?2
            "#,
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(update.attempt.map(|a| a as i64))
        .bind(update.inputs.as_ref().map(to_json).transpose()?)
        .bind(update.error.as_ref().map(to_json).transpose()?)
        .bind(update.not_before)
        .bind(update.clear_lease)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_next_task(
        &self,
        executor: &str,
        owner: &str,
        groups: &[String],
        lease_ttl: Duration,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let expiry = now
            + chrono::Duration::from_std(lease_ttl)
                .map_err(|e| Error::System(format!("lease ttl: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(internal)?;

        // Build the group filter with one placeholder per group.
        let group_filter = if groups.is_empty() {
            "t.worker_group IS NULL".to_string()
        } else {
            let placeholders: Vec<String> =
                (0..groups.len()).map(|i| format!("?{}", i + 3)).collect();
            format!(
                "(t.worker_group IS NULL OR t.worker_group IN ({}))",
                placeholders.join(", ")
            )
        };
        let sql = format!(
            r#"
            SELECT t.* FROM tasks t
            JOIN submissions s ON s.id = t.submission_id
            WHERE t.state = 'ready'
              AND t.executor = ?1
              AND (t.not_before IS NULL OR t.not_before <= ?2)
              AND {group_filter}
            ORDER BY s.priority ASC, s.submitted_at ASC, t.topo_index ASC
            LIMIT 1
            "#
        );
        let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(executor).bind(now);
        for group in groups {
            query = query.bind(group);
        }
        let Some(row) = query.fetch_optional(&mut *tx).await.map_err(internal)? else {
            return Ok(None);
        };

        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = 'claimed', lease_owner = ?2, lease_expiry = ?3
            WHERE id = ?1 AND state = 'ready'
            "#,
        )
        .bind(&row.id)
        .bind(owner)
        .bind(expiry)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;
        tx.commit().await.map_err(internal)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let mut task = row.into_task()?;
        task.state = TaskState::Claimed;
        task.lease_owner = Some(owner.to_string());
        task.lease_expiry = Some(expiry);
        Ok(Some(task))
    }

    async fn complete_task(&self, id: ResourceId, completion: &TaskCompletion) -> Result<bool> {
        let state = if completion.error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Succeeded
        };
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?2, outputs = ?3, exit_code = ?4,
                logs_ref = COALESCE(?5, logs_ref), error = ?6,
                lease_owner = NULL, lease_expiry = NULL
            WHERE id = ?1 AND state IN ('claimed', 'running')
            "#,
        )
        .bind(id.to_string())
        .bind(state.as_str())
        .bind(to_json(&completion.outputs)?)
        .bind(completion.exit_code.map(|c| c as i64))
        .bind(completion.logs_ref.clone())
        .bind(completion.error.as_ref().map(to_json).transpose()?)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE state IN ('claimed', 'running')
              AND lease_expiry IS NOT NULL AND lease_expiry < ?1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn renew_lease(
        &self,
        task_id: ResourceId,
        owner: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET lease_expiry = ?3
            WHERE id = ?1 AND lease_owner = ?2 AND state IN ('claimed', 'running')
            "#,
        )
        .bind(task_id.to_string())
        .bind(owner)
        .bind(expiry)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn register_worker(&self, worker: &WorkerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, name, hostname, runtime, worker_group, registered_at, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(worker.id.to_string())
        .bind(&worker.name)
        .bind(&worker.hostname)
        .bind(&worker.runtime)
        .bind(&worker.group)
        .bind(worker.registered_at)
        .bind(worker.last_seen)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn get_worker(&self, id: ResourceId) -> Result<WorkerRecord> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;
        row.into_worker()
    }

    async fn touch_worker(&self, id: ResourceId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE workers SET last_seen = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }
}

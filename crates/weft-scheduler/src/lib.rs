//! Tick-based scheduling for the weft workflow engine.
//!
//! The scheduler owns no concrete store or executor; both arrive as
//! trait objects and are wired together in the server binary.

pub mod dag;
pub mod scheduler;

pub use dag::{bind_inputs, plan_tasks, PlannedTask};
pub use scheduler::{Scheduler, SchedulerConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use weft_core::document::Requirements;
    use weft_core::{
        CwlValue, ExecError, Executor, ResourceId, Result, RunContext, RunOutcome, Step,
        StepRun, Store, Submission, SubmissionState, TaskHints, TaskState, Workflow,
        WorkflowGraph,
    };
    use weft_executor::{ExecutorRegistry, LocalExecutor, WorkerExecutor};
    use weft_staging::PropertyEvaluator;
    use weft_store::MemoryStore;

    fn tool_step(name: &str, tool: serde_json::Value, bindings: &[(&str, &str)]) -> Step {
        Step {
            name: name.to_string(),
            run: StepRun::Tool(Box::new(serde_json::from_value(tool).unwrap())),
            in_bindings: bindings
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            out_names: vec!["out".to_string()],
            hints: Requirements::new(),
        }
    }

    fn hinted(mut step: Step, executor: &str) -> Step {
        step.hints
            .insert("goweHint", json!({"executor": executor}));
        step
    }

    async fn seed(
        store: &Arc<MemoryStore>,
        graph: WorkflowGraph,
        inputs: BTreeMap<String, CwlValue>,
    ) -> Submission {
        let workflow = Workflow {
            id: ResourceId::new(),
            content: json!({}),
            graph,
        };
        store.create_workflow(&workflow).await.unwrap();
        let submission = Submission::new(workflow.id, inputs);
        store.create_submission(&submission).await.unwrap();
        submission
    }

    fn local_registry(base: &Path, store: &Arc<MemoryStore>) -> Arc<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(LocalExecutor::new(
            base.join("work"),
            base.join("outputs"),
            Arc::new(PropertyEvaluator),
        )));
        registry.register(Arc::new(WorkerExecutor::new(store.clone())));
        Arc::new(registry)
    }

    async fn drive(scheduler: &mut Scheduler, store: &Arc<MemoryStore>, id: ResourceId) {
        for _ in 0..200 {
            scheduler.tick().await.unwrap();
            let submission = store.get_submission(id).await.unwrap();
            if submission.state.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("submission did not reach a terminal state");
    }

    #[tokio::test]
    async fn linear_two_step_pipeline_succeeds() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = local_registry(base.path(), &store);

        let graph = WorkflowGraph {
            inputs: vec!["message".to_string()],
            outputs: vec![],
            steps: vec![
                tool_step(
                    "echo",
                    json!({
                        "baseCommand": "echo",
                        "inputs": [{"id": "message", "type": "string", "inputBinding": {"position": 1}}],
                        "outputs": [{"id": "out", "type": "File", "outputBinding": {"glob": "output.txt"}}],
                        "stdout": "output.txt",
                    }),
                    &[("message", "message")],
                ),
                tool_step(
                    "count",
                    json!({
                        "baseCommand": ["wc", "-c"],
                        "inputs": [{"id": "in_file", "type": "File"}],
                        "stdin": "$(inputs.in_file.path)",
                        "outputs": [{"id": "count", "type": "stdout"}],
                        "stdout": "count.txt",
                    }),
                    &[("in_file", "echo/out")],
                ),
            ],
        };
        let inputs =
            BTreeMap::from([("message".to_string(), CwlValue::String("hello".into()))]);
        let submission = seed(&store, graph, inputs).await;

        let mut scheduler =
            Scheduler::new(store.clone(), registry, SchedulerConfig::default());
        drive(&mut scheduler, &store, submission.id).await;

        let finished = store.get_submission(submission.id).await.unwrap();
        assert_eq!(finished.state, SubmissionState::Succeeded);

        let tasks = store.list_tasks_by_submission(submission.id).await.unwrap();
        let echo = tasks.iter().find(|t| t.step_name == "echo").unwrap();
        let out = echo.outputs["out"].as_file().unwrap();
        assert_eq!(
            fs::read_to_string(out.path.as_deref().unwrap()).unwrap(),
            "hello\n"
        );

        let count = tasks.iter().find(|t| t.step_name == "count").unwrap();
        assert_eq!(count.state, TaskState::Succeeded);
        let counted = count.outputs["count"].as_file().unwrap();
        let text = fs::read_to_string(counted.path.as_deref().unwrap()).unwrap();
        assert_eq!(text.trim(), "6");
    }

    #[tokio::test]
    async fn failed_dependency_cancels_downstream() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = local_registry(base.path(), &store);

        let graph = WorkflowGraph {
            inputs: vec![],
            outputs: vec![],
            steps: vec![
                tool_step(
                    "a",
                    json!({
                        "baseCommand": ["sh", "-c", "exit 1"],
                        "outputs": [{"id": "out", "type": "File", "outputBinding": {"glob": "missing.txt"}}],
                    }),
                    &[],
                ),
                tool_step(
                    "b",
                    json!({"baseCommand": "true"}),
                    &[("x", "a/out")],
                ),
            ],
        };
        let submission = seed(&store, graph, BTreeMap::new()).await;

        let mut scheduler =
            Scheduler::new(store.clone(), registry, SchedulerConfig::default());
        drive(&mut scheduler, &store, submission.id).await;

        let finished = store.get_submission(submission.id).await.unwrap();
        assert_eq!(finished.state, SubmissionState::Failed);
        let error = finished.error.unwrap();
        assert_eq!(error.step_name, "a");

        let tasks = store.list_tasks_by_submission(submission.id).await.unwrap();
        assert_eq!(
            tasks.iter().find(|t| t.step_name == "a").unwrap().state,
            TaskState::Failed
        );
        assert_eq!(
            tasks.iter().find(|t| t.step_name == "b").unwrap().state,
            TaskState::Cancelled
        );
    }

    /// Fails with a transport error until the configured attempt.
    struct Flaky {
        succeed_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn supports(&self, hints: &TaskHints) -> bool {
            hints.executor.as_deref() == Some("flaky")
        }

        async fn run(&self, _ctx: RunContext, _task: &weft_core::Task) -> Result<RunOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                return Err(ExecError::transport("connection refused").into());
            }
            Ok(RunOutcome {
                outputs: BTreeMap::new(),
                exit_code: 0,
                logs_ref: None,
            })
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Flaky {
            succeed_on: 3,
            calls: AtomicU32::new(0),
        }));
        let registry = Arc::new(registry);

        let graph = WorkflowGraph {
            inputs: vec![],
            outputs: vec![],
            steps: vec![hinted(
                tool_step("unstable", json!({"baseCommand": "true"}), &[]),
                "flaky",
            )],
        };
        let submission = seed(&store, graph, BTreeMap::new()).await;

        let config = SchedulerConfig {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let mut scheduler = Scheduler::new(store.clone(), registry, config);
        drive(&mut scheduler, &store, submission.id).await;

        let finished = store.get_submission(submission.id).await.unwrap();
        assert_eq!(finished.state, SubmissionState::Succeeded);
        let tasks = store.list_tasks_by_submission(submission.id).await.unwrap();
        assert_eq!(tasks[0].attempt, 3);
    }

    #[tokio::test]
    async fn reaped_lease_requeues_the_task() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = local_registry(base.path(), &store);

        let graph = WorkflowGraph {
            inputs: vec![],
            outputs: vec![],
            steps: vec![hinted(
                tool_step("remote", json!({"baseCommand": "true"}), &[]),
                "worker",
            )],
        };
        let submission = seed(&store, graph, BTreeMap::new()).await;

        let mut scheduler =
            Scheduler::new(store.clone(), registry, SchedulerConfig::default());
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();

        // An agent claims with a tiny lease and goes silent.
        let claimed = store
            .claim_next_task("worker", "agent-1", &[], Duration::from_millis(5))
            .await
            .unwrap()
            .expect("ready worker task");
        assert_eq!(claimed.attempt, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.tick().await.unwrap();
        let task = store.get_task(claimed.id).await.unwrap();
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.attempt, 2);
        assert!(task.lease_owner.is_none());

        // Another agent can pick it up.
        let reclaimed = store
            .claim_next_task("worker", "agent-2", &[], Duration::from_secs(60))
            .await
            .unwrap()
            .expect("requeued task claimable");
        assert_eq!(reclaimed.id, claimed.id);
    }

    #[tokio::test]
    async fn cancelling_a_submission_stops_running_tasks() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = local_registry(base.path(), &store);

        let graph = WorkflowGraph {
            inputs: vec![],
            outputs: vec![],
            steps: vec![tool_step(
                "slow",
                json!({"baseCommand": ["sleep", "30"]}),
                &[],
            )],
        };
        let submission = seed(&store, graph, BTreeMap::new()).await;

        let mut scheduler =
            Scheduler::new(store.clone(), registry, SchedulerConfig::default());
        // Admit and dispatch.
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.cancel_submission(submission.id).await.unwrap();
        for _ in 0..50 {
            scheduler.tick().await.unwrap();
            let tasks = store.list_tasks_by_submission(submission.id).await.unwrap();
            if tasks.iter().all(|t| t.state.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let finished = store.get_submission(submission.id).await.unwrap();
        assert_eq!(finished.state, SubmissionState::Cancelled);
        let tasks = store.list_tasks_by_submission(submission.id).await.unwrap();
        assert_eq!(tasks[0].state, TaskState::Cancelled);
    }
}

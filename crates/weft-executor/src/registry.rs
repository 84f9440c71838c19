//! Executor registry: maps capability hints to an executor.

use std::collections::BTreeMap;
use std::sync::Arc;

use weft_core::{Executor, TaskHints};

/// Selection order: explicit `executor` hint, then a container
/// requirement, then the configured default, then local.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
    default_executor: Option<String>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_executor = Some(name.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn select(&self, hints: &TaskHints) -> Option<Arc<dyn Executor>> {
        if let Some(name) = &hints.executor {
            return self.get(name).filter(|e| e.supports(hints));
        }
        if hints.wants_container {
            if let Some(executor) = self.get("docker").filter(|e| e.supports(hints)) {
                return Some(executor);
            }
        }
        if let Some(name) = &self.default_executor {
            if let Some(executor) = self.get(name).filter(|e| e.supports(hints)) {
                return Some(executor);
            }
        }
        self.get("local").filter(|e| e.supports(hints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use weft_core::{Result, RunContext, RunOutcome, Task};

    struct Stub {
        name: &'static str,
        accepts_all: bool,
    }

    #[async_trait]
    impl Executor for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, hints: &TaskHints) -> bool {
            if self.accepts_all {
                return true;
            }
            hints.executor.as_deref() == Some(self.name)
        }

        async fn run(&self, _ctx: RunContext, _task: &Task) -> Result<RunOutcome> {
            unimplemented!()
        }
    }

    fn registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Stub { name: "local", accepts_all: true }));
        registry.register(Arc::new(Stub { name: "docker", accepts_all: true }));
        registry.register(Arc::new(Stub { name: "worker", accepts_all: false }));
        registry
    }

    #[test]
    fn explicit_hint_wins() {
        let registry = registry();
        let hints = TaskHints {
            executor: Some("worker".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.select(&hints).unwrap().name(), "worker");
    }

    #[test]
    fn docker_requirement_routes_to_container_executor() {
        let registry = registry();
        let hints = TaskHints {
            wants_container: true,
            ..Default::default()
        };
        assert_eq!(registry.select(&hints).unwrap().name(), "docker");
    }

    #[test]
    fn configured_default_beats_local() {
        let registry = registry().with_default("docker");
        assert_eq!(registry.select(&TaskHints::default()).unwrap().name(), "docker");
    }

    #[test]
    fn local_is_the_fallback() {
        let registry = registry();
        assert_eq!(registry.select(&TaskHints::default()).unwrap().name(), "local");
    }

    #[test]
    fn unknown_explicit_hint_selects_nothing() {
        let registry = registry();
        let hints = TaskHints {
            executor: Some("slurm".to_string()),
            ..Default::default()
        };
        assert!(registry.select(&hints).is_none());
    }
}

//! Executor-selection hints.

use serde::{Deserialize, Serialize};

use crate::document::{CommandLineTool, Requirements};

/// Class name of the engine's scheduling hint in CWL documents.
pub const ENGINE_HINT_CLASS: &str = "goweHint";

/// Body of the engine scheduling hint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineHint {
    pub executor: Option<String>,
    pub bvbrc_app_id: Option<String>,
    pub docker_image: Option<String>,
    pub worker_group: Option<String>,
}

/// Flattened hints carried on a task; what the registry and the store's
/// claim query select on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskHints {
    /// Explicit executor requested by the document author.
    pub executor: Option<String>,
    /// Worker group the task is pinned to (distributed executor only).
    pub worker_group: Option<String>,
    /// Image for container execution; `DockerRequirement.dockerPull`
    /// wins over the hint's `docker_image`.
    pub docker_image: Option<String>,
    /// Application id for the remote-service executor.
    pub bvbrc_app_id: Option<String>,
    /// Whether the tool carries a DockerRequirement at all.
    pub wants_container: bool,
}

impl TaskHints {
    /// Merge hints for one step: the step-level hint overrides the
    /// tool-level one field by field, and the tool's DockerRequirement
    /// supplies the image.
    pub fn for_step(tool: &CommandLineTool, step_hints: &Requirements) -> Self {
        let tool_hint: EngineHint = tool.hints.get(ENGINE_HINT_CLASS).unwrap_or_default();
        let step_hint: EngineHint = step_hints.get(ENGINE_HINT_CLASS).unwrap_or_default();
        let docker = tool.docker_requirement();
        TaskHints {
            executor: step_hint.executor.or(tool_hint.executor),
            worker_group: step_hint.worker_group.or(tool_hint.worker_group),
            docker_image: docker
                .as_ref()
                .and_then(|d| d.docker_pull.clone())
                .or(step_hint.docker_image)
                .or(tool_hint.docker_image),
            bvbrc_app_id: step_hint.bvbrc_app_id.or(tool_hint.bvbrc_app_id),
            wants_container: docker.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_hint_overrides_tool_hint() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "echo",
            "hints": [{"class": "goweHint", "executor": "local", "worker_group": "gpu"}],
        }))
        .unwrap();
        let step_hints: Requirements =
            serde_json::from_value(json!([{"class": "goweHint", "executor": "worker"}])).unwrap();

        let hints = TaskHints::for_step(&tool, &step_hints);
        assert_eq!(hints.executor.as_deref(), Some("worker"));
        assert_eq!(hints.worker_group.as_deref(), Some("gpu"));
        assert!(!hints.wants_container);
    }

    #[test]
    fn docker_pull_wins_over_hint_image() {
        let tool: CommandLineTool = serde_json::from_value(json!({
            "baseCommand": "echo",
            "requirements": [{"class": "DockerRequirement", "dockerPull": "alpine:3"}],
            "hints": [{"class": "goweHint", "docker_image": "ubuntu:24.04"}],
        }))
        .unwrap();
        let hints = TaskHints::for_step(&tool, &Requirements::new());
        assert_eq!(hints.docker_image.as_deref(), Some("alpine:3"));
        assert!(hints.wants_container);
    }
}

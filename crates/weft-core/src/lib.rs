//! Core domain types and traits for the weft workflow engine.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - The typed CWL value model and the parsed document model
//! - Workflow, submission, and task entities with their state machines
//! - The `Executor` and `Store` traits the scheduler is wired against

pub mod document;
pub mod error;
pub mod executor;
pub mod hints;
pub mod id;
pub mod store;
pub mod submission;
pub mod task;
pub mod value;
pub mod workflow;

pub use error::{Error, ExecError, ExecErrorKind, Result, RpcError};
pub use executor::{DispatchMode, Executor, RunContext, RunOutcome};
pub use hints::{EngineHint, TaskHints, ENGINE_HINT_CLASS};
pub use id::ResourceId;
pub use store::{Store, WorkerRecord};
pub use submission::{Submission, SubmissionError, SubmissionState};
pub use task::{Task, TaskCompletion, TaskError, TaskState, TaskUpdate};
pub use value::{CwlValue, DirectoryValue, FileValue};
pub use workflow::{split_source, Step, StepRun, Workflow, WorkflowGraph, WorkflowOutput};

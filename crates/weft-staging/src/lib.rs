//! Work-directory staging for the weft workflow engine.
//!
//! Three concerns live here:
//! - materializing CWL file literals onto disk ([`literal`])
//! - resolving `InitialWorkDirRequirement` listings into a prepared
//!   work directory ([`iwd`])
//! - rewriting input paths before and after staging ([`paths`])
//!
//! Expression evaluation is an external collaborator behind the
//! [`expr::Evaluator`] trait.

pub mod expr;
pub mod iwd;
pub mod literal;
pub mod paths;

pub use expr::{EvalContext, Evaluator, PropertyEvaluator};
pub use iwd::{stage_initial_work_dir, ContainerMount, StageOptions, StageResult};
pub use literal::{
    materialize_file, materialize_file_in, materialize_in_dir, materialize_recursive,
};
pub use paths::{resolve_object_paths, update_input_paths};

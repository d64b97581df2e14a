//! Task module - tasks, their lifecycle, and their results.
//!
//! - `Task` moves `Pending -> Running -> {Passed | Failed}` and never backward
//! - `TaskResult` is the single canonical outcome shape, whatever produced it
//! - `loader` reads task lists from JSON or YAML files

pub mod loader;
pub mod result;
pub mod task;

pub use loader::{build_tasks, load_tasks, TaskSpec};
pub use result::{
    Confidence, Coverage, CoverageBreakdown, FailureDetail, ResultArtifact, ResultSource,
    TaskResult, TestCase,
};
pub use task::{Task, TaskError, TaskId, TaskStatus};

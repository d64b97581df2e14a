//! Orchestration of task batches.
//!
//! - `scheduler`: waves of at most K concurrent tasks, failure isolation
//! - `resolver`: canonical result from artifacts or the transcript
//! - `session`: dedupe scope and side-effect broadcast for one run

pub mod resolver;
pub mod scheduler;
pub mod session;

pub use resolver::{parse_transcript, ArtifactError, ResultResolver};
pub use scheduler::{BatchReport, BatchScheduler, RunContext, TaskRunner};
pub use session::OrchestrationSession;

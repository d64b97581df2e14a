//! # agentwave
//!
//! Runs batches of tasks through an external CLI coding agent, one process
//! per task, in waves of bounded concurrency.
//!
//! ## Architecture
//!
//! ```text
//!   BatchScheduler ── wave of ≤ K tasks ──► TaskRunner (ClaudeCodeRunner)
//!                                                 │
//!                                                 ▼
//!                                        ProcessSupervisor
//!                                   (env policy, stdin, deadline)
//!                                      │                  │
//!                                   stdout             stderr
//!                                      ▼                  ▼
//!                               StdoutDecoder      StderrDecoder
//!                                      └───────┬──────────┘
//!                                              ▼
//!                                        EventChannel ──► consumer
//!                                              │
//!                                   on exit: ResultResolver
//!                                  (task artifact → legacy → transcript)
//! ```
//!
//! ## Modules
//! - `task`: tasks, their lifecycle and the canonical result
//! - `backend`: process supervision, stream decoding, the Claude CLI runner
//! - `orchestrator`: wave scheduling, result resolution, session state
//! - `config`: environment-driven configuration

pub mod backend;
pub mod config;
pub mod orchestrator;
pub mod task;
pub mod util;

pub use config::Config;

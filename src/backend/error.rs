//! Failure taxonomy for supervised agent processes.
//!
//! Every variant is turned into a terminal [`AgentMessage`](super::events::AgentMessage)
//! and a failed task result; none of them crosses a task boundary.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessError {
    /// Binary missing or the OS refused to start it.
    #[error("Failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    /// Deadline elapsed and the process was killed.
    #[error("Process timed out after {}s and was killed", .0.as_secs_f64())]
    Timeout(Duration),

    /// Process exited unsuccessfully.
    #[error("Process exited with {}: {stderr_excerpt}", describe_code(.code))]
    NonZeroExit {
        code: Option<i32>,
        stderr_excerpt: String,
    },

    /// Caller interrupted the process.
    #[error("Process was cancelled")]
    Cancelled,

    /// Could not stage or deliver the stdin payload.
    #[error("Failed to deliver stdin payload: {0}")]
    Stdin(String),

    #[error("Failed to wait for process: {0}")]
    Wait(String),
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout(_))
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_nonzero_exit() {
        let timeout = ProcessError::Timeout(Duration::from_secs(5));
        let exit = ProcessError::NonZeroExit {
            code: Some(1),
            stderr_excerpt: "boom".to_string(),
        };
        assert!(timeout.is_timeout());
        assert!(!exit.is_timeout());
        assert_eq!(timeout.to_string(), "Process timed out after 5s and was killed");
        assert_eq!(exit.to_string(), "Process exited with status 1: boom");
    }

    #[test]
    fn signal_exit_has_no_code() {
        let exit = ProcessError::NonZeroExit {
            code: None,
            stderr_excerpt: String::new(),
        };
        assert!(exit.to_string().contains("terminated by signal"));
    }
}

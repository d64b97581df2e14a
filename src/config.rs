//! Configuration management for agentwave.
//!
//! Configuration can be set via environment variables:
//! - `AGENTWAVE_CLI_PATH` - Optional. Agent CLI binary. Defaults to `claude`.
//! - `AGENTWAVE_MODEL` - Optional. Model identifier passed to the CLI. Defaults to `sonnet`.
//! - `AGENTWAVE_MAX_TURNS` - Optional. Maximum agent turns per task. Defaults to `50`.
//! - `AGENTWAVE_CONCURRENCY` - Optional. Wave size (tasks run in parallel). Defaults to `4`.
//! - `AGENTWAVE_TIMEOUT_SECS` - Optional. Per-process deadline. Defaults to `1800`.
//! - `AGENTWAVE_WORKING_DIR` - Optional. Shared task working directory. Defaults to current directory.
//! - `AGENTWAVE_NONZERO_EXIT` - Optional. `fail` or `degraded`. Defaults to `fail`.
//! - `AGENTWAVE_INLINE_STDIN_LIMIT` - Optional. Bytes above which stdin is staged in a temp file.
//! - `AGENTWAVE_QUEUE_WARN` - Optional. Event queue depth that triggers a warning.
//! - `AGENTWAVE_RESULTS_DIR` - Optional. Per-task result artifact directory.
//! - `AGENTWAVE_LEGACY_RESULT` - Optional. Shared legacy result artifact.
//! - `AGENTWAVE_SKIP_PERMISSIONS` - Optional. Pass the CLI's permission-skip flag.
//! - `AGENTWAVE_MANIFEST_PATTERN` - Optional. Regex matching manifest file paths.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::backend::supervisor::NonZeroExitPolicy;
use crate::util::parse_bool;

pub const DEFAULT_MANIFEST_PATTERN: &str = r"(^|/)(tasks|subtasks|todo)(\.[\w-]+)?\.json$";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How the agent CLI is invoked.
#[derive(Debug, Clone)]
pub struct AgentCliConfig {
    /// Path or name of the agent binary
    pub cli_path: String,

    /// Model identifier
    pub model: String,

    /// Maximum number of agent turns
    pub max_turns: u32,

    /// Pass `--dangerously-skip-permissions` (refused by the CLI when running as root)
    pub skip_permissions: bool,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            model: "sonnet".to_string(),
            max_turns: 50,
            skip_permissions: false,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent CLI invocation settings
    pub agent: AgentCliConfig,

    /// Maximum tasks per wave
    pub concurrency: usize,

    /// Per-process deadline
    pub timeout: Duration,

    /// Working directory shared by every task in a wave
    pub working_dir: PathBuf,

    /// Treatment of nonzero exits that still produced stdout
    pub nonzero_exit_policy: NonZeroExitPolicy,

    /// Stdin payloads larger than this are staged in a temp file
    pub inline_stdin_limit: usize,

    /// Queue depth at which the event channel logs a warning
    pub queue_warn_threshold: usize,

    /// Per-task artifact directory, relative to `working_dir`
    pub results_dir: PathBuf,

    /// Shared legacy artifact, relative to `working_dir`
    pub legacy_result_path: PathBuf,

    /// Matches file paths whose writes carry a sub-task manifest
    pub manifest_pattern: Regex,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when a value fails to parse or is out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AgentCliConfig::default();

        let agent = AgentCliConfig {
            cli_path: lookup("AGENTWAVE_CLI_PATH").unwrap_or(defaults.cli_path),
            model: lookup("AGENTWAVE_MODEL").unwrap_or(defaults.model),
            max_turns: parse_number(&lookup, "AGENTWAVE_MAX_TURNS", defaults.max_turns)?,
            skip_permissions: parse_bool(lookup("AGENTWAVE_SKIP_PERMISSIONS").as_deref(), false),
        };

        let concurrency: usize = parse_number(&lookup, "AGENTWAVE_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "AGENTWAVE_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let timeout_secs: u64 = parse_number(&lookup, "AGENTWAVE_TIMEOUT_SECS", 1800)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "AGENTWAVE_TIMEOUT_SECS".to_string(),
                "must be greater than 0".to_string(),
            ));
        }

        let working_dir = lookup("AGENTWAVE_WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let nonzero_exit_policy = match lookup("AGENTWAVE_NONZERO_EXIT") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::InvalidValue("AGENTWAVE_NONZERO_EXIT".to_string(), e))?,
            None => NonZeroExitPolicy::default(),
        };

        let manifest_source = lookup("AGENTWAVE_MANIFEST_PATTERN")
            .unwrap_or_else(|| DEFAULT_MANIFEST_PATTERN.to_string());
        let manifest_pattern = Regex::new(&manifest_source).map_err(|e| {
            ConfigError::InvalidValue("AGENTWAVE_MANIFEST_PATTERN".to_string(), e.to_string())
        })?;

        Ok(Self {
            agent,
            concurrency,
            timeout: Duration::from_secs(timeout_secs),
            working_dir,
            nonzero_exit_policy,
            inline_stdin_limit: parse_number(&lookup, "AGENTWAVE_INLINE_STDIN_LIMIT", 64 * 1024)?,
            queue_warn_threshold: parse_number(&lookup, "AGENTWAVE_QUEUE_WARN", 10_000)?,
            results_dir: lookup("AGENTWAVE_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".agentwave/results")),
            legacy_result_path: lookup("AGENTWAVE_LEGACY_RESULT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("test-results.json")),
            manifest_pattern,
        })
    }

    /// Create a config rooted at `working_dir` with default values (useful for testing).
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            agent: AgentCliConfig::default(),
            concurrency: 4,
            timeout: Duration::from_secs(1800),
            working_dir,
            nonzero_exit_policy: NonZeroExitPolicy::default(),
            inline_stdin_limit: 64 * 1024,
            queue_warn_threshold: 10_000,
            results_dir: PathBuf::from(".agentwave/results"),
            legacy_result_path: PathBuf::from("test-results.json"),
            manifest_pattern: default_manifest_pattern(),
        }
    }
}

/// The built-in manifest file pattern.
pub fn default_manifest_pattern() -> Regex {
    Regex::new(DEFAULT_MANIFEST_PATTERN).unwrap_or_else(|_| unreachable!("constant pattern is valid"))
}

fn parse_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

//! Resolution of a finished task's canonical [`TaskResult`].
//!
//! Sources are consulted in order of trust:
//! 1. the task-scoped artifact `<working_dir>/<results_dir>/<task-id>.json`
//! 2. the shared legacy artifact, unless it names a different task
//! 3. test counts and coverage pattern-matched out of the transcript
//!
//! Concurrent tasks share the working directory; the per-task file name is the
//! only thing keeping their artifacts apart.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::backend::error::ProcessError;
use crate::backend::supervisor::ProcessOutput;
use crate::config::Config;
use crate::task::{Coverage, ResultArtifact, ResultSource, Task, TaskId, TaskResult};
use crate::util::{tail_chars, truncate_chars};

const SUMMARY_CHARS: usize = 500;
const EXCERPT_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to access artifact {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed artifact {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Locates and reads result artifacts for tasks sharing one working directory.
#[derive(Debug, Clone)]
pub struct ResultResolver {
    working_dir: PathBuf,
    results_dir: PathBuf,
    legacy_path: PathBuf,
}

impl ResultResolver {
    /// `results_dir` and `legacy_path` are relative to `working_dir` unless absolute.
    pub fn new(
        working_dir: impl Into<PathBuf>,
        results_dir: impl AsRef<Path>,
        legacy_path: impl AsRef<Path>,
    ) -> Self {
        let working_dir = working_dir.into();
        Self {
            results_dir: working_dir.join(results_dir),
            legacy_path: working_dir.join(legacy_path),
            working_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.working_dir.clone(),
            &config.results_dir,
            &config.legacy_result_path,
        )
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Deterministic artifact path for `id`.
    pub fn artifact_path(&self, id: &TaskId) -> PathBuf {
        self.results_dir.join(format!("{}.json", id.file_stem()))
    }

    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    /// Make sure the results directory exists and no artifact from an earlier run is left behind.
    pub async fn prepare(&self, id: &TaskId) -> Result<PathBuf, ArtifactError> {
        tokio::fs::create_dir_all(&self.results_dir)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.results_dir.clone(),
                source,
            })?;

        let path = self.artifact_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(task_id = %id, path = %path.display(), "Removed stale result artifact");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ArtifactError::Io { path, source });
            }
        }
        Ok(path)
    }

    /// Produce the canonical result for `task` from its process output.
    pub async fn resolve(&self, task: &Task, output: &ProcessOutput) -> TaskResult {
        let result = self.resolve_inner(task, output).await;
        finalize(result, output)
    }

    async fn resolve_inner(&self, task: &Task, output: &ProcessOutput) -> TaskResult {
        // The process never ran to a natural end; nothing it wrote can be trusted.
        if let Some(error) = output.error.as_ref().filter(|e| !matches!(e, ProcessError::NonZeroExit { .. })) {
            return TaskResult::failure(error.to_string(), Some(process_excerpt(output)));
        }

        let primary = self.artifact_path(task.id());
        match read_artifact(&primary).await {
            Ok(Some(artifact)) => match artifact.task_id.as_deref() {
                Some(owner) if owner != task.id().as_str() => {
                    warn!(
                        task_id = %task.id(),
                        owner = %owner,
                        path = %primary.display(),
                        "Task artifact names another task; ignoring"
                    );
                }
                _ => {
                    debug!(task_id = %task.id(), path = %primary.display(), "Resolved from task artifact");
                    return artifact.into_result(ResultSource::TaskArtifact);
                }
            },
            Ok(None) => {}
            Err(e) => warn!(task_id = %task.id(), error = %e, "Ignoring unreadable task artifact"),
        }

        match read_artifact(&self.legacy_path).await {
            Ok(Some(artifact)) => match artifact.task_id.as_deref() {
                Some(owner) if owner != task.id().as_str() => {
                    warn!(
                        task_id = %task.id(),
                        owner = %owner,
                        path = %self.legacy_path.display(),
                        "Legacy artifact belongs to another task; ignoring"
                    );
                }
                _ => {
                    debug!(task_id = %task.id(), "Resolved from legacy artifact");
                    return artifact.into_result(ResultSource::LegacyArtifact);
                }
            },
            Ok(None) => {}
            Err(e) => warn!(task_id = %task.id(), error = %e, "Ignoring unreadable legacy artifact"),
        }

        let text = if output.stderr_excerpt.is_empty() {
            output.transcript.clone()
        } else {
            format!("{}\n{}", output.transcript, output.stderr_excerpt)
        };
        match parse_transcript(&text) {
            Some(mut result) => {
                debug!(
                    task_id = %task.id(),
                    passed = result.passed,
                    failed = result.failed,
                    "Resolved heuristically from transcript"
                );
                result.pass = result.pass && output.succeeded();
                result.summary = summary_of(output);
                result
            }
            None => TaskResult {
                pass: output.succeeded(),
                summary: summary_of(output),
                ..TaskResult::failure(String::new(), None)
            }
            .with_source(ResultSource::Transcript),
        }
    }
}

/// Fill in what the chosen source left out.
fn finalize(mut result: TaskResult, output: &ProcessOutput) -> TaskResult {
    if result.duration_ms == 0 {
        result.duration_ms = output.duration.as_millis() as u64;
    }
    if !result.pass && result.error_excerpt.is_none() {
        let excerpt = process_excerpt(output);
        if !excerpt.is_empty() {
            result.error_excerpt = Some(excerpt);
        }
    }
    result
}

fn summary_of(output: &ProcessOutput) -> String {
    truncate_chars(output.terminal.content().trim(), SUMMARY_CHARS)
}

fn process_excerpt(output: &ProcessOutput) -> String {
    match &output.error {
        Some(error) => error.to_string(),
        None => tail_chars(&output.stderr_excerpt, EXCERPT_CHARS),
    }
}

async fn read_artifact(path: &Path) -> Result<Option<ResultArtifact>, ArtifactError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| ArtifactError::Json {
            path: path.to_path_buf(),
            source,
        })
}

struct TranscriptPatterns {
    passed: Regex,
    failed: Regex,
    skipped: Regex,
    total: Regex,
    coverage: Regex,
}

fn builtin(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| unreachable!("built-in pattern {pattern} is invalid: {e}"))
}

static PATTERNS: LazyLock<TranscriptPatterns> = LazyLock::new(|| TranscriptPatterns {
    passed: builtin(r"(?i)\b(\d+)\s+(?:tests?\s+)?pass(?:ed|ing)\b"),
    failed: builtin(r"(?i)\b(\d+)\s+(?:tests?\s+)?fail(?:ed|ing|ures?)\b"),
    skipped: builtin(r"(?i)\b(\d+)\s+(?:tests?\s+)?(?:skipped|pending|ignored|todo)\b"),
    total: builtin(r"(?i)\b(\d+)\s+total\b"),
    coverage: builtin(r"(?i)(?:coverage|all files)[^\d\n]{0,40}?(\d{1,3}(?:\.\d+)?)\s*%"),
});

/// Last match of `re` in `text`, parsed as a number.
fn last_number<T: std::str::FromStr>(re: &Regex, text: &str) -> Option<T> {
    re.captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Pattern-match test counts and coverage out of free text.
///
/// Returns `None` unless a passed or failed count is found. When a figure is
/// reported several times (watch mode, retries) the last one wins.
pub fn parse_transcript(text: &str) -> Option<TaskResult> {
    let patterns = &*PATTERNS;
    let passed: Option<u32> = last_number(&patterns.passed, text);
    let failed: Option<u32> = last_number(&patterns.failed, text);
    if passed.is_none() && failed.is_none() {
        return None;
    }

    let passed = passed.unwrap_or(0);
    let failed = failed.unwrap_or(0);
    let skipped = last_number(&patterns.skipped, text).unwrap_or(0);
    let counted = passed.saturating_add(failed).saturating_add(skipped);
    let total = last_number::<u32>(&patterns.total, text)
        .filter(|total| *total >= counted)
        .unwrap_or(counted);
    let coverage = last_number::<f64>(&patterns.coverage, text).map(|percent| Coverage {
        percent: Some(percent),
        breakdown: None,
    });

    Some(TaskResult {
        pass: failed == 0 && passed > 0,
        total,
        passed,
        failed,
        skipped,
        coverage,
        ..TaskResult::failure(String::new(), None)
    }
    .with_source(ResultSource::Transcript))
}

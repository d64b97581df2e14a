//! Spawning and supervision of agent processes.
//!
//! One [`ProcessSupervisor::spawn`] call owns one OS process from start to
//! reap. The supervisor:
//! - builds the child environment from an [`EnvPolicy`]
//! - delivers the prompt over stdin, staging large payloads in a temp file
//! - runs one reader task per output stream, feeding a [`StreamEventDecoder`]
//! - enforces the deadline with a hard kill of the whole process group
//! - classifies the exit and sends exactly one terminal message
//!
//! Every failure, including a failed spawn, is reported through the returned
//! [`ProcessHandle`] rather than as an `Err`, so callers have a single path.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::channel::{event_channel, EventChannel, EventSender};
use super::decoder::{StderrDecoder, StdoutDecoder, StreamEventDecoder};
use super::env_policy::EnvPolicy;
use super::error::ProcessError;
use super::events::AgentMessage;
use crate::config::Config;
use crate::util::tail_chars;

/// Upper bound on the transcript kept for result resolution.
const TRANSCRIPT_LIMIT: usize = 512 * 1024;
/// Characters of stderr kept in error messages.
const STDERR_EXCERPT_CHARS: usize = 2000;
const READ_CHUNK: usize = 8 * 1024;

/// What a nonzero exit means when the process still wrote to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NonZeroExitPolicy {
    /// Any nonzero exit is a failure.
    #[default]
    Fail,
    /// A nonzero exit with non-empty stdout completes as degraded.
    DegradedSuccess,
}

impl FromStr for NonZeroExitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" | "failure" => Ok(Self::Fail),
            "degraded" | "degraded_success" | "degraded-success" => Ok(Self::DegradedSuccess),
            other => Err(format!(
                "unknown nonzero exit policy '{}' (expected 'fail' or 'degraded')",
                other
            )),
        }
    }
}

impl fmt::Display for NonZeroExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::DegradedSuccess => write!(f, "degraded"),
        }
    }
}

/// Everything needed to start one agent process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Base environment before policy filtering. `None` inherits the current process environment.
    pub env: Option<BTreeMap<String, String>>,
    /// Set after the policy is applied; these always reach the child.
    pub vars: BTreeMap<String, String>,
    pub stdin_payload: Option<String>,
    pub timeout: Duration,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: None,
            vars: BTreeMap::new(),
            stdin_payload: None,
            timeout,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin(mut self, payload: impl Into<String>) -> Self {
        self.stdin_payload = Some(payload.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

/// Final account of a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub pid: Option<u32>,
    /// `None` when killed by a signal or never started.
    pub exit_code: Option<i32>,
    /// Why the run failed; `None` for success and degraded success.
    pub error: Option<ProcessError>,
    /// The terminal message delivered on the channel.
    pub terminal: AgentMessage,
    /// Nonzero exit accepted under [`NonZeroExitPolicy::DegradedSuccess`].
    pub degraded: bool,
    /// Text, tool results and the final result text from stdout, newest kept.
    pub transcript: String,
    pub stderr_excerpt: String,
    pub stdout_bytes: usize,
    pub duration: Duration,
}

impl ProcessOutput {
    fn not_started(error: ProcessError) -> Self {
        Self {
            pid: None,
            exit_code: None,
            terminal: AgentMessage::error(error.to_string()),
            error: Some(error),
            degraded: false,
            transcript: String::new(),
            stderr_excerpt: String::new(),
            stdout_bytes: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && matches!(self.terminal, AgentMessage::Complete { .. })
    }
}

/// A running (or already failed) agent process.
///
/// Messages are pulled with [`next`](Self::next); the final outcome comes from [`wait`](Self::wait).
pub struct ProcessHandle {
    pid: Option<u32>,
    env: BTreeMap<String, String>,
    spawned_at: DateTime<Utc>,
    deadline: Instant,
    stdin_file: Option<PathBuf>,
    events: EventChannel,
    outcome: JoinHandle<ProcessOutput>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The sanitized environment the process was started with.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Temp file the stdin payload was staged in, if any. Removed once the process closes.
    pub fn stdin_file(&self) -> Option<&Path> {
        self.stdin_file.as_deref()
    }

    /// Next decoded message; `None` after the terminal message.
    pub async fn next(&mut self) -> Option<AgentMessage> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> &mut EventChannel {
        &mut self.events
    }

    /// Kill the process. A terminal `error` message follows.
    pub fn cancel(&self) {
        self.events.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.events.cancellation_token()
    }

    /// Wait for the process to be reaped and classified.
    ///
    /// Unread messages are discarded.
    pub async fn wait(self) -> ProcessOutput {
        match self.outcome.await {
            Ok(output) => output,
            Err(e) => ProcessOutput::not_started(ProcessError::Wait(e.to_string())),
        }
    }
}

/// Shared state the reader tasks fill in. Survives reader abort.
#[derive(Debug, Default)]
struct Capture {
    transcript: String,
    stdout_bytes: usize,
    stdout_messages: usize,
    /// Terminal message decoded from stdout, held back until exit.
    reported: Option<AgentMessage>,
    stderr_failure: Option<String>,
    stderr_excerpt: String,
}

impl Capture {
    fn append_transcript(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.transcript.is_empty() {
            self.transcript.push('\n');
        }
        self.transcript.push_str(text);

        if self.transcript.len() > TRANSCRIPT_LIMIT * 2 {
            let mut cut = self.transcript.len() - TRANSCRIPT_LIMIT;
            while !self.transcript.is_char_boundary(cut) {
                cut += 1;
            }
            self.transcript.drain(..cut);
        }
    }
}

type SharedCapture = Arc<Mutex<Capture>>;

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns agent processes under a fixed policy.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    env_policy: EnvPolicy,
    nonzero_exit_policy: NonZeroExitPolicy,
    inline_stdin_limit: usize,
    queue_warn: usize,
    reader_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            env_policy: EnvPolicy::default(),
            nonzero_exit_policy: NonZeroExitPolicy::default(),
            inline_stdin_limit: 64 * 1024,
            queue_warn: 10_000,
            reader_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessSupervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            nonzero_exit_policy: config.nonzero_exit_policy,
            inline_stdin_limit: config.inline_stdin_limit,
            queue_warn: config.queue_warn_threshold,
            ..Self::default()
        }
    }

    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }

    pub fn with_nonzero_exit_policy(mut self, policy: NonZeroExitPolicy) -> Self {
        self.nonzero_exit_policy = policy;
        self
    }

    pub fn with_inline_stdin_limit(mut self, limit: usize) -> Self {
        self.inline_stdin_limit = limit;
        self
    }

    pub fn with_reader_grace(mut self, grace: Duration) -> Self {
        self.reader_grace = grace;
        self
    }

    pub fn env_policy(&self) -> &EnvPolicy {
        &self.env_policy
    }

    /// Start a process and begin supervising it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(&self, request: SpawnRequest, decoder: StreamEventDecoder) -> ProcessHandle {
        let spawned_at = Utc::now();
        let started = Instant::now();
        let deadline = started + request.timeout;

        let mut env = match &request.env {
            Some(base) => self.env_policy.apply(base.clone()),
            None => self.env_policy.apply_to_current(),
        };
        env.extend(request.vars.clone());

        let (tx, events) = event_channel(self.queue_warn);
        let cancel = events.cancellation_token();

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        // Small payloads go through a pipe; large ones are staged in a temp
        // file so they never hit pipe-buffer or argv limits.
        let mut inline_payload = None;
        let mut staged = None;
        match request.stdin_payload {
            None => {
                cmd.stdin(Stdio::null());
            }
            Some(payload) if payload.len() > self.inline_stdin_limit => {
                match stage_stdin(&payload) {
                    Ok((file, stdio)) => {
                        debug!(path = %file.path().display(), bytes = payload.len(), "Staged stdin payload");
                        cmd.stdin(stdio);
                        staged = Some(file);
                    }
                    Err(e) => {
                        return Self::failed(tx, events, env, spawned_at, deadline, ProcessError::Stdin(e.to_string()));
                    }
                }
            }
            Some(payload) => {
                cmd.stdin(Stdio::piped());
                inline_payload = Some(payload);
            }
        }
        let stdin_file = staged.as_ref().map(|file| file.path().to_path_buf());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %request.command, error = %e, "Failed to spawn agent process");
                let error = ProcessError::Spawn {
                    command: request.command.clone(),
                    message: e.to_string(),
                };
                // Dropping `staged` removes the temp file.
                return Self::failed(tx, events, env, spawned_at, deadline, error);
            }
        };

        let pid = child.id();
        info!(
            command = %request.command,
            pid = ?pid,
            working_dir = %request.working_dir.display(),
            timeout_secs = request.timeout.as_secs(),
            "Spawned agent process"
        );

        if let (Some(payload), Some(mut stdin)) = (inline_payload, child.stdin.take()) {
            tokio::spawn(async move {
                // The CLI reads the prompt until EOF, so stdin is closed afterwards.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "Failed to write agent stdin");
                } else if let Err(e) = stdin.shutdown().await {
                    debug!(error = %e, "Failed to close agent stdin");
                }
            });
        }

        let capture = SharedCapture::default();
        let (stdout_decoder, stderr_decoder) = decoder.into_parts();
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(read_stdout(stdout, stdout_decoder, tx.clone(), Arc::clone(&capture)))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(read_stderr(stderr, stderr_decoder, tx.clone(), Arc::clone(&capture)))
        });

        let pump = Pump {
            timeout: request.timeout,
            deadline,
            started,
            pid,
            nonzero_exit_policy: self.nonzero_exit_policy,
            reader_grace: self.reader_grace,
        };
        let span = tracing::info_span!("agent_process", pid = ?pid);
        let outcome = tokio::spawn(
            pump.run(child, stdout_task, stderr_task, staged, tx, cancel, capture)
                .instrument(span),
        );

        ProcessHandle {
            pid,
            env,
            spawned_at,
            deadline,
            stdin_file,
            events,
            outcome,
        }
    }

    fn failed(
        tx: EventSender,
        events: EventChannel,
        env: BTreeMap<String, String>,
        spawned_at: DateTime<Utc>,
        deadline: Instant,
        error: ProcessError,
    ) -> ProcessHandle {
        let output = ProcessOutput::not_started(error);
        tx.send(output.terminal.clone());
        ProcessHandle {
            pid: None,
            env,
            spawned_at,
            deadline,
            stdin_file: None,
            events,
            outcome: tokio::spawn(async move { output }),
        }
    }
}

fn stage_stdin(payload: &str) -> std::io::Result<(NamedTempFile, Stdio)> {
    let mut file = tempfile::Builder::new().prefix("agentwave-stdin-").tempfile()?;
    file.write_all(payload.as_bytes())?;
    file.flush()?;
    let reader = file.reopen()?;
    Ok((file, Stdio::from(reader)))
}

/// Hard-kill the process and everything it started.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group; a negative pid signals the whole group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "start_kill failed (process may already be gone)");
    }
}

struct Pump {
    timeout: Duration,
    deadline: Instant,
    started: Instant,
    pid: Option<u32>,
    nonzero_exit_policy: NonZeroExitPolicy,
    reader_grace: Duration,
}

impl Pump {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        self,
        mut child: Child,
        stdout_task: Option<JoinHandle<()>>,
        stderr_task: Option<JoinHandle<()>>,
        staged_stdin: Option<NamedTempFile>,
        tx: EventSender,
        cancel: CancellationToken,
        capture: SharedCapture,
    ) -> ProcessOutput {
        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status),
            _ = tokio::time::sleep_until(self.deadline) => Stop::TimedOut,
            _ = cancel.cancelled() => Stop::Cancelled,
        };

        if matches!(stop, Stop::TimedOut | Stop::Cancelled) {
            kill_tree(&mut child);
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap killed agent process");
            }
        }

        // Readers drain what is left in the pipes. A grandchild that inherited
        // them can keep them open indefinitely, hence the bounded wait.
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            self.join_reader(task).await;
        }

        if let Some(file) = staged_stdin {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove staged stdin file");
            }
        }

        let capture = std::mem::take(&mut *capture.lock().unwrap_or_else(|e| e.into_inner()));
        let output = self.classify(stop, capture, &tx);
        tx.send(output.terminal.clone());

        info!(
            exit_code = ?output.exit_code,
            degraded = output.degraded,
            error = ?output.error.as_ref().map(ToString::to_string),
            duration_ms = output.duration.as_millis() as u64,
            "Agent process finished"
        );
        output
    }

    async fn join_reader(&self, mut task: JoinHandle<()>) {
        match tokio::time::timeout(self.reader_grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Stream reader task failed"),
            Err(_) => {
                warn!(
                    grace_ms = self.reader_grace.as_millis() as u64,
                    "Stream reader still blocked after exit; aborting"
                );
                task.abort();
            }
        }
    }

    fn classify(&self, stop: Stop, capture: Capture, tx: &EventSender) -> ProcessOutput {
        let mut exit_code = None;
        let mut degraded = false;

        let (error, terminal) = match stop {
            Stop::TimedOut => {
                let error = ProcessError::Timeout(self.timeout);
                (Some(error.clone()), AgentMessage::error(error.to_string()))
            }
            Stop::Cancelled => {
                let error = ProcessError::Cancelled;
                (Some(error.clone()), AgentMessage::error(error.to_string()))
            }
            Stop::Exited(Err(e)) => {
                let error = ProcessError::Wait(e.to_string());
                (Some(error.clone()), AgentMessage::error(error.to_string()))
            }
            Stop::Exited(Ok(status)) if status.success() => {
                exit_code = status.code();
                let terminal = capture
                    .reported
                    .clone()
                    .unwrap_or_else(|| AgentMessage::complete("Process exited successfully"));
                (None, terminal)
            }
            Stop::Exited(Ok(status)) => {
                exit_code = status.code();
                let has_output = capture.stdout_messages > 0;

                if has_output && self.nonzero_exit_policy == NonZeroExitPolicy::DegradedSuccess {
                    degraded = true;
                    tx.send(AgentMessage::system(format!(
                        "Process exited with status {} but produced output; accepting as degraded success",
                        exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                    )));
                    let content = match &capture.reported {
                        Some(AgentMessage::Complete { content, .. }) => content.clone(),
                        Some(other) => other.content(),
                        None => String::new(),
                    };
                    (None, AgentMessage::Complete { content, degraded: true })
                } else {
                    let excerpt = capture
                        .stderr_failure
                        .clone()
                        .or_else(|| match &capture.reported {
                            Some(AgentMessage::Error { message }) => Some(message.clone()),
                            _ => None,
                        })
                        .unwrap_or_else(|| tail_chars(&capture.stderr_excerpt, STDERR_EXCERPT_CHARS));
                    let error = ProcessError::NonZeroExit {
                        code: exit_code,
                        stderr_excerpt: excerpt,
                    };
                    (Some(error.clone()), AgentMessage::error(error.to_string()))
                }
            }
        };

        ProcessOutput {
            pid: self.pid,
            exit_code,
            error,
            terminal,
            degraded,
            transcript: capture.transcript,
            stderr_excerpt: capture.stderr_excerpt,
            stdout_bytes: capture.stdout_bytes,
            duration: self.started.elapsed(),
        }
    }
}

async fn read_stdout<R>(mut reader: R, mut decoder: StdoutDecoder, tx: EventSender, capture: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "stdout read failed");
                break;
            }
        };
        let messages = decoder.push(&buf[..n]);
        let mut cap = capture.lock().unwrap_or_else(|e| e.into_inner());
        cap.stdout_bytes += n;
        forward_stdout(messages, &tx, &mut cap);
    }

    let messages = decoder.finish();
    forward_stdout(messages, &tx, &mut capture.lock().unwrap_or_else(|e| e.into_inner()));
}

fn forward_stdout(messages: Vec<AgentMessage>, tx: &EventSender, cap: &mut Capture) {
    for message in messages {
        cap.stdout_messages += 1;
        match &message {
            AgentMessage::Text { .. }
            | AgentMessage::ToolResult { .. }
            | AgentMessage::Complete { .. }
            | AgentMessage::Error { .. } => cap.append_transcript(&message.content()),
            _ => {}
        }

        if message.is_terminal() {
            cap.reported = Some(message);
        } else {
            tx.send(message);
        }
    }
}

async fn read_stderr<R>(mut reader: R, mut decoder: StderrDecoder, tx: EventSender, capture: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "stderr read failed");
                break;
            }
        };
        let messages = decoder.push(&buf[..n]);
        forward_stderr(messages, &decoder, &tx, &capture);
    }

    let messages = decoder.finish();
    forward_stderr(messages, &decoder, &tx, &capture);
}

/// stderr failures are not terminal by themselves: the exit status decides.
/// They are surfaced as notices and remembered for the final error.
fn forward_stderr(messages: Vec<AgentMessage>, decoder: &StderrDecoder, tx: &EventSender, capture: &SharedCapture) {
    let mut cap = capture.lock().unwrap_or_else(|e| e.into_inner());
    cap.stderr_excerpt = decoder.excerpt();

    for message in messages {
        match message {
            AgentMessage::Error { message } => {
                if cap.stderr_failure.is_none() {
                    cap.stderr_failure = Some(message.clone());
                }
                tx.send(AgentMessage::system(format!("stderr: {}", message)));
            }
            other => {
                tx.send(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonzero_exit_policy_parses() {
        assert_eq!("fail".parse::<NonZeroExitPolicy>(), Ok(NonZeroExitPolicy::Fail));
        assert_eq!(
            "Degraded".parse::<NonZeroExitPolicy>(),
            Ok(NonZeroExitPolicy::DegradedSuccess)
        );
        assert!("maybe".parse::<NonZeroExitPolicy>().is_err());
        assert_eq!(NonZeroExitPolicy::default(), NonZeroExitPolicy::Fail);
    }

    #[tokio::test]
    async fn stdout_reader_joins_split_lines_and_holds_back_terminal() {
        let reader = tokio_test::io::Builder::new()
            .read(b"plain te")
            .read(b"xt\n{\"type\":\"result\",\"subtype\":\"success\",")
            .read(b"\"result\":\"Tests: 3 passed\",\"is_error\":false}\n")
            .build();
        let (tx, mut rx) = event_channel(0);
        let capture = SharedCapture::default();

        read_stdout(reader, StdoutDecoder::new(None), tx.clone(), Arc::clone(&capture)).await;
        drop(tx);

        assert_eq!(rx.recv().await, Some(AgentMessage::text("plain text")));
        // The result was held back, so the channel closes without a terminal.
        assert!(matches!(rx.recv().await, Some(AgentMessage::Error { .. })));

        let cap = capture.lock().unwrap();
        assert_eq!(cap.reported, Some(AgentMessage::complete("Tests: 3 passed")));
        assert_eq!(cap.stdout_messages, 2);
        assert!(cap.transcript.contains("plain text"));
        assert!(cap.transcript.contains("Tests: 3 passed"));
    }

    #[tokio::test]
    async fn stderr_reader_demotes_failures_to_notices() {
        let reader = tokio_test::io::Builder::new()
            .read(b"loading\nError: cannot find module\n")
            .read(b"rate limit hit")
            .build();
        let (tx, mut rx) = event_channel(0);
        let capture = SharedCapture::default();

        read_stderr(reader, StderrDecoder::new(), tx.clone(), Arc::clone(&capture)).await;
        assert!(!tx.terminal_sent());
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(AgentMessage::system("stderr: Error: cannot find module"))
        );
        assert_eq!(rx.recv().await, Some(AgentMessage::system("rate limit hit")));

        let cap = capture.lock().unwrap();
        assert_eq!(cap.stderr_failure.as_deref(), Some("Error: cannot find module"));
        assert!(cap.stderr_excerpt.starts_with("loading"));
    }

    #[test]
    fn transcript_is_bounded_to_the_newest_text() {
        let mut cap = Capture::default();
        let chunk = "é".repeat(TRANSCRIPT_LIMIT / 4);
        for _ in 0..12 {
            cap.append_transcript(&chunk);
        }
        cap.append_transcript("newest");
        assert!(cap.transcript.len() <= TRANSCRIPT_LIMIT * 2);
        assert!(cap.transcript.ends_with("newest"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::time::Duration;

        fn sh(script: &str, timeout: Duration) -> SpawnRequest {
            SpawnRequest::new("/bin/sh", std::env::temp_dir(), timeout).with_args(["-c", script])
        }

        async fn drain(handle: &mut ProcessHandle) -> Vec<AgentMessage> {
            let mut messages = Vec::new();
            while let Some(message) = handle.next().await {
                messages.push(message);
            }
            messages
        }

        fn supervisor() -> ProcessSupervisor {
            ProcessSupervisor::default().with_reader_grace(Duration::from_millis(500))
        }

        #[tokio::test]
        async fn successful_run_delivers_result_as_single_terminal() {
            let script = r#"printf '%s\n' 'working' '{"type":"result","subtype":"success","result":"all good","is_error":false}'"#;
            let mut handle = supervisor().spawn(sh(script, Duration::from_secs(10)), StreamEventDecoder::default());
            assert!(handle.pid().is_some());

            let messages = drain(&mut handle).await;
            assert_eq!(
                messages,
                vec![AgentMessage::text("working"), AgentMessage::complete("all good")]
            );

            let output = handle.wait().await;
            assert!(output.succeeded());
            assert_eq!(output.exit_code, Some(0));
        }

        #[tokio::test]
        async fn timeout_kills_and_reports_timeout() {
            let started = std::time::Instant::now();
            let mut handle = supervisor().spawn(
                sh("sleep 30", Duration::from_millis(200)),
                StreamEventDecoder::default(),
            );

            let messages = drain(&mut handle).await;
            assert_eq!(messages.len(), 1);
            assert!(messages[0].content().contains("timed out"));

            let output = handle.wait().await;
            assert!(output.error.as_ref().is_some_and(ProcessError::is_timeout));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn nonzero_exit_with_empty_stdout_fails_under_both_policies() {
            for policy in [NonZeroExitPolicy::Fail, NonZeroExitPolicy::DegradedSuccess] {
                let mut handle = supervisor()
                    .with_nonzero_exit_policy(policy)
                    .spawn(sh("echo boom >&2; exit 3", Duration::from_secs(10)), StreamEventDecoder::default());
                let messages = drain(&mut handle).await;
                let output = handle.wait().await;

                assert_eq!(output.exit_code, Some(3));
                assert_eq!(
                    output.error,
                    Some(ProcessError::NonZeroExit {
                        code: Some(3),
                        stderr_excerpt: "boom".to_string(),
                    })
                );
                assert_eq!(messages.last(), Some(&AgentMessage::error("Process exited with status 3: boom")));
            }
        }

        #[tokio::test]
        async fn nonzero_exit_with_stdout_follows_policy() {
            let script = "echo partial work; exit 2";

            let mut failing = supervisor().spawn(sh(script, Duration::from_secs(10)), StreamEventDecoder::default());
            drain(&mut failing).await;
            let output = failing.wait().await;
            assert!(!output.succeeded());
            assert!(!output.degraded);

            let mut lenient = supervisor()
                .with_nonzero_exit_policy(NonZeroExitPolicy::DegradedSuccess)
                .spawn(sh(script, Duration::from_secs(10)), StreamEventDecoder::default());
            let messages = drain(&mut lenient).await;
            let output = lenient.wait().await;

            assert!(output.degraded);
            assert!(output.error.is_none());
            assert!(matches!(
                messages.last(),
                Some(AgentMessage::Complete { degraded: true, .. })
            ));
            assert!(messages
                .iter()
                .any(|m| matches!(m, AgentMessage::System { content } if content.contains("degraded"))));
        }

        #[tokio::test]
        async fn large_stdin_is_staged_and_removed() {
            let mut handle = supervisor()
                .with_inline_stdin_limit(4)
                .spawn(
                    sh("cat", Duration::from_secs(10)).with_stdin("hello from a staged file\n"),
                    StreamEventDecoder::default(),
                );
            let staged = handle.stdin_file().map(Path::to_path_buf).expect("payload should be staged");

            let messages = drain(&mut handle).await;
            assert_eq!(messages[0], AgentMessage::text("hello from a staged file"));

            handle.wait().await;
            assert!(!staged.exists());
        }

        #[tokio::test]
        async fn small_stdin_is_piped_and_closed() {
            let mut handle = supervisor().spawn(
                sh("cat", Duration::from_secs(10)).with_stdin("inline prompt"),
                StreamEventDecoder::default(),
            );
            assert!(handle.stdin_file().is_none());

            let messages = drain(&mut handle).await;
            assert_eq!(messages[0], AgentMessage::text("inline prompt"));
            assert!(handle.wait().await.succeeded());
        }

        #[tokio::test]
        async fn cancel_kills_and_unblocks_consumer() {
            let mut handle = supervisor().spawn(sh("sleep 30", Duration::from_secs(60)), StreamEventDecoder::default());
            handle.cancel();

            let messages = tokio::time::timeout(Duration::from_secs(10), drain(&mut handle))
                .await
                .expect("cancel should unblock the consumer");
            assert_eq!(messages, vec![AgentMessage::error("Process was cancelled")]);
            assert_eq!(handle.wait().await.error, Some(ProcessError::Cancelled));
        }

        #[tokio::test]
        async fn missing_binary_is_a_terminal_spawn_error() {
            let request = SpawnRequest::new(
                "/nonexistent/agentwave-test-binary",
                std::env::temp_dir(),
                Duration::from_secs(5),
            );
            let mut handle = supervisor().spawn(request, StreamEventDecoder::default());
            assert!(handle.pid().is_none());

            let messages = drain(&mut handle).await;
            assert_eq!(messages.len(), 1);
            assert!(matches!(messages[0], AgentMessage::Error { .. }));
            assert!(matches!(handle.wait().await.error, Some(ProcessError::Spawn { .. })));
        }

        #[tokio::test]
        async fn child_sees_only_the_sanitized_environment() {
            let base = BTreeMap::from([
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("ANTHROPIC_API_KEY".to_string(), "sk-ant-api-secret".to_string()),
            ]);
            let request = sh(
                r#"echo "key=${ANTHROPIC_API_KEY:-unset} color=${NO_COLOR:-unset}""#,
                Duration::from_secs(10),
            )
            .with_env(base)
            .with_var("AGENTWAVE_TASK_ID", "t-env");
            let mut handle = supervisor().spawn(request, StreamEventDecoder::default());
            assert!(!handle.env().contains_key("ANTHROPIC_API_KEY"));
            assert_eq!(handle.env().get("AGENTWAVE_TASK_ID").map(String::as_str), Some("t-env"));

            let messages = drain(&mut handle).await;
            assert_eq!(messages[0], AgentMessage::text("key=unset color=1"));
        }
    }
}

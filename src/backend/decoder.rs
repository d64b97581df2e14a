//! Decoding of raw agent process output into [`AgentMessage`]s.
//!
//! stdout and stderr are decoded independently, each through its own
//! [`LineBuffer`]. A chunk may end mid-line; the partial tail is retained
//! and completed by the next chunk, so a line is never parsed twice or lost.
//!
//! stdout lines are NDJSON events from the CLI. A line that is not a
//! recognised event degrades to a `text` message. Tool calls that write,
//! edit or run something are also reported as [`SideEffect`]s; writes to a
//! manifest file additionally yield one [`SideEffect::ManifestEntry`] per
//! sub-entity, at most once per session (see [`DedupeState`]).
//!
//! stderr lines are classified: quota/rate-limit notices become `system`
//! messages, failure lines become `error` messages, the rest is kept only in
//! the recent-lines tail.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::events::{AgentMessage, ManifestEntry, SideEffect};
use super::wire::{CliEvent, ContentBlock};
use crate::util::contains_ascii_case_insensitive;

/// Number of stderr lines retained for error excerpts.
pub const STDERR_TAIL_LINES: usize = 40;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

// ── Line buffering ────────────────────────────────────────────────

/// Rolling byte buffer that yields complete newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
    /// Bytes of `buf` already known to contain no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the line terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            lines.push(Self::decode(&line[..line.len() - 1]));
        }
        self.scanned = self.buf.len();
        lines
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        self.scanned = 0;
        Some(Self::decode(&rest))
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn decode(bytes: &[u8]) -> String {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

// ── Session-scoped side channel ───────────────────────────────────

/// Sub-entity identifiers already reported in one orchestration session.
#[derive(Debug, Default)]
pub struct DedupeState {
    seen: HashSet<String>,
}

impl DedupeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`; returns `true` only the first time it is seen.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Where decoders publish side effects. Cloned into every decoder of a session.
#[derive(Debug, Clone)]
pub struct SideEffectSink {
    tx: broadcast::Sender<SideEffect>,
    dedupe: Arc<Mutex<DedupeState>>,
    manifest_pattern: Regex,
}

impl SideEffectSink {
    pub fn new(
        tx: broadcast::Sender<SideEffect>,
        dedupe: Arc<Mutex<DedupeState>>,
        manifest_pattern: Regex,
    ) -> Self {
        Self {
            tx,
            dedupe,
            manifest_pattern,
        }
    }

    pub fn is_manifest(&self, path: &str) -> bool {
        self.manifest_pattern.is_match(path)
    }

    fn emit(&self, effect: SideEffect) {
        // No subscribers is fine; observers are optional.
        let _ = self.tx.send(effect);
    }

    fn emit_manifest_entries(&self, manifest: &str, entries: Vec<ManifestEntry>) {
        for entry in entries {
            let fresh = self
                .dedupe
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .first_sighting(&entry.id);
            if fresh {
                debug!(manifest = %manifest, entry = %entry.id, "New manifest entry");
                self.emit(SideEffect::ManifestEntry {
                    manifest: manifest.to_string(),
                    entry,
                });
            } else {
                trace!(manifest = %manifest, entry = %entry.id, "Manifest entry already reported");
            }
        }
    }

    /// Report the side effects of one tool invocation.
    fn observe_tool_use(&self, name: &str, input: &Value) {
        match classify_tool(name) {
            Some(ToolKind::Write) => {
                let Some(path) = tool_path(input) else { return };
                self.emit(SideEffect::FileWrite {
                    path: path.to_string(),
                });
                if self.is_manifest(path) {
                    if let Some(content) = input.get("content").and_then(Value::as_str) {
                        self.emit_manifest_entries(path, parse_manifest(content));
                    }
                }
            }
            Some(ToolKind::Edit) => {
                if let Some(path) = tool_path(input) {
                    self.emit(SideEffect::FileEdit {
                        path: path.to_string(),
                    });
                }
            }
            Some(ToolKind::Command) => {
                if let Some(command) = tool_command(input) {
                    self.emit(SideEffect::Command { command });
                }
            }
            None => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolKind {
    Write,
    Edit,
    Command,
}

fn classify_tool(name: &str) -> Option<ToolKind> {
    match name.to_ascii_lowercase().as_str() {
        "write" | "write_file" | "create_file" => Some(ToolKind::Write),
        "edit" | "multiedit" | "edit_file" | "str_replace_editor" | "notebookedit" => {
            Some(ToolKind::Edit)
        }
        "bash" | "shell" | "run_command" | "exec" => Some(ToolKind::Command),
        _ => None,
    }
}

fn tool_path(input: &Value) -> Option<&str> {
    ["file_path", "path", "notebook_path"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
}

fn tool_command(input: &Value) -> Option<String> {
    match input.get("command")? {
        Value::String(command) => Some(command.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

// ── Manifest parsing ──────────────────────────────────────────────

/// Extract trackable sub-entities from manifest file content.
///
/// Accepts a JSON array, or a JSON object holding one under `tasks`, `subtasks`,
/// `items` or `todos`. Elements are objects (`id` plus `title`/`name`/`description`/`content`)
/// or plain strings. Non-JSON content is read as a Markdown checklist.
pub fn parse_manifest(content: &str) -> Vec<ManifestEntry> {
    match serde_json::from_str::<Value>(content) {
        Ok(value) => {
            let items = match &value {
                Value::Array(items) => Some(items),
                Value::Object(obj) => ["tasks", "subtasks", "items", "todos"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_array)),
                _ => None,
            };
            items
                .map(|items| items.iter().filter_map(manifest_entry_from_json).collect())
                .unwrap_or_default()
        }
        Err(_) => parse_checklist(content),
    }
}

fn manifest_entry_from_json(item: &Value) -> Option<ManifestEntry> {
    match item {
        Value::String(title) if !title.trim().is_empty() => Some(ManifestEntry {
            id: title.trim().to_string(),
            title: title.trim().to_string(),
            status: None,
        }),
        Value::Object(obj) => {
            let title = ["title", "name", "description", "content"]
                .iter()
                .find_map(|key| obj.get(*key).and_then(Value::as_str))
                .map(|s| s.trim().to_string());
            let id = match obj.get("id") {
                Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => title.clone().filter(|t| !t.is_empty()),
            }?;
            Some(ManifestEntry {
                title: title.unwrap_or_else(|| id.clone()),
                id,
                status: obj
                    .get("status")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        _ => None,
    }
}

fn parse_checklist(content: &str) -> Vec<ManifestEntry> {
    content
        .lines()
        .filter_map(|line| {
            let rest = line.trim_start().strip_prefix(['-', '*'])?.trim_start();
            let (done, title) = if let Some(title) = rest.strip_prefix("[ ]") {
                (false, title)
            } else if let Some(title) = rest
                .strip_prefix("[x]")
                .or_else(|| rest.strip_prefix("[X]"))
            {
                (true, title)
            } else {
                return None;
            };
            let title = title.trim();
            if title.is_empty() {
                return None;
            }
            Some(ManifestEntry {
                id: title.to_string(),
                title: title.to_string(),
                status: Some(if done { "done" } else { "pending" }.to_string()),
            })
        })
        .collect()
}

// ── stdout ────────────────────────────────────────────────────────

/// Decoder for the NDJSON stdout stream.
#[derive(Debug, Default)]
pub struct StdoutDecoder {
    lines: LineBuffer,
    sink: Option<SideEffectSink>,
}

impl StdoutDecoder {
    pub fn new(sink: Option<SideEffectSink>) -> Self {
        Self {
            lines: LineBuffer::new(),
            sink,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentMessage> {
        self.lines
            .push(chunk)
            .iter()
            .flat_map(|line| self.decode_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<AgentMessage> {
        match self.lines.finish() {
            Some(line) => self.decode_line(&line),
            None => Vec::new(),
        }
    }

    /// Decode one complete line.
    pub fn decode_line(&self, line: &str) -> Vec<AgentMessage> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if !trimmed.starts_with('{') {
            return vec![AgentMessage::text(line)];
        }

        match serde_json::from_str::<CliEvent>(trimmed) {
            Ok(event) => self.convert(event),
            Err(e) => {
                debug!(error = %e, line = %crate::util::truncate_chars(trimmed, 200), "Unparsable stdout line, keeping as text");
                vec![AgentMessage::text(line)]
            }
        }
    }

    fn convert(&self, event: CliEvent) -> Vec<AgentMessage> {
        let mut results = Vec::new();

        match event {
            CliEvent::System(sys) => {
                results.push(AgentMessage::system(sys.describe()));
            }

            CliEvent::Assistant(evt) => {
                for block in evt.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                results.push(AgentMessage::text(text));
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            if let Some(sink) = &self.sink {
                                sink.observe_tool_use(&name, &input);
                            }
                            results.push(AgentMessage::ToolUse { id, name, input });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => results.push(AgentMessage::ToolResult {
                            tool_use_id,
                            content: content.to_string_lossy(),
                            is_error,
                        }),
                        ContentBlock::Other => {}
                    }
                }
            }

            CliEvent::User(evt) => {
                // User text blocks echo the prompt; only tool results matter here.
                for block in evt.message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        results.push(AgentMessage::ToolResult {
                            tool_use_id,
                            content: content.to_string_lossy(),
                            is_error,
                        });
                    }
                }
            }

            CliEvent::Result(res) => {
                if res.is_failure() {
                    results.push(AgentMessage::error(res.error_message()));
                } else {
                    debug!(
                        subtype = %res.subtype,
                        cost = ?res.total_cost_usd,
                        duration_ms = ?res.duration_ms,
                        turns = ?res.num_turns,
                        "CLI reported completion"
                    );
                    results.push(AgentMessage::complete(
                        res.result.unwrap_or_else(|| "completed".to_string()),
                    ));
                }
            }

            CliEvent::Other => {
                trace!("Skipping unrecognised stdout event kind");
            }
        }

        results
    }
}

// ── stderr ────────────────────────────────────────────────────────

/// Classification of one stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrClass {
    /// Usage/rate/quota notice; informational, never fatal.
    QuotaSignal,
    /// Genuine failure.
    Failure,
    /// Anything else.
    Passthrough,
}

const QUOTA_MARKERS: [&str; 9] = [
    "rate limit",
    "rate_limit",
    "ratelimit",
    "quota",
    "usage limit",
    "too many requests",
    "resource_exhausted",
    "overloaded",
    "credit balance",
];

const FAILURE_MARKERS: [&str; 6] = [
    "error:",
    "fatal:",
    "panicked at",
    "traceback (most recent call last)",
    "unhandled exception",
    "command not found",
];

/// Classify a stderr line. Quota markers take precedence over failure markers.
pub fn classify_stderr_line(line: &str) -> StderrClass {
    if QUOTA_MARKERS
        .iter()
        .any(|needle| contains_ascii_case_insensitive(line, needle))
    {
        StderrClass::QuotaSignal
    } else if FAILURE_MARKERS
        .iter()
        .any(|needle| contains_ascii_case_insensitive(line, needle))
    {
        StderrClass::Failure
    } else {
        StderrClass::Passthrough
    }
}

/// Decoder for the free-text stderr stream.
#[derive(Debug, Default)]
pub struct StderrDecoder {
    lines: LineBuffer,
    recent: VecDeque<String>,
}

impl StderrDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentMessage> {
        let lines = self.lines.push(chunk);
        lines
            .into_iter()
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<AgentMessage> {
        self.lines
            .finish()
            .and_then(|line| self.decode_line(line))
            .into_iter()
            .collect()
    }

    fn decode_line(&mut self, line: String) -> Option<AgentMessage> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        if self.recent.len() == STDERR_TAIL_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(trimmed.to_string());

        match classify_stderr_line(trimmed) {
            StderrClass::QuotaSignal => Some(AgentMessage::system(trimmed)),
            StderrClass::Failure => Some(AgentMessage::error(trimmed)),
            StderrClass::Passthrough => {
                debug!(line = %trimmed, "agent stderr");
                None
            }
        }
    }

    /// The most recent stderr lines, oldest first.
    pub fn recent_lines(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    /// Recent stderr joined into one excerpt.
    pub fn excerpt(&self) -> String {
        self.recent_lines().collect::<Vec<_>>().join("\n")
    }
}

// ── Combined decoder ──────────────────────────────────────────────

/// Per-process decoder state for both output streams.
///
/// The two halves are independent; a supervisor hands each to its own reader task.
#[derive(Debug, Default)]
pub struct StreamEventDecoder {
    pub stdout: StdoutDecoder,
    pub stderr: StderrDecoder,
}

impl StreamEventDecoder {
    pub fn new(sink: Option<SideEffectSink>) -> Self {
        Self {
            stdout: StdoutDecoder::new(sink),
            stderr: StderrDecoder::new(),
        }
    }

    pub fn push(&mut self, stream: StreamKind, chunk: &[u8]) -> Vec<AgentMessage> {
        match stream {
            StreamKind::Stdout => self.stdout.push(chunk),
            StreamKind::Stderr => self.stderr.push(chunk),
        }
    }

    pub fn finish(&mut self, stream: StreamKind) -> Vec<AgentMessage> {
        match stream {
            StreamKind::Stdout => self.stdout.finish(),
            StreamKind::Stderr => self.stderr.finish(),
        }
    }

    pub fn into_parts(self) -> (StdoutDecoder, StderrDecoder) {
        (self.stdout, self.stderr)
    }
}

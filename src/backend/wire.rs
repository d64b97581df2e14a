//! NDJSON event types emitted by the agent CLI in stream-json mode.
//!
//! Only the four top-level kinds the orchestrator understands are modelled;
//! anything else (partial-message stream events, future kinds) lands in
//! [`CliEvent::Other`] and is skipped by the decoder.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "user")]
    User(UserEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl SystemEvent {
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("system: {}", self.subtype)];
        if let Some(model) = &self.model {
            parts.push(format!("model={}", model));
        }
        if let Some(session_id) = &self.session_id {
            parts.push(format!("session={}", session_id));
        }
        if !self.tools.is_empty() {
            parts.push(format!("tools={}", self.tools.len()));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: MessageBody,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEvent {
    pub message: MessageBody,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Tool result content - either a simple string or structured content (array with images/text).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        ToolResultContent::Text(String::new())
    }
}

impl ToolResultContent {
    /// Convert to a string representation for display and transcript capture.
    pub fn to_string_lossy(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Structured(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        let obj = item.as_object()?;
                        if obj.get("type").and_then(|v| v.as_str()) == Some("image") {
                            Some("[image]".to_string())
                        } else {
                            obj.get("text").and_then(|v| v.as_str()).map(str::to_string)
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    serde_json::to_string(items)
                        .unwrap_or_else(|_| "[structured content]".to_string())
                } else {
                    parts.join("\n")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEvent {
    /// Whether the CLI reported the run as failed.
    pub fn is_failure(&self) -> bool {
        let text = self.result.as_deref().unwrap_or("");
        self.is_error
            || self.subtype.starts_with("error")
            || text.starts_with("API Error:")
            || text.contains("\"type\":\"error\"")
    }

    /// Best available error message: `result`, then the first of `errors`.
    ///
    /// Embedded JSON payloads (e.g. `402 {"type":"error",...}`) are reduced to their message.
    pub fn error_message(&self) -> String {
        let raw = self
            .result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.errors.first().map(String::as_str).filter(|s| !s.is_empty()))
            .unwrap_or(if self.subtype.is_empty() {
                "Unknown error"
            } else {
                self.subtype.as_str()
            });

        Self::parse_error_json(raw).unwrap_or_else(|| raw.to_string())
    }

    fn parse_error_json(raw: &str) -> Option<String> {
        let json_str = raw.find('{').map(|idx| &raw[idx..]).unwrap_or(raw);
        let parsed: Value = serde_json::from_str(json_str).ok()?;
        parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| parsed.get("message").and_then(|m| m.as_str()))
            .map(|s| s.to_string())
    }
}

use serde::Serialize;
use serde_json::Value;

/// Normalised message decoded from an agent process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Assistant text, or a stdout line that was not a recognised JSON event.
    Text { content: String },
    /// Agent is calling a tool.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Tool execution completed.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// Informational notice (session init, quota signals, degraded exits).
    System { content: String },
    /// Terminal failure.
    Error { message: String },
    /// Terminal success. `degraded` marks a nonzero exit accepted by policy.
    Complete { content: String, degraded: bool },
}

impl AgentMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn complete(content: impl Into<String>) -> Self {
        Self::Complete {
            content: content.into(),
            degraded: false,
        }
    }

    /// `complete` and `error` end a process's message sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }

    /// Raw textual content carried by the message.
    pub fn content(&self) -> String {
        match self {
            Self::Text { content }
            | Self::System { content }
            | Self::Complete { content, .. }
            | Self::ToolResult { content, .. } => content.clone(),
            Self::Error { message } => message.clone(),
            Self::ToolUse { input, .. } => input.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::System { .. } => "system",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }
}

/// Sub-entity extracted from a manifest file an agent wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub id: String,
    pub title: String,
    pub status: Option<String>,
}

/// Filesystem or command side effect observed in an agent's tool calls.
///
/// Delivered to observers separately from the [`AgentMessage`] stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    FileWrite { path: String },
    FileEdit { path: String },
    Command { command: String },
    ManifestEntry { manifest: String, entry: ManifestEntry },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_complete_and_error_are_terminal() {
        assert!(AgentMessage::complete("done").is_terminal());
        assert!(AgentMessage::error("boom").is_terminal());
        assert!(!AgentMessage::text("hi").is_terminal());
        assert!(!AgentMessage::system("note").is_terminal());
        assert!(!AgentMessage::ToolUse {
            id: "1".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        }
        .is_terminal());
    }

    #[test]
    fn tool_use_content_is_serialised_input() {
        let msg = AgentMessage::ToolUse {
            id: "1".into(),
            name: "Bash".into(),
            input: json!({"command": "ls"}),
        };
        assert_eq!(msg.content(), r#"{"command":"ls"}"#);
        assert_eq!(msg.kind(), "tool_use");
    }

    #[test]
    fn serialises_with_kind_tag() {
        let value = serde_json::to_value(AgentMessage::error("boom")).unwrap();
        assert_eq!(value, json!({"kind": "error", "message": "boom"}));
    }
}

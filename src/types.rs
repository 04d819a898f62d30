//! Conversation and response types shared across the adapter
//!
//! Wire-facing types use snake_case JSON field names.

use crate::metrics::UsageStats;
use serde::{Deserialize, Serialize};

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// One block of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolResult {
        tool_call_id: String,
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Base64 payloads the backend cannot accept; rejected during translation
    Image {
        media_type: String,
        data: String,
    },
    Audio {
        media_type: String,
        data: String,
    },
}

impl ContentBlock {
    /// Modality name for non-text content, `None` for text and tool results
    pub fn modality(&self) -> Option<&'static str> {
        match self {
            ContentBlock::Image { .. } => Some("image"),
            ContentBlock::Audio { .. } => Some("audio"),
            ContentBlock::Text { .. } | ContentBlock::ToolResult { .. } => None,
        }
    }
}

/// A message in the agent's ordered conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        output: serde_json::Value,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::ToolResult,
            content: vec![ContentBlock::ToolResult {
                tool_call_id: tool_call_id.into(),
                output,
                is_error,
            }],
        }
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text blocks
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Resolution state of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Allowed; waiting for a `tool-call-result`
    Pending,
    Completed {
        output: serde_json::Value,
        is_error: bool,
    },
    /// Refused by the permission gateway; never executed
    Denied { reason: String },
}

/// A tool invocation requested by the backend during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub status: ToolCallStatus,
}

impl ToolCall {
    pub fn is_resolved(&self) -> bool {
        !matches!(self.status, ToolCallStatus::Pending)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self.status, ToolCallStatus::Denied { .. })
    }
}

/// The finalized result of one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Adapter-assigned turn identifier (turn-<uuid>)
    pub id: String,
    pub model: Option<String>,
    pub text: String,
    /// Tool calls in arrival order with their resolutions
    pub tool_calls: Vec<ToolCall>,
    pub usage: UsageStats,
    pub stop_reason: Option<String>,
    /// Backend session identifier reported during the turn
    pub session_id: Option<String>,
    /// Wall-clock time from request to end of turn, measured locally
    pub duration_ms: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Response {
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|call| call.id == id)
    }

    pub fn pending_tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls
            .iter()
            .filter(|call| matches!(call.status, ToolCallStatus::Pending))
    }

    pub fn denied_tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.tool_calls.iter().filter(|call| call.is_denied())
    }
}

/// Partial response emitted while a turn streams
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseChunk {
    TextDelta { text: String },
    /// Allowed call; the executor may act on it
    ToolCallPending { call: ToolCall },
    ToolCallDenied { call: ToolCall },
    ToolCallCompleted { call: ToolCall },
    Usage { usage: UsageStats },
    System {
        subtype: String,
        data: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_text_content_joins_blocks() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolResult {
                    tool_call_id: "t1".into(),
                    output: json!("ignored"),
                    is_error: false,
                },
                ContentBlock::Text { text: "b".into() },
            ],
        );
        assert_eq!(msg.text_content(), "ab");
    }

    #[test]
    fn test_role_serializes_kebab_case() {
        let json = serde_json::to_string(&Role::ToolResult).unwrap();
        assert_eq!(json, "\"tool-result\"");
    }

    #[test]
    fn test_modality() {
        let image = ContentBlock::Image {
            media_type: "image/png".into(),
            data: String::new(),
        };
        assert_eq!(image.modality(), Some("image"));
        assert_eq!(ContentBlock::Text { text: "x".into() }.modality(), None);
    }

    #[test]
    fn test_tool_call_resolution() {
        let mut call = ToolCall {
            id: "t1".into(),
            name: "Read".into(),
            input: json!({"file_path": "a.rs"}),
            status: ToolCallStatus::Pending,
        };
        assert!(!call.is_resolved());
        call.status = ToolCallStatus::Denied {
            reason: "not allowed".into(),
        };
        assert!(call.is_resolved());
        assert!(call.is_denied());
    }
}

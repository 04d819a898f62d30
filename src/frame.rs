//! Wire records exchanged with the backend
//!
//! Both directions are newline-delimited JSON, one self-describing record per
//! line, tagged by `"type"`:
//!
//! ```text
//! adapter → backend   {"type":"turn", ...RequestPayload}
//!                     {"type":"permission","tool_call_id":"t1","decision":"deny","reason":"..."}
//! backend → adapter   {"type":"text-delta","text":"4"}
//!                     {"type":"tool-call-request","id":"t1","name":"Bash","input":{...}}
//!                     {"type":"tool-call-result","id":"t1","output":...,"is_error":false}
//!                     {"type":"usage-final","input_tokens":4,"output_tokens":1}
//!                     {"type":"error","message":"..."}
//!                     {"type":"end-of-turn","session_id":"..."}
//!                     {"type":"system","subtype":"init","session_id":"..."}
//! ```

use crate::error::{LocalModelError, Result};
use crate::mcp::McpPayload;
use crate::metrics::UsageStats;
use crate::permissions::PermissionMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The single unit sent to the backend per turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub max_turns: u32,
    pub max_thinking_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpPayload>,
    /// Continue the backend session named by `resume`
    #[serde(default)]
    pub continue_conversation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
}

/// One decoded unit of backend output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReplyFrame {
    TextDelta {
        text: String,
    },
    ToolCallRequest {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolCallResult {
        id: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    UsageFinal(UsageStats),
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    EndOfTurn {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        stop_reason: Option<String>,
    },
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl ReplyFrame {
    /// Frame kind as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            ReplyFrame::TextDelta { .. } => "text-delta",
            ReplyFrame::ToolCallRequest { .. } => "tool-call-request",
            ReplyFrame::ToolCallResult { .. } => "tool-call-result",
            ReplyFrame::UsageFinal(_) => "usage-final",
            ReplyFrame::Error { .. } => "error",
            ReplyFrame::EndOfTurn { .. } => "end-of-turn",
            ReplyFrame::System { .. } => "system",
        }
    }

    /// Frames after which the backend sends nothing more for the turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyFrame::EndOfTurn { .. } | ReplyFrame::Error { .. })
    }
}

/// Answer to a `tool-call-request`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionReply {
    pub tool_call_id: String,
    pub decision: ReplyDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyDecision {
    Allow,
    Deny,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Outbound<'a> {
    Turn(&'a RequestPayload),
    Permission(&'a PermissionReply),
}

/// Encode a turn request as one line, newline included
pub fn encode_request(payload: &RequestPayload) -> Result<String> {
    Ok(serde_json::to_string(&Outbound::Turn(payload))? + "\n")
}

/// Encode a permission answer as one line, newline included
pub fn encode_permission(reply: &PermissionReply) -> Result<String> {
    Ok(serde_json::to_string(&Outbound::Permission(reply))? + "\n")
}

/// Decode one line of backend output; blank lines yield `None`
pub fn decode_line(line_no: u64, line: &str) -> Result<Option<ReplyFrame>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let frame: ReplyFrame = serde_json::from_str(trimmed)
        .map_err(|e| LocalModelError::protocol(line_no, format!("{}: {}", e, truncate(trimmed))))?;

    match &frame {
        ReplyFrame::ToolCallRequest { id, .. } | ReplyFrame::ToolCallResult { id, .. }
            if id.is_empty() =>
        {
            return Err(LocalModelError::protocol(
                line_no,
                format!("{} frame without id", frame.kind()),
            ));
        }
        ReplyFrame::UsageFinal(usage) => {
            if let Some(cost) = usage.total_cost_usd {
                if !cost.is_finite() || cost < 0.0 {
                    return Err(LocalModelError::protocol(
                        line_no,
                        format!("invalid total_cost_usd {}", cost),
                    ));
                }
            }
        }
        _ => {}
    }

    Ok(Some(frame))
}

fn truncate(line: &str) -> String {
    const MAX: usize = 120;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

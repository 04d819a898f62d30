//! Message Translator
//!
//! Turns the agent's ordered conversation into the single request payload of
//! one turn. Only the newest run of user and tool-result messages is sent as
//! the prompt; earlier context lives in the backend session.

use crate::config::ModelOptions;
use crate::error::{LocalModelError, Result};
use crate::frame::RequestPayload;
use crate::mcp::McpRegistry;
use crate::types::{ContentBlock, Message, Role};
use serde::{Deserialize, Serialize};

const SECTION_SEPARATOR: &str = "\n\n";

/// Per-call options supplied alongside the conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Tools the agent offers for this call; used as the allow list when
    /// none is configured
    #[serde(default)]
    pub tools: Vec<String>,
    /// JSON schema the answer should follow
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_response_format(mut self, schema: serde_json::Value) -> Self {
        self.response_format = Some(schema);
        self
    }
}

/// Build the request payload for one turn
///
/// Session continuation fields are left unset; the session manager fills
/// them in.
pub fn translate(
    messages: &[Message],
    options: &ModelOptions,
    registry: &McpRegistry,
    run: &RunOptions,
) -> Result<RequestPayload> {
    check_modalities(messages)?;

    let mut prompt = render_prompt(messages)?;
    if let Some(schema) = &run.response_format {
        prompt.push_str(SECTION_SEPARATOR);
        prompt.push_str("Please respond in JSON format following this schema: ");
        prompt.push_str(&serde_json::to_string(schema)?);
    }

    let allowed_tools = if options.allowed_tools.is_empty() {
        run.tools.clone()
    } else {
        options.allowed_tools.clone()
    };

    Ok(RequestPayload {
        prompt,
        system_prompt: merge_system_prompt(messages, options),
        append_system_prompt: options.append_system_prompt.clone(),
        cwd: options.cwd.clone(),
        allowed_tools,
        disallowed_tools: options.disallowed_tools.clone(),
        permission_mode: options.permission_mode,
        max_turns: options.max_turns,
        max_thinking_tokens: options.max_thinking_tokens,
        model: options.model.clone(),
        mcp: registry.to_payload(),
        continue_conversation: false,
        resume: None,
    })
}

fn check_modalities(messages: &[Message]) -> Result<()> {
    for (index, message) in messages.iter().enumerate() {
        if let Some(modality) = message.content.iter().find_map(ContentBlock::modality) {
            return Err(LocalModelError::UnsupportedContent {
                index,
                modality: modality.to_string(),
            });
        }
    }
    Ok(())
}

/// Configured system prompt first, then system messages in order
fn merge_system_prompt(messages: &[Message], options: &ModelOptions) -> Option<String> {
    let sections: Vec<String> = options
        .system_prompt
        .iter()
        .cloned()
        .chain(
            messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(Message::text_content),
        )
        .filter(|s| !s.trim().is_empty())
        .collect();

    if sections.is_empty() {
        None
    } else {
        Some(sections.join(SECTION_SEPARATOR))
    }
}

/// The newest contiguous run of user and tool-result messages
///
/// System messages inside the run are skipped; an assistant message ends it.
fn render_prompt(messages: &[Message]) -> Result<String> {
    let mut run: Vec<&Message> = messages
        .iter()
        .rev()
        .filter(|m| m.role != Role::System)
        .take_while(|m| matches!(m.role, Role::User | Role::ToolResult))
        .collect();
    if run.is_empty() {
        return Err(LocalModelError::Config(
            "conversation must end with a user or tool-result message".to_string(),
        ));
    }
    run.reverse();

    let parts: Vec<String> = run
        .into_iter()
        .map(render_message)
        .filter(|s| !s.is_empty())
        .collect();
    Ok(parts.join(SECTION_SEPARATOR))
}

fn render_message(message: &Message) -> String {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.clone()),
            ContentBlock::ToolResult {
                tool_call_id,
                output,
                is_error,
            } => {
                let body = match output {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let label = if *is_error { "tool error" } else { "tool result" };
                Some(format!("[{} {}]\n{}", label, tool_call_id, body))
            }
            ContentBlock::Image { .. } | ContentBlock::Audio { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

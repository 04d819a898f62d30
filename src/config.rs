//! Configuration for the local model adapter
//!
//! `ModelOptions` carries every recognized option. It deserializes from the
//! snake_case option names (`system_prompt`, `allowed_tools`, ...) and can be
//! built programmatically with the `with_*` methods. Loading it from files or
//! the environment is the embedding application's job.

use crate::error::{LocalModelError, Result};
use crate::mcp::{McpRegistry, McpServerSpec};
use crate::permissions::{PermissionGateway, PermissionMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default name of the backend executable
pub const DEFAULT_BACKEND_PROGRAM: &str = "claude";

const DEFAULT_FRAME_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_STREAM_BUFFER: usize = 64;

/// How to launch and talk to the backend process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable name or path; bare names are searched on PATH
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Maximum silence between two frames
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Capacity of the decode → delivery hand-off
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_program() -> String {
    DEFAULT_BACKEND_PROGRAM.to_string()
}

fn default_backend_args() -> Vec<String> {
    vec![
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ]
}

fn default_frame_timeout_ms() -> u64 {
    DEFAULT_FRAME_TIMEOUT_MS
}

fn default_stream_buffer() -> usize {
    DEFAULT_STREAM_BUFFER
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_backend_args(),
            env: BTreeMap::new(),
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl BackendConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity;
        self
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Options recognized by the adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Concatenated after any system content, never replacing it
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// Passed to the backend; never accessed by the adapter
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_thinking_tokens")]
    pub max_thinking_tokens: u32,
    #[serde(default)]
    pub continue_conversation: bool,
    /// Backend session to resume on the first turn
    #[serde(default)]
    pub resume: Option<String>,
    /// Backend-defined short name, e.g. "sonnet"
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerSpec>,
    /// Qualified `server.tool` names
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    /// Treat allowed calls still pending at end of turn as a protocol error
    #[serde(default = "default_true")]
    pub strict_tool_resolution: bool,
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_max_turns() -> u32 {
    1
}

fn default_max_thinking_tokens() -> u32 {
    8000
}

fn default_true() -> bool {
    true
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            append_system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: PermissionMode::Default,
            cwd: None,
            max_turns: default_max_turns(),
            max_thinking_tokens: default_max_thinking_tokens(),
            continue_conversation: false,
            resume: None,
            model: None,
            mcp_servers: BTreeMap::new(),
            mcp_tools: Vec::new(),
            strict_tool_resolution: true,
            backend: BackendConfig::default(),
        }
    }
}

impl ModelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LocalModelError::Config(e.to_string()))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.append_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_disallowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_thinking_tokens(mut self, tokens: u32) -> Self {
        self.max_thinking_tokens = tokens;
        self
    }

    pub fn with_continue_conversation(mut self, enabled: bool) -> Self {
        self.continue_conversation = enabled;
        self
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_mcp_server(mut self, spec: McpServerSpec) -> Self {
        self.mcp_servers.insert(spec.name.clone(), spec);
        self
    }

    pub fn with_mcp_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mcp_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strict_tool_resolution(mut self, strict: bool) -> Self {
        self.strict_tool_resolution = strict;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Check option values and build the MCP registry
    pub fn validate(&self) -> Result<McpRegistry> {
        if self.max_turns == 0 {
            return Err(LocalModelError::Config(
                "max_turns must be a positive integer".to_string(),
            ));
        }
        if self.backend.program.trim().is_empty() {
            return Err(LocalModelError::Config(
                "backend.program must not be empty".to_string(),
            ));
        }
        if self.backend.stream_buffer == 0 {
            return Err(LocalModelError::Config(
                "backend.stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.backend.frame_timeout_ms == 0 {
            return Err(LocalModelError::Config(
                "backend.frame_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(resume) = &self.resume {
            if resume.trim().is_empty() {
                return Err(LocalModelError::Config(
                    "resume must be a non-empty session id".to_string(),
                ));
            }
        }
        McpRegistry::new(self.mcp_servers.clone(), &self.mcp_tools)
    }

    /// Permission gateway for these options; enabled MCP tools count as allowed
    pub fn permission_gateway(&self, registry: &McpRegistry) -> PermissionGateway {
        let allow = self
            .allowed_tools
            .iter()
            .cloned()
            .chain(registry.permission_rules());
        PermissionGateway::new(allow, &self.disallowed_tools, self.permission_mode)
    }
}

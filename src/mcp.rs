//! MCP (Model Context Protocol) server registry
//!
//! The adapter never talks to MCP servers itself. It validates the declared
//! servers and the enabled tool subset up front, then hands both to the
//! backend inside every request payload.
//!
//! ## Tool Naming Convention
//!
//! Enabled tools are configured as `server.tool` (or `server` for every tool
//! of a server). The backend reports MCP tool calls as `mcp__<server>__<tool>`:
//!
//! | Configured | Reported by backend |
//! |------------|---------------------|
//! | `github.create_issue` | `mcp__github__create_issue` |
//! | `postgres` | `mcp__postgres__*` |

use crate::error::{LocalModelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How the backend reaches an MCP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransportKind {
    /// Local subprocess speaking over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

/// A declared MCP server; the name is the key it was declared under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerSpec {
    #[serde(skip)]
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransportKind,
}

impl McpServerSpec {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransportKind::Stdio {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
        }
    }
}

/// An enabled tool reference; `tool == None` enables the whole server
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedToolName {
    pub server: String,
    pub tool: Option<String>,
}

impl QualifiedToolName {
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        let (server, tool) = match name.split_once('.') {
            Some((server, "*")) => (server, None),
            Some((server, tool)) => (server, Some(tool)),
            None => (name, None),
        };
        if server.is_empty() || tool.is_some_and(str::is_empty) {
            return Err(LocalModelError::Config(format!(
                "invalid MCP tool name '{}' (expected server.tool)",
                name
            )));
        }
        Ok(Self {
            server: server.to_string(),
            tool: tool.map(str::to_string),
        })
    }

    /// Name the backend uses when it reports a call to this tool
    pub fn wire_name(&self) -> String {
        match &self.tool {
            Some(tool) => format!("mcp__{}__{}", self.server, tool),
            None => format!("mcp__{}", self.server),
        }
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tool {
            Some(tool) => write!(f, "{}.{}", self.server, tool),
            None => f.write_str(&self.server),
        }
    }
}

/// MCP section of a request payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpPayload {
    pub servers: BTreeMap<String, McpTransportKind>,
    pub enabled_tools: Vec<String>,
}

/// Validated MCP configuration, shared read-only across sessions
#[derive(Debug, Clone, Default)]
pub struct McpRegistry {
    servers: BTreeMap<String, McpServerSpec>,
    enabled: BTreeSet<QualifiedToolName>,
}

impl McpRegistry {
    /// Build and validate; every enabled tool must name a declared server
    pub fn new<I, S>(servers: BTreeMap<String, McpServerSpec>, enabled_tools: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let servers: BTreeMap<String, McpServerSpec> = servers
            .into_iter()
            .map(|(name, mut spec)| {
                spec.name = name.clone();
                (name, spec)
            })
            .collect();

        let mut enabled = BTreeSet::new();
        for raw in enabled_tools {
            let qualified = QualifiedToolName::parse(raw.as_ref())?;
            if !servers.contains_key(&qualified.server) {
                return Err(LocalModelError::UnknownMcpServer {
                    server: qualified.server.clone(),
                    tool: raw.as_ref().to_string(),
                });
            }
            enabled.insert(qualified);
        }

        tracing::debug!(
            servers = servers.len(),
            enabled_tools = enabled.len(),
            "MCP registry configured"
        );

        Ok(Self { servers, enabled })
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server(&self, name: &str) -> Option<&McpServerSpec> {
        self.servers.get(name)
    }

    pub fn servers(&self) -> impl Iterator<Item = &McpServerSpec> {
        self.servers.values()
    }

    pub fn enabled_tools(&self) -> impl Iterator<Item = &QualifiedToolName> {
        self.enabled.iter()
    }

    /// Enabled tools as permission rules in backend naming
    pub fn permission_rules(&self) -> Vec<String> {
        self.enabled.iter().map(QualifiedToolName::wire_name).collect()
    }

    /// Payload section, `None` when no server is declared
    pub fn to_payload(&self) -> Option<McpPayload> {
        if self.servers.is_empty() {
            return None;
        }
        Some(McpPayload {
            servers: self
                .servers
                .iter()
                .map(|(name, spec)| (name.clone(), spec.transport.clone()))
                .collect(),
            enabled_tools: self.enabled.iter().map(ToString::to_string).collect(),
        })
    }
}

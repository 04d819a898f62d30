//! Permission gateway for backend tool-use requests
//!
//! Every `tool-call-request` the backend emits is checked here before the
//! adapter answers it. Evaluation:
//! 1. A tool matched by both the allow and the deny list is denied
//! 2. `bypassPermissions` allows everything else
//! 3. Deny list matches are denied
//! 4. Allow list matches (and edit tools under `acceptEdits`) are allowed
//! 5. Anything else is `Ask`, resolved by an external callback or denied

use crate::error::LocalModelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy for tool uses the lists do not settle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = LocalModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            other => Err(LocalModelError::Config(format!(
                "unrecognized permission_mode '{}' (expected default, acceptEdits or bypassPermissions)",
                other
            ))),
        }
    }
}

/// Permission decision result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
    /// Needs an external decision; denied when nobody is asked
    Ask,
}

/// Returns true for tools that modify files in place
pub fn is_edit_tool(tool_name: &str) -> bool {
    matches!(
        tool_name.to_ascii_lowercase().as_str(),
        "write" | "edit" | "multiedit" | "notebookedit"
    )
}

/// A permission rule with pattern matching support
///
/// Format: `ToolName(pattern)` or `ToolName` (matches all)
///
/// Examples:
/// - `Bash(cargo:*)` - matches all cargo commands
/// - `Read(src/**/*.rs)` - matches Rust files in src/
/// - `mcp__github` - matches all tools of the github MCP server
#[derive(Debug, Clone)]
pub struct PermissionRule {
    pub rule: String,
    tool_name: String,
    arg_pattern: Option<String>,
    matcher: ArgMatcher,
}

impl PartialEq for PermissionRule {
    fn eq(&self, other: &Self) -> bool {
        self.rule == other.rule
    }
}

impl Eq for PermissionRule {}

impl PermissionRule {
    pub fn new(rule: &str) -> Self {
        let rule = rule.trim();
        if let Some(paren_start) = rule.find('(') {
            if rule.ends_with(')') {
                let pattern = &rule[paren_start + 1..rule.len() - 1];
                return Self {
                    rule: rule.to_string(),
                    tool_name: rule[..paren_start].to_string(),
                    arg_pattern: Some(pattern.to_string()),
                    matcher: ArgMatcher::compile(pattern),
                };
            }
        }
        Self {
            rule: rule.to_string(),
            tool_name: rule.to_string(),
            arg_pattern: None,
            matcher: ArgMatcher::Any,
        }
    }

    /// Check if this rule matches a tool invocation
    pub fn matches(&self, tool_name: &str, input: &serde_json::Value) -> bool {
        if !self.matches_tool_name(tool_name) {
            return false;
        }
        match &self.matcher {
            ArgMatcher::Any => true,
            matcher => matcher.matches(&arg_string(tool_name, input)),
        }
    }

    fn matches_tool_name(&self, actual: &str) -> bool {
        // mcp__server covers every mcp__server__tool
        if self.tool_name.starts_with("mcp__")
            && actual.starts_with("mcp__")
            && actual
                .strip_prefix(self.tool_name.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("__"))
        {
            return true;
        }
        self.tool_name.eq_ignore_ascii_case(actual)
    }
}

/// String the argument pattern of a rule is matched against
fn arg_string(tool_name: &str, input: &serde_json::Value) -> String {
    let field = |name: &str| {
        input
            .get(name)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    match tool_name.to_ascii_lowercase().as_str() {
        "bash" => field("command"),
        "read" | "write" | "edit" | "multiedit" => field("file_path"),
        "notebookedit" => field("notebook_path"),
        "glob" => field("pattern"),
        "grep" => format!("{} {}", field("pattern"), field("path")),
        "ls" => field("path"),
        "webfetch" => field("url"),
        _ => serde_json::to_string(input).unwrap_or_default(),
    }
}

/// Argument pattern of a rule, compiled when the rule is built
///
/// `*` stops at `/`, `**` crosses it, trailing `:*` is a prefix match.
#[derive(Debug, Clone)]
enum ArgMatcher {
    Any,
    Prefix(String),
    Glob(regex::Regex),
    /// Pattern that failed to compile; matched as a plain prefix
    Literal(String),
}

impl ArgMatcher {
    fn compile(pattern: &str) -> Self {
        if pattern == "*" {
            return ArgMatcher::Any;
        }
        if let Some(prefix) = pattern.strip_suffix(":*") {
            return ArgMatcher::Prefix(prefix.to_string());
        }
        match regex::Regex::new(&glob_to_regex(pattern)) {
            Ok(re) => ArgMatcher::Glob(re),
            Err(e) => {
                tracing::warn!(pattern, "Permission pattern is not a valid glob: {}", e);
                ArgMatcher::Literal(pattern.to_string())
            }
        }
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            ArgMatcher::Any => true,
            ArgMatcher::Prefix(prefix) | ArgMatcher::Literal(prefix) => text.starts_with(prefix),
            ArgMatcher::Glob(re) => re.is_match(text),
        }
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                regex.push_str(".*");
                i += if chars.get(i + 2) == Some(&'/') { 3 } else { 2 };
            }
            '*' => {
                regex.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex.push_str("[^/]");
                i += 1;
            }
            c @ ('.' | '+' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\') => {
                regex.push('\\');
                regex.push(c);
                i += 1;
            }
            c => {
                regex.push(c);
                i += 1;
            }
        }
    }

    regex.push('$');
    regex
}

/// External arbiter for `Ask` decisions
#[async_trait]
pub trait PermissionCallback: Send + Sync {
    /// Returning `Ask` again is treated as a denial
    async fn decide(&self, tool_name: &str, input: &serde_json::Value) -> PermissionDecision;
}

/// Final allow/deny outcome with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

/// Allow/deny lists plus mode; read-only once built
#[derive(Debug, Clone, Default)]
pub struct PermissionGateway {
    allow: Vec<PermissionRule>,
    deny: Vec<PermissionRule>,
    mode: PermissionMode,
}

impl PermissionGateway {
    pub fn new<A, D>(allow: A, deny: D, mode: PermissionMode) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            allow: allow.into_iter().map(|r| PermissionRule::new(r.as_ref())).collect(),
            deny: deny.into_iter().map(|r| PermissionRule::new(r.as_ref())).collect(),
            mode,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn allow_rules(&self) -> impl Iterator<Item = &str> {
        self.allow.iter().map(|r| r.rule.as_str())
    }

    pub fn deny_rules(&self) -> impl Iterator<Item = &str> {
        self.deny.iter().map(|r| r.rule.as_str())
    }

    /// Pure decision for a tool invocation
    pub fn decide(&self, tool_name: &str, input: &serde_json::Value) -> PermissionDecision {
        let denied = self.deny.iter().any(|r| r.matches(tool_name, input));
        let allowed = self.allow.iter().any(|r| r.matches(tool_name, input));

        if denied && allowed {
            return PermissionDecision::Deny;
        }

        match self.mode {
            PermissionMode::BypassPermissions => PermissionDecision::Allow,
            PermissionMode::AcceptEdits => {
                if denied {
                    PermissionDecision::Deny
                } else if allowed || is_edit_tool(tool_name) {
                    PermissionDecision::Allow
                } else {
                    PermissionDecision::Ask
                }
            }
            PermissionMode::Default => {
                if denied {
                    PermissionDecision::Deny
                } else if allowed {
                    PermissionDecision::Allow
                } else {
                    PermissionDecision::Ask
                }
            }
        }
    }

    /// Decide and settle `Ask` through the callback, denying when there is none
    pub async fn resolve(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        callback: Option<&dyn PermissionCallback>,
    ) -> Verdict {
        match self.decide(tool_name, input) {
            PermissionDecision::Allow => Verdict {
                allowed: true,
                reason: format!("allowed by {} mode", self.mode),
            },
            PermissionDecision::Deny => Verdict {
                allowed: false,
                reason: format!("tool '{}' is disallowed", tool_name),
            },
            PermissionDecision::Ask => match callback {
                Some(cb) => match cb.decide(tool_name, input).await {
                    PermissionDecision::Allow => Verdict {
                        allowed: true,
                        reason: "approved by permission callback".to_string(),
                    },
                    PermissionDecision::Deny | PermissionDecision::Ask => Verdict {
                        allowed: false,
                        reason: "rejected by permission callback".to_string(),
                    },
                },
                None => Verdict {
                    allowed: false,
                    reason: format!(
                        "tool '{}' is not in the allow list and no approver is configured",
                        tool_name
                    ),
                },
            },
        }
    }
}

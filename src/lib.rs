//! # a3s-local-model
//!
//! Drive a local, CLI-resident language-model backend from the A3S agent
//! abstractions.
//!
//! ## Overview
//!
//! The backend runs as a long-lived subprocess speaking newline-delimited
//! JSON over stdin/stdout. `a3s-local-model` translates the agent's
//! conversation into one request per turn, rebuilds structured responses
//! (streamed text, tool calls, usage and cost) from the reply frames, gates
//! every tool call through the configured permission policy, and keeps the
//! backend session alive across turns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_local_model::{LocalModel, Message, ModelOptions, PermissionMode};
//!
//! # async fn example() -> a3s_local_model::Result<()> {
//! let model = LocalModel::new(
//!     ModelOptions::default()
//!         .with_allowed_tools(["Read", "Grep"])
//!         .with_permission_mode(PermissionMode::AcceptEdits),
//! )?;
//!
//! let response = model.run(&[Message::user("What does src/main.rs do?")]).await?;
//! println!("{}", response.text);
//! for call in response.pending_tool_calls() {
//!     println!("backend wants to run {} with {}", call.name, call.input);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Transport** trait: one turn in, one finite [`FrameStream`] out
//! - **CliTransport**: subprocess implementation with lazy spawn and reuse
//! - **SessionManager**: session identity, turn budget, busy guard
//! - **ResponseAggregator**: frames to chunks and a final [`Response`]
//! - **PermissionGateway**: allow/deny lists and permission mode
//! - **McpRegistry**: MCP server declarations forwarded to the backend
//! - **LocalModel**: the facade the agent holds

pub mod aggregator;
pub mod config;
pub mod error;
pub mod frame;
pub mod locate;
pub mod mcp;
pub mod metrics;
pub mod model;
pub mod permissions;
pub mod session;
pub mod telemetry;
pub mod translator;
pub mod transport;
pub mod types;

// Re-export core types
pub use aggregator::ResponseAggregator;
pub use config::{BackendConfig, ModelOptions, DEFAULT_BACKEND_PROGRAM};
pub use error::{ErrorKind, LocalModelError, Result};
pub use frame::{PermissionReply, ReplyDecision, ReplyFrame, RequestPayload};
pub use mcp::{McpRegistry, McpServerSpec, McpTransportKind, QualifiedToolName};
pub use metrics::{MetricsCollector, ServerToolUse, UsageStats};
pub use model::{LocalModel, ResponseStream};
pub use permissions::{
    PermissionCallback, PermissionDecision, PermissionGateway, PermissionMode, Verdict,
};
pub use session::{SessionManager, SessionState, TurnGuard};
pub use translator::{translate, RunOptions};
pub use transport::{CliTransport, FrameSink, FrameStream, ReleaseHandle, Transport};
pub use types::{ContentBlock, Message, Response, ResponseChunk, Role, ToolCall, ToolCallStatus};

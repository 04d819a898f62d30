//! Error types for a3s-local-model

use thiserror::Error;

/// Errors that can occur while driving the local backend
#[derive(Debug, Error)]
pub enum LocalModelError {
    /// A message carries a modality the backend does not accept
    #[error("Unsupported content in message {index}: {modality} is not accepted by the backend")]
    UnsupportedContent { index: usize, modality: String },

    /// Backend executable could not be located
    #[error("Backend executable '{program}' not found (searched: {searched})")]
    BackendUnavailable { program: String, searched: String },

    /// Backend was found but could not be reached, or exited
    #[error("Backend connection error: {reason}")]
    BackendConnection {
        reason: String,
        exit_code: Option<i32>,
    },

    /// Backend output is not parseable as a reply frame
    #[error("Backend protocol error at line {line}: {reason}")]
    BackendProtocol { line: u64, reason: String },

    /// Backend sent an `error` frame
    #[error("Backend reported error: {message}")]
    BackendReported {
        message: String,
        code: Option<String>,
        data: Option<serde_json::Value>,
    },

    /// No frame arrived within the configured interval
    #[error("Backend timed out: no frame within {timeout_ms}ms")]
    BackendTimeout { timeout_ms: u64 },

    /// Turn limit of the session reached
    #[error("Session limit reached: {turns} of {max_turns} turns used")]
    SessionLimit { turns: u32, max_turns: u32 },

    /// A turn is already in flight on this session
    #[error("Session busy: a turn is already in flight")]
    SessionBusy,

    /// Session was closed and must be reset before reuse
    #[error("Session closed: {reason}")]
    SessionClosed { reason: String },

    /// An enabled MCP tool references an undeclared server
    #[error("Unknown MCP server '{server}' referenced by tool '{tool}'")]
    UnknownMcpServer { server: String, tool: String },

    /// Invalid option value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse error classification for callers that branch on the failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedContent,
    BackendUnavailable,
    BackendConnection,
    BackendProtocol,
    BackendReported,
    BackendTimeout,
    SessionLimit,
    SessionBusy,
    SessionClosed,
    UnknownMcpServer,
    Config,
    Serialization,
}

impl LocalModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedContent { .. } => ErrorKind::UnsupportedContent,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::BackendConnection { .. } => ErrorKind::BackendConnection,
            Self::BackendProtocol { .. } => ErrorKind::BackendProtocol,
            Self::BackendReported { .. } => ErrorKind::BackendReported,
            Self::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            Self::SessionLimit { .. } => ErrorKind::SessionLimit,
            Self::SessionBusy => ErrorKind::SessionBusy,
            Self::SessionClosed { .. } => ErrorKind::SessionClosed,
            Self::UnknownMcpServer { .. } => ErrorKind::UnknownMcpServer,
            Self::Config(_) => ErrorKind::Config,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Errors raised after the frame stream opened; partial output stays valid
    pub fn is_mid_stream(&self) -> bool {
        matches!(
            self,
            Self::BackendProtocol { .. } | Self::BackendReported { .. } | Self::BackendTimeout { .. }
        )
    }

    /// Errors decided locally without any backend interaction
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedContent { .. }
                | Self::SessionLimit { .. }
                | Self::SessionBusy
                | Self::SessionClosed { .. }
                | Self::UnknownMcpServer { .. }
                | Self::Config(_)
        )
    }

    pub(crate) fn connection(reason: impl Into<String>) -> Self {
        Self::BackendConnection {
            reason: reason.into(),
            exit_code: None,
        }
    }

    pub(crate) fn protocol(line: u64, reason: impl Into<String>) -> Self {
        Self::BackendProtocol {
            line,
            reason: reason.into(),
        }
    }
}

/// Result type alias for local model operations
pub type Result<T> = std::result::Result<T, LocalModelError>;

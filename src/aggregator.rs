//! Response Aggregator
//!
//! Consumes one turn's frame stream, answers tool-call requests through the
//! permission gateway, and assembles the final [`Response`]. Partial output
//! is forwarded as [`ResponseChunk`]s over a bounded channel as it arrives;
//! chunks already delivered stay valid when the turn later fails.

use crate::error::{LocalModelError, Result};
use crate::frame::{PermissionReply, ReplyDecision, ReplyFrame};
use crate::metrics::{MetricsCollector, UsageStats};
use crate::permissions::{PermissionCallback, PermissionGateway};
use crate::telemetry;
use crate::transport::FrameStream;
use crate::types::{Response, ResponseChunk, ToolCall, ToolCallStatus};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::Instrument;

enum Step {
    Continue,
    Finished(Response),
}

/// Builds the response of a single turn
pub struct ResponseAggregator {
    gateway: Arc<PermissionGateway>,
    callback: Option<Arc<dyn PermissionCallback>>,
    metrics: Option<Arc<Mutex<MetricsCollector>>>,
    chunks: Option<mpsc::Sender<ResponseChunk>>,
    strict_tool_resolution: bool,
    model: Option<String>,

    frames_seen: u64,
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: UsageStats,
    usage_reported: bool,
    session_id: Option<String>,
    started: Instant,
}

impl ResponseAggregator {
    pub fn new(gateway: Arc<PermissionGateway>) -> Self {
        Self {
            gateway,
            callback: None,
            metrics: None,
            chunks: None,
            strict_tool_resolution: true,
            model: None,
            frames_seen: 0,
            text: String::new(),
            tool_calls: Vec::new(),
            usage: UsageStats::default(),
            usage_reported: false,
            session_id: None,
            started: Instant::now(),
        }
    }

    /// Approver consulted when the gateway answers `Ask`
    pub fn with_callback(mut self, callback: Option<Arc<dyn PermissionCallback>>) -> Self {
        self.callback = callback;
        self
    }

    /// Collector updated when the turn reports its usage
    pub fn with_metrics(mut self, metrics: Arc<Mutex<MetricsCollector>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_chunks(mut self, chunks: mpsc::Sender<ResponseChunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn with_strict_tool_resolution(mut self, strict: bool) -> Self {
        self.strict_tool_resolution = strict;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Drive the stream to its terminal frame
    pub async fn aggregate(mut self, mut frames: FrameStream) -> Result<Response> {
        while let Some(frame) = frames.next_frame().await {
            self.frames_seen += 1;
            if let Step::Finished(response) = self.apply(frame?, &frames).await? {
                return Ok(response);
            }
        }
        Err(LocalModelError::connection(
            "reply stream ended before end-of-turn",
        ))
    }

    async fn apply(&mut self, frame: ReplyFrame, frames: &FrameStream) -> Result<Step> {
        match frame {
            ReplyFrame::TextDelta { text } => {
                self.text.push_str(&text);
                self.emit(ResponseChunk::TextDelta { text }).await;
            }
            ReplyFrame::ToolCallRequest { id, name, input } => {
                self.request_tool(id, name, input, frames).await?;
            }
            ReplyFrame::ToolCallResult {
                id,
                output,
                is_error,
            } => {
                self.complete_tool(id, output, is_error).await?;
            }
            ReplyFrame::UsageFinal(usage) => {
                // One snapshot per turn; a repeat would be counted twice
                if self.usage_reported {
                    return Err(LocalModelError::protocol(
                        self.frames_seen,
                        "second usage-final in one turn",
                    ));
                }
                self.usage_reported = true;
                telemetry::record_turn_usage(&usage);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record_turn(usage.clone());
                }
                self.usage = usage.clone();
                self.emit(ResponseChunk::Usage { usage }).await;
            }
            ReplyFrame::Error {
                message,
                code,
                data,
            } => {
                tracing::warn!(code = code.as_deref().unwrap_or(""), "Backend reported error: {}", message);
                return Err(LocalModelError::BackendReported {
                    message,
                    code,
                    data,
                });
            }
            ReplyFrame::System {
                subtype,
                session_id,
                data,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                self.emit(ResponseChunk::System { subtype, data }).await;
            }
            ReplyFrame::EndOfTurn {
                session_id,
                stop_reason,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                return self.finish(stop_reason).map(Step::Finished);
            }
        }
        Ok(Step::Continue)
    }

    async fn request_tool(
        &mut self,
        id: String,
        name: String,
        input: serde_json::Value,
        frames: &FrameStream,
    ) -> Result<()> {
        if self.tool_calls.iter().any(|call| call.id == id) {
            return Err(LocalModelError::protocol(
                self.frames_seen,
                format!("duplicate tool call id '{}'", id),
            ));
        }

        let span = tracing::info_span!(
            "a3s.local_model.permission",
            a3s.tool.name = %name,
            a3s.tool.id = %id,
            a3s.tool.permission = tracing::field::Empty,
        );
        let verdict = self
            .gateway
            .resolve(&name, &input, self.callback.as_deref())
            .instrument(span.clone())
            .await;
        span.record(
            telemetry::ATTR_TOOL_PERMISSION,
            if verdict.allowed { "allow" } else { "deny" },
        );
        tracing::debug!(
            tool = %name,
            id = %id,
            decision = if verdict.allowed { "allow" } else { "deny" },
            reason = %verdict.reason,
            "Tool call permission resolved"
        );

        let reply = PermissionReply {
            tool_call_id: id.clone(),
            decision: if verdict.allowed {
                ReplyDecision::Allow
            } else {
                ReplyDecision::Deny
            },
            reason: (!verdict.allowed).then(|| verdict.reason.clone()),
        };
        if !frames.reply_permission(reply) {
            tracing::debug!(id = %id, "Permission reply not delivered, turn already ended");
        }

        let call = ToolCall {
            id,
            name,
            input,
            status: if verdict.allowed {
                ToolCallStatus::Pending
            } else {
                ToolCallStatus::Denied {
                    reason: verdict.reason,
                }
            },
        };
        let chunk = if verdict.allowed {
            ResponseChunk::ToolCallPending { call: call.clone() }
        } else {
            ResponseChunk::ToolCallDenied { call: call.clone() }
        };
        self.tool_calls.push(call);
        self.emit(chunk).await;
        Ok(())
    }

    async fn complete_tool(
        &mut self,
        id: String,
        output: serde_json::Value,
        is_error: bool,
    ) -> Result<()> {
        let line = self.frames_seen;
        let Some(call) = self.tool_calls.iter_mut().find(|call| call.id == id) else {
            return Err(LocalModelError::protocol(
                line,
                format!("result for unknown tool call '{}'", id),
            ));
        };

        match call.status {
            ToolCallStatus::Pending => {
                call.status = ToolCallStatus::Completed { output, is_error };
                let chunk = ResponseChunk::ToolCallCompleted { call: call.clone() };
                self.emit(chunk).await;
                Ok(())
            }
            // The backend echoes its own refusal notice; the denial stands
            ToolCallStatus::Denied { .. } => {
                tracing::debug!(id = %id, "Ignoring result for denied tool call");
                Ok(())
            }
            ToolCallStatus::Completed { .. } => Err(LocalModelError::protocol(
                line,
                format!("second result for tool call '{}'", id),
            )),
        }
    }

    fn finish(&mut self, stop_reason: Option<String>) -> Result<Response> {
        let unresolved: Vec<&str> = self
            .tool_calls
            .iter()
            .filter(|call| !call.is_resolved())
            .map(|call| call.id.as_str())
            .collect();
        if !unresolved.is_empty() {
            if self.strict_tool_resolution {
                return Err(LocalModelError::protocol(
                    self.frames_seen,
                    format!("unresolved tool calls at end of turn: {}", unresolved.join(", ")),
                ));
            }
            tracing::debug!(pending = unresolved.len(), "Turn ended with pending tool calls");
        }

        telemetry::record_turn_outcome(self.tool_calls.len(), stop_reason.as_deref());

        Ok(Response {
            id: format!("turn-{}", uuid::Uuid::new_v4()),
            model: self.model.take(),
            text: std::mem::take(&mut self.text),
            tool_calls: std::mem::take(&mut self.tool_calls),
            usage: std::mem::take(&mut self.usage),
            stop_reason,
            session_id: self.session_id.take(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            created_at: chrono::Utc::now(),
        })
    }

    async fn emit(&mut self, chunk: ResponseChunk) {
        if let Some(tx) = &self.chunks {
            if tx.send(chunk).await.is_err() {
                tracing::debug!("Chunk consumer gone, continuing without streaming");
                self.chunks = None;
            }
        }
    }
}

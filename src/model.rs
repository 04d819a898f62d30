//! Upstream adapter facade
//!
//! [`LocalModel`] is what the agent collaborator holds: one per agent
//! instance, owning its transport and session state. Independent instances
//! can run in parallel and share nothing mutable.
//!
//! ```rust,no_run
//! use a3s_local_model::{LocalModel, Message, ModelOptions};
//!
//! # async fn example() -> a3s_local_model::Result<()> {
//! let model = LocalModel::new(
//!     ModelOptions::default()
//!         .with_allowed_tools(["Read"])
//!         .with_continue_conversation(true)
//!         .with_max_turns(5),
//! )?;
//! let response = model
//!     .run(&[Message::system("be terse"), Message::user("2+2?")])
//!     .await?;
//! println!("{} ({:?} output tokens)", response.text, model.usage().output_tokens);
//! # Ok(())
//! # }
//! ```

use crate::aggregator::ResponseAggregator;
use crate::config::ModelOptions;
use crate::error::{LocalModelError, Result};
use crate::frame::RequestPayload;
use crate::mcp::McpRegistry;
use crate::metrics::{MetricsCollector, UsageStats};
use crate::permissions::{PermissionCallback, PermissionGateway};
use crate::session::{SessionManager, SessionState, TurnGuard};
use crate::transport::{CliTransport, FrameStream, ReleaseHandle, Transport};
use crate::translator::{translate, RunOptions};
use crate::types::{Message, Response, ResponseChunk};
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::Instrument;

/// Adapter driving a local backend for one agent instance
pub struct LocalModel {
    options: Arc<ModelOptions>,
    registry: Arc<McpRegistry>,
    gateway: Arc<PermissionGateway>,
    transport: Arc<dyn Transport>,
    session: SessionManager,
    metrics: Arc<Mutex<MetricsCollector>>,
    callback: Option<Arc<dyn PermissionCallback>>,
}

/// Everything a started turn needs to run to completion
struct TurnContext {
    claim: TurnClaim,
    frames: FrameStream,
    aggregator: ResponseAggregator,
    span: tracing::Span,
}

/// A turn's hold on the session and the transport
///
/// Shared between the task driving the turn and the caller's handle, so
/// whichever side finishes first settles the session. Abandoning frees both
/// before it returns.
#[derive(Clone)]
struct TurnClaim {
    guard: Arc<Mutex<Option<TurnGuard>>>,
    transport: ReleaseHandle,
}

impl TurnClaim {
    fn new(guard: TurnGuard, transport: ReleaseHandle) -> Self {
        Self {
            guard: Arc::new(Mutex::new(Some(guard))),
            transport,
        }
    }

    fn take(&self) -> Option<TurnGuard> {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn abandon(&self) {
        if let Some(guard) = self.take() {
            drop(guard);
            self.transport.release();
        }
    }
}

impl LocalModel {
    /// Validate options and prepare a subprocess transport; nothing is spawned yet
    pub fn new(options: ModelOptions) -> Result<Self> {
        let transport = Arc::new(CliTransport::new(options.backend.clone()));
        Self::with_transport(options, transport)
    }

    /// Use a caller-supplied transport
    pub fn with_transport(options: ModelOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        let registry = options.validate()?;
        let gateway = options.permission_gateway(&registry);
        let session = SessionManager::from_options(&options);

        tracing::debug!(
            permission_mode = %options.permission_mode,
            max_turns = options.max_turns,
            continue_conversation = options.continue_conversation,
            mcp_servers = registry.servers().count(),
            "Local model configured"
        );

        Ok(Self {
            options: Arc::new(options),
            registry: Arc::new(registry),
            gateway: Arc::new(gateway),
            transport,
            session,
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
            callback: None,
        })
    }

    /// Approver for tool calls the gateway cannot settle on its own
    pub fn with_permission_callback(mut self, callback: Arc<dyn PermissionCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn registry(&self) -> &McpRegistry {
        &self.registry
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    /// Usage of the most recent turn
    pub fn usage(&self) -> UsageStats {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_turn()
    }

    /// Usage summed over every turn of this instance
    pub fn cumulative_usage(&self) -> UsageStats {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cumulative()
    }

    pub async fn run(&self, messages: &[Message]) -> Result<Response> {
        self.run_with(messages, RunOptions::default()).await
    }

    /// Run one turn to completion
    pub async fn run_with(&self, messages: &[Message], run: RunOptions) -> Result<Response> {
        let turn = self.start_turn(messages, &run, None).await?;
        let span = turn.span.clone();
        drive(turn).instrument(span).await
    }

    /// Run one turn, yielding partial output as it arrives
    ///
    /// Local failures (content, session guards, backend discovery) are
    /// returned here; failures after the turn started surface from
    /// [`ResponseStream::finish`]. Dropping the stream cancels the turn.
    pub async fn run_stream(&self, messages: &[Message], run: RunOptions) -> Result<ResponseStream> {
        let (tx, rx) = mpsc::channel(self.options.backend.stream_buffer.max(1));
        let turn = self.start_turn(messages, &run, Some(tx)).await?;
        let span = turn.span.clone();
        let claim = turn.claim.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = tokio::spawn(
            async move {
                let _ = outcome_tx.send(drive(turn).await);
            }
            .instrument(span),
        );
        Ok(ResponseStream {
            chunks: ReceiverStream::new(rx),
            outcome: Some(outcome_rx),
            task,
            claim,
        })
    }

    /// Close the session; later turns fail until [`reset_session`](Self::reset_session)
    pub fn close_session(&self) {
        self.session.close("closed by caller");
    }

    /// Forget the backend session and usage history
    pub fn reset_session(&self) {
        self.session.reset();
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    /// Close the session and stop the backend process
    pub async fn shutdown(&self) {
        self.session.close("adapter shut down");
        self.transport.shutdown().await;
    }

    async fn start_turn(
        &self,
        messages: &[Message],
        run: &RunOptions,
        chunks: Option<mpsc::Sender<ResponseChunk>>,
    ) -> Result<TurnContext> {
        let mut payload = translate(messages, &self.options, &self.registry, run)?;
        let guard = self.session.begin_turn(&mut payload)?;

        let span = tracing::info_span!(
            "a3s.local_model.turn",
            a3s.session.id = payload.resume.as_deref().unwrap_or("none"),
            a3s.local_model.turn_number = guard.turn_number(),
            a3s.local_model.max_turns = self.session.max_turns(),
            a3s.local_model.tool_calls_count = tracing::field::Empty,
            a3s.llm.prompt_tokens = tracing::field::Empty,
            a3s.llm.completion_tokens = tracing::field::Empty,
            a3s.llm.total_tokens = tracing::field::Empty,
            a3s.llm.cost_usd = tracing::field::Empty,
            a3s.llm.stop_reason = tracing::field::Empty,
        );

        let frames = match self.transport.send(&payload).instrument(span.clone()).await {
            Ok(frames) => frames,
            Err(e) => {
                span.in_scope(|| tracing::warn!("Failed to start turn: {}", e));
                guard.fail(&e);
                return Err(e);
            }
        };

        let mut aggregator = ResponseAggregator::new(self.gateway_for(&payload))
            .with_callback(self.callback.clone())
            .with_metrics(Arc::clone(&self.metrics))
            .with_strict_tool_resolution(self.options.strict_tool_resolution)
            .with_model(self.options.model.clone());
        if let Some(tx) = chunks {
            aggregator = aggregator.with_chunks(tx);
        }

        Ok(TurnContext {
            claim: TurnClaim::new(guard, frames.release_handle()),
            frames,
            aggregator,
            span,
        })
    }

    /// Gateway matching the allow list actually sent for this turn
    fn gateway_for(&self, payload: &RequestPayload) -> Arc<PermissionGateway> {
        if payload.allowed_tools == self.options.allowed_tools {
            return Arc::clone(&self.gateway);
        }
        let allow = payload
            .allowed_tools
            .iter()
            .cloned()
            .chain(self.registry.permission_rules());
        Arc::new(PermissionGateway::new(
            allow,
            &payload.disallowed_tools,
            payload.permission_mode,
        ))
    }
}

async fn drive(turn: TurnContext) -> Result<Response> {
    let TurnContext {
        claim,
        frames,
        aggregator,
        ..
    } = turn;
    let result = aggregator.aggregate(frames).await;
    let Some(guard) = claim.take() else {
        tracing::debug!("Turn finished after its caller abandoned it");
        return result;
    };
    match result {
        Ok(response) => {
            let state = guard.complete(response.session_id.clone());
            tracing::info!(
                session_id = response.session_id.as_deref().unwrap_or("none"),
                tool_calls = response.tool_calls.len(),
                duration_ms = response.duration_ms,
                state = %state,
                "Turn completed"
            );
            Ok(response)
        }
        Err(e) => {
            let state = guard.fail(&e);
            tracing::warn!(kind = ?e.kind(), state = %state, "Turn failed: {}", e);
            Err(e)
        }
    }
}

/// Partial output of a streaming turn
///
/// Dropping it before the turn ends cancels the turn: the session and the
/// transport are free for the next turn as soon as the drop returns, the
/// backend stream is closed, and the session stays `Active` without a
/// finalized response.
pub struct ResponseStream {
    chunks: ReceiverStream<ResponseChunk>,
    outcome: Option<oneshot::Receiver<Result<Response>>>,
    task: JoinHandle<()>,
    claim: TurnClaim,
}

impl ResponseStream {
    pub async fn next_chunk(&mut self) -> Option<ResponseChunk> {
        self.chunks.next().await
    }

    /// Drain remaining chunks and wait for the final response
    pub async fn finish(mut self) -> Result<Response> {
        while self.chunks.next().await.is_some() {}
        let outcome = self
            .outcome
            .take()
            .ok_or_else(|| LocalModelError::connection("turn result already taken"))?;
        outcome
            .await
            .unwrap_or_else(|_| Err(LocalModelError::connection("turn ended without a result")))
    }

    /// Abandon the turn
    pub fn cancel(self) {}
}

impl Stream for ResponseStream {
    type Item = ResponseChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.task.abort();
        self.claim.abandon();
    }
}

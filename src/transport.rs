//! Transport channel to the backend process
//!
//! A [`Transport`] sends one request per turn and hands back a
//! [`FrameStream`]: a finite, non-restartable sequence of decoded reply
//! frames fed through a bounded channel. When the channel is full the reader
//! stops draining backend stdout until the consumer catches up.
//!
//! [`CliTransport`] is the subprocess implementation. The backend process is
//! spawned lazily on the first turn and reused for later turns. Each turn
//! borrows the connection for its reader task; the connection returns to the
//! transport only when the turn reaches a terminal frame. Cancellation,
//! timeouts, protocol errors and crashes all tear the process down, and the
//! next turn reconnects.

use crate::config::BackendConfig;
use crate::error::{LocalModelError, Result};
use crate::frame::{decode_line, encode_permission, encode_request, PermissionReply, ReplyFrame, RequestPayload};
use crate::locate::locate_backend;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::Instrument;

/// Grace period for collecting an exit status after stdout closes
const EXIT_STATUS_WAIT_MS: u64 = 500;

/// Sends turns to the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and open its reply stream
    async fn send(&self, payload: &RequestPayload) -> Result<FrameStream>;

    /// Tear down the backend connection; the next send reconnects
    async fn shutdown(&self);

    fn is_connected(&self) -> bool;
}

/// Reply frames of one turn
///
/// Dropping the stream before its terminal frame abandons the turn and frees
/// the transport for the next one right away.
pub struct FrameStream {
    frames: ReceiverStream<Result<ReplyFrame>>,
    control: mpsc::UnboundedSender<PermissionReply>,
    release: ReleaseHandle,
}

/// Frees a transport held by an in-flight turn
///
/// Lets the owner of a turn give the transport back the moment it abandons
/// the turn, even while the [`FrameStream`] itself is still being torn down
/// on another task. Releasing after the turn already ended is a no-op.
#[derive(Clone, Default)]
pub struct ReleaseHandle {
    lease: Option<Arc<SlotLease>>,
}

impl ReleaseHandle {
    pub fn release(&self) {
        if let Some(lease) = &self.lease {
            lease.release();
        }
    }
}

/// One turn's claim on a [`CliTransport`] slot
struct SlotLease {
    slot: Arc<Mutex<Slot>>,
    id: u64,
}

impl SlotLease {
    fn release(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.lease == Some(self.id) {
            slot.lease = None;
            tracing::debug!(lease = self.id, "Transport released by abandoned turn");
        }
    }
}

/// Producer side of a [`FrameStream`]
pub struct FrameSink {
    frames: mpsc::Sender<Result<ReplyFrame>>,
    control: mpsc::UnboundedReceiver<PermissionReply>,
}

impl FrameStream {
    /// Bounded frame channel; `capacity` is clamped to at least 1
    pub fn channel(capacity: usize) -> (FrameSink, FrameStream) {
        let capacity = capacity.max(1);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        // At most one reply per request frame, so the control side never needs to block
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            FrameSink {
                frames: frame_tx,
                control: control_rx,
            },
            FrameStream {
                frames: ReceiverStream::new(frame_rx),
                control: control_tx,
                release: ReleaseHandle::default(),
            },
        )
    }

    fn with_lease(mut self, lease: SlotLease) -> Self {
        self.release = ReleaseHandle {
            lease: Some(Arc::new(lease)),
        };
        self
    }

    /// Handle that frees the transport without waiting for this stream to drop
    pub fn release_handle(&self) -> ReleaseHandle {
        self.release.clone()
    }

    pub async fn next_frame(&mut self) -> Option<Result<ReplyFrame>> {
        self.frames.next().await
    }

    /// Forward a permission answer to the backend
    ///
    /// Returns false when the producer already finished the turn.
    pub fn reply_permission(&self, reply: PermissionReply) -> bool {
        self.control.send(reply).is_ok()
    }
}

impl Stream for FrameStream {
    type Item = Result<ReplyFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.release.release();
    }
}

impl FrameSink {
    /// Push a frame; false once the consumer is gone
    pub async fn send(&self, frame: ReplyFrame) -> bool {
        self.frames.send(Ok(frame)).await.is_ok()
    }

    /// Fail the stream with an error
    pub async fn fail(&self, error: LocalModelError) -> bool {
        self.frames.send(Err(error)).await.is_ok()
    }

    pub async fn next_permission(&mut self) -> Option<PermissionReply> {
        self.control.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    /// Resolves once the consumer dropped its stream
    pub async fn closed(&self) {
        self.frames.closed().await
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<Result<ReplyFrame>>,
        mpsc::UnboundedReceiver<PermissionReply>,
    ) {
        (self.frames, self.control)
    }
}

/// A live backend process
struct Connection {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    lines_read: u64,
}

impl Connection {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code())
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn wait_exit_code(&mut self) -> Option<i32> {
        let wait = tokio::time::timeout(
            Duration::from_millis(EXIT_STATUS_WAIT_MS),
            self.child.wait(),
        );
        match wait.await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        }
    }

    fn kill(mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Backend process already gone: {}", e);
        }
    }
}

#[derive(Default)]
struct Slot {
    conn: Option<Connection>,
    /// Id of the turn currently holding the slot
    lease: Option<u64>,
    leases_issued: u64,
}

/// Subprocess transport speaking newline-delimited JSON over stdin/stdout
pub struct CliTransport {
    config: BackendConfig,
    slot: Arc<Mutex<Slot>>,
    shutdown_tx: watch::Sender<u64>,
}

impl CliTransport {
    pub fn new(config: BackendConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(0);
        Self {
            config,
            slot: Arc::new(Mutex::new(Slot::default())),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the idle connection (if any) under a fresh lease
    fn checkout(&self) -> Result<(Option<Connection>, u64)> {
        let mut slot = self.lock();
        if slot.lease.is_some() {
            return Err(LocalModelError::SessionBusy);
        }
        slot.leases_issued += 1;
        let id = slot.leases_issued;
        slot.lease = Some(id);
        Ok((slot.conn.take(), id))
    }

    fn release(&self, lease: u64) {
        let mut slot = self.lock();
        if slot.lease == Some(lease) {
            slot.lease = None;
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let program = locate_backend(&self.config.program)?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            LocalModelError::connection(format!(
                "failed to spawn backend {}: {}",
                program.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LocalModelError::connection("backend stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LocalModelError::connection("backend stdout unavailable"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "a3s_local_model::backend", "{}", line);
                }
            });
        }

        tracing::info!(
            program = %program.display(),
            pid = child.id().unwrap_or_default(),
            "Backend process started"
        );

        Ok(Connection {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            lines_read: 0,
        })
    }

    /// Write the request, reusing the idle connection when it is still alive
    async fn open_turn(&self, conn: Option<Connection>, request: &str) -> Result<Connection> {
        if let Some(mut existing) = conn {
            if existing.has_exited() {
                tracing::warn!(
                    exit_code = ?existing.exit_code(),
                    "Backend exited between turns, reconnecting"
                );
            } else {
                match existing.write_line(request).await {
                    Ok(()) => {
                        tracing::debug!("Reusing backend connection");
                        return Ok(existing);
                    }
                    Err(e) => tracing::warn!("Backend connection unusable, reconnecting: {}", e),
                }
            }
        }

        let mut fresh = self.connect().await?;
        match fresh.write_line(request).await {
            Ok(()) => Ok(fresh),
            Err(e) => {
                let exit_code = fresh.wait_exit_code().await;
                Err(LocalModelError::BackendConnection {
                    reason: format!("failed to write request: {}", e),
                    exit_code,
                })
            }
        }
    }
}

#[async_trait]
impl Transport for CliTransport {
    async fn send(&self, payload: &RequestPayload) -> Result<FrameStream> {
        let request = encode_request(payload)?;
        let (existing, lease) = self.checkout()?;

        let span = tracing::info_span!(
            "a3s.local_model.transport.send",
            a3s.session.id = payload.resume.as_deref().unwrap_or("none"),
            a3s.backend.program = %self.config.program,
        );
        let conn = match self.open_turn(existing, &request).instrument(span).await {
            Ok(conn) => conn,
            Err(e) => {
                self.release(lease);
                return Err(e);
            }
        };

        let (sink, stream) = FrameStream::channel(self.config.stream_buffer);
        let stream = stream.with_lease(SlotLease {
            slot: Arc::clone(&self.slot),
            id: lease,
        });
        let pump = Pump {
            slot: Arc::clone(&self.slot),
            lease,
            shutdown_rx: self.shutdown_tx.subscribe(),
            frame_timeout: self.config.frame_timeout(),
        };
        tokio::spawn(pump.run(conn, sink).in_current_span());

        Ok(stream)
    }

    async fn shutdown(&self) {
        let conn = {
            let mut slot = self.lock();
            slot.lease = None;
            slot.conn.take()
        };
        self.shutdown_tx.send_modify(|epoch| *epoch += 1);
        if let Some(conn) = conn {
            tracing::info!("Shutting down backend process");
            conn.kill();
        }
    }

    fn is_connected(&self) -> bool {
        let slot = self.lock();
        slot.lease.is_some() || slot.conn.is_some()
    }
}

enum PumpOutcome {
    /// Terminal frame read; connection can serve the next turn
    Completed,
    /// Consumer dropped the stream or the transport shut down
    Abandoned,
    /// Timeout, protocol error or crash
    Broken,
}

type LastItem = Option<Result<ReplyFrame>>;

/// Per-turn reader: decodes stdout lines into frames and forwards permission replies
struct Pump {
    slot: Arc<Mutex<Slot>>,
    lease: u64,
    shutdown_rx: watch::Receiver<u64>,
    frame_timeout: Duration,
}

impl Pump {
    async fn run(mut self, mut conn: Connection, sink: FrameSink) {
        let (frames, mut control) = sink.into_parts();
        let (outcome, last) = self.drive(&mut conn, &frames, &mut control).await;

        // Hand the connection back before the consumer sees the final item,
        // so a follow-up turn never finds the transport still busy. A lease
        // that is no longer current was abandoned or shut down, and the slot
        // may already serve another turn.
        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            let current = slot.lease == Some(self.lease);
            if current {
                slot.lease = None;
            }
            if current && matches!(outcome, PumpOutcome::Completed) {
                slot.conn = Some(conn);
            } else {
                drop(slot);
                conn.kill();
            }
        }

        if let Some(item) = last {
            let _ = frames.send(item).await;
        }
    }

    async fn drive(
        &mut self,
        conn: &mut Connection,
        frames: &mpsc::Sender<Result<ReplyFrame>>,
        control: &mut mpsc::UnboundedReceiver<PermissionReply>,
    ) -> (PumpOutcome, LastItem) {
        // Silence is measured only while waiting on the backend: the clock
        // restarts after every hand-off and stops while a tool call awaits
        // its permission reply.
        let mut deadline = tokio::time::Instant::now() + self.frame_timeout;
        let mut awaiting_replies = 0usize;
        let mut control_open = true;

        loop {
            tokio::select! {
                biased;

                _ = frames.closed() => {
                    tracing::debug!("Turn abandoned by consumer");
                    return (PumpOutcome::Abandoned, None);
                }

                _ = self.shutdown_rx.changed() => {
                    return (PumpOutcome::Abandoned, None);
                }

                reply = control.recv(), if control_open => {
                    let Some(reply) = reply else {
                        control_open = false;
                        continue;
                    };
                    let line = match encode_permission(&reply) {
                        Ok(line) => line,
                        Err(e) => return (PumpOutcome::Broken, Some(Err(e))),
                    };
                    if let Err(e) = conn.write_line(&line).await {
                        let error = LocalModelError::BackendConnection {
                            reason: format!("failed to write permission reply: {}", e),
                            exit_code: conn.exit_code(),
                        };
                        return (PumpOutcome::Broken, Some(Err(error)));
                    }
                    awaiting_replies = awaiting_replies.saturating_sub(1);
                    deadline = tokio::time::Instant::now() + self.frame_timeout;
                }

                line = conn.stdout.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            let exit_code = conn.wait_exit_code().await;
                            tracing::warn!(?exit_code, "Backend closed its output mid-turn");
                            let error = LocalModelError::BackendConnection {
                                reason: "backend closed its output before the turn ended".to_string(),
                                exit_code,
                            };
                            return (PumpOutcome::Broken, Some(Err(error)));
                        }
                        Err(e) => {
                            let error = LocalModelError::BackendConnection {
                                reason: format!("failed to read backend output: {}", e),
                                exit_code: conn.exit_code(),
                            };
                            return (PumpOutcome::Broken, Some(Err(error)));
                        }
                    };

                    conn.lines_read += 1;
                    match decode_line(conn.lines_read, &line) {
                        Ok(None) => {}
                        Ok(Some(frame)) if frame.is_terminal() => {
                            return (PumpOutcome::Completed, Some(Ok(frame)));
                        }
                        Ok(Some(frame)) => {
                            tracing::trace!(kind = frame.kind(), "Decoded frame");
                            if matches!(frame, ReplyFrame::ToolCallRequest { .. }) {
                                awaiting_replies += 1;
                            }
                            if frames.send(Ok(frame)).await.is_err() {
                                return (PumpOutcome::Abandoned, None);
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Undecodable backend output: {}", e);
                            return (PumpOutcome::Broken, Some(Err(e)));
                        }
                    }
                    deadline = tokio::time::Instant::now() + self.frame_timeout;
                }

                _ = tokio::time::sleep_until(deadline), if awaiting_replies == 0 => {
                    let timeout_ms = self.frame_timeout.as_millis() as u64;
                    tracing::warn!(timeout_ms, "No frame from backend within timeout");
                    let error = LocalModelError::BackendTimeout { timeout_ms };
                    return (PumpOutcome::Broken, Some(Err(error)));
                }
            }
        }
    }
}

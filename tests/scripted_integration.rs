//! Scripted transport integration tests
//!
//! End-to-end turns through `LocalModel` against an in-memory transport that
//! replays one script per turn. Covers translation, aggregation, permission
//! gating, session limits, cancellation and failure handling.

use a3s_local_model::{
    FrameStream, LocalModel, LocalModelError, McpServerSpec, Message, ModelOptions,
    PermissionMode, PermissionReply, ReplyDecision, ReplyFrame, RequestPayload, ResponseChunk,
    RunOptions, SessionState, ToolCallStatus, Transport, UsageStats,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Script {
    /// Send the frames, then collect permission replies
    Frames(Vec<ReplyFrame>),
    /// Send the frames, then wait for the consumer to go away
    Stall(Vec<ReplyFrame>),
    /// Send the frames, then fail the stream
    Fail(Vec<ReplyFrame>, LocalModelError),
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    payloads: Mutex<Vec<RequestPayload>>,
    replies: Arc<Mutex<Vec<PermissionReply>>>,
    abandoned: Arc<AtomicBool>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    fn sends(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }

    fn payload(&self, turn: usize) -> RequestPayload {
        self.payloads.lock().unwrap()[turn].clone()
    }

    fn replies(&self) -> Vec<PermissionReply> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, payload: &RequestPayload) -> a3s_local_model::Result<FrameStream> {
        self.payloads.lock().unwrap().push(payload.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no script left for this turn");

        let (mut sink, stream) = FrameStream::channel(8);
        let replies = Arc::clone(&self.replies);
        let abandoned = Arc::clone(&self.abandoned);
        tokio::spawn(async move {
            match script {
                Script::Frames(frames) => {
                    for frame in frames {
                        sink.send(frame).await;
                    }
                    while let Some(reply) = sink.next_permission().await {
                        replies.lock().unwrap().push(reply);
                    }
                }
                Script::Stall(frames) => {
                    for frame in frames {
                        sink.send(frame).await;
                    }
                    sink.closed().await;
                    abandoned.store(true, Ordering::SeqCst);
                }
                Script::Fail(frames, error) => {
                    for frame in frames {
                        sink.send(frame).await;
                    }
                    sink.fail(error).await;
                }
            }
        });
        Ok(stream)
    }

    async fn shutdown(&self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

fn text(t: &str) -> ReplyFrame {
    ReplyFrame::TextDelta { text: t.into() }
}

fn usage(input: u64, output: u64) -> ReplyFrame {
    ReplyFrame::UsageFinal(UsageStats::tokens(input, output))
}

fn end(session: &str) -> ReplyFrame {
    ReplyFrame::EndOfTurn {
        session_id: Some(session.into()),
        stop_reason: Some("end_turn".into()),
    }
}

fn tool_request(id: &str, name: &str) -> ReplyFrame {
    ReplyFrame::ToolCallRequest {
        id: id.into(),
        name: name.into(),
        input: json!({"command": "ls -la"}),
    }
}

fn tool_result(id: &str) -> ReplyFrame {
    ReplyFrame::ToolCallResult {
        id: id.into(),
        output: json!("total 0"),
        is_error: false,
    }
}

fn simple_turn(session: &str) -> Script {
    Script::Frames(vec![text("ok"), usage(1, 1), end(session)])
}

// ─── End-to-end scenarios ────────────────────────────────────────

#[tokio::test]
async fn test_terse_arithmetic() {
    let transport = ScriptedTransport::new(vec![Script::Frames(vec![
        text("4"),
        usage(4, 1),
        ReplyFrame::EndOfTurn {
            session_id: None,
            stop_reason: None,
        },
    ])]);
    let model = LocalModel::with_transport(ModelOptions::default(), transport.clone()).unwrap();

    let response = model
        .run(&[Message::system("be terse"), Message::user("2+2?")])
        .await
        .unwrap();

    assert_eq!(response.text, "4");
    assert_eq!(response.usage.input_tokens, Some(4));
    assert_eq!(response.usage.output_tokens, Some(1));
    assert_eq!(response.usage.cache_read_input_tokens, None);
    assert!(response.tool_calls.is_empty());
    assert_eq!(model.usage(), UsageStats::tokens(4, 1));

    let payload = transport.payload(0);
    assert_eq!(payload.prompt, "2+2?");
    assert_eq!(payload.system_prompt.as_deref(), Some("be terse"));
}

#[tokio::test]
async fn test_bash_denied_under_read_only_allow_list() {
    let transport = ScriptedTransport::new(vec![Script::Frames(vec![
        tool_request("t1", "Bash"),
        end("s1"),
    ])]);
    let options = ModelOptions::default()
        .with_allowed_tools(["Read"])
        .with_permission_mode(PermissionMode::Default);
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();

    let mut stream = model
        .run_stream(&[Message::user("list files")], RunOptions::default())
        .await
        .unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().await {
        chunks.push(chunk);
    }
    let response = stream.finish().await.unwrap();

    assert!(!chunks
        .iter()
        .any(|c| matches!(c, ResponseChunk::ToolCallPending { .. })));
    assert!(chunks
        .iter()
        .any(|c| matches!(c, ResponseChunk::ToolCallDenied { .. })));

    let call = response.tool_call("t1").unwrap();
    assert!(matches!(call.status, ToolCallStatus::Denied { .. }));
    assert_eq!(response.pending_tool_calls().count(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let replies = transport.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].tool_call_id, "t1");
    assert_eq!(replies[0].decision, ReplyDecision::Deny);
}

#[tokio::test]
async fn test_both_lists_deny_in_every_mode() {
    for mode in [
        PermissionMode::Default,
        PermissionMode::AcceptEdits,
        PermissionMode::BypassPermissions,
    ] {
        let transport = ScriptedTransport::new(vec![Script::Frames(vec![
            tool_request("t1", "Write"),
            end("s1"),
        ])]);
        let options = ModelOptions::default()
            .with_allowed_tools(["Write"])
            .with_disallowed_tools(["Write"])
            .with_permission_mode(mode);
        let model = LocalModel::with_transport(options, transport).unwrap();
        let response = model.run(&[Message::user("write it")]).await.unwrap();
        assert!(
            response.tool_call("t1").unwrap().is_denied(),
            "mode {mode} should deny a tool in both lists"
        );
    }
}

#[tokio::test]
async fn test_bypass_allows_every_request() {
    let transport = ScriptedTransport::new(vec![Script::Frames(vec![
        tool_request("t1", "Bash"),
        tool_request("t2", "WebFetch"),
        tool_result("t1"),
        tool_result("t2"),
        end("s1"),
    ])]);
    let options = ModelOptions::default()
        .with_disallowed_tools(["Bash"])
        .with_permission_mode(PermissionMode::BypassPermissions);
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();

    let response = model.run(&[Message::user("go")]).await.unwrap();
    assert!(response.tool_calls.iter().all(|c| !c.is_denied()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport
        .replies()
        .iter()
        .all(|r| r.decision == ReplyDecision::Allow));
}

#[tokio::test]
async fn test_accept_edits_allows_edit_tools() {
    let transport = ScriptedTransport::new(vec![Script::Frames(vec![
        tool_request("t1", "Edit"),
        tool_request("t2", "Bash"),
        tool_result("t1"),
        end("s1"),
    ])]);
    let options = ModelOptions::default().with_permission_mode(PermissionMode::AcceptEdits);
    let model = LocalModel::with_transport(options, transport).unwrap();

    let response = model.run(&[Message::user("fix the typo")]).await.unwrap();
    assert!(matches!(
        response.tool_call("t1").unwrap().status,
        ToolCallStatus::Completed { .. }
    ));
    assert!(response.tool_call("t2").unwrap().is_denied());
}

// ─── Sessions ────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_limit_refuses_without_backend_call() {
    let transport = ScriptedTransport::new(vec![simple_turn("s1"), simple_turn("s1")]);
    let options = ModelOptions::default()
        .with_continue_conversation(true)
        .with_max_turns(2);
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();

    model.run(&[Message::user("one")]).await.unwrap();
    model.run(&[Message::user("two")]).await.unwrap();
    assert_eq!(model.session_state(), SessionState::Exhausted);

    let err = model.run(&[Message::user("three")]).await.unwrap_err();
    assert!(matches!(
        err,
        LocalModelError::SessionLimit {
            turns: 2,
            max_turns: 2
        }
    ));
    assert_eq!(transport.sends(), 2);

    assert!(transport.payload(0).resume.is_none());
    assert_eq!(transport.payload(1).resume.as_deref(), Some("s1"));
    assert!(transport.payload(1).continue_conversation);
    assert_eq!(model.cumulative_usage(), UsageStats::tokens(2, 2));
}

#[tokio::test]
async fn test_stateless_calls_never_continue() {
    let transport = ScriptedTransport::new(vec![simple_turn("s1"), simple_turn("s2")]);
    let model = LocalModel::with_transport(ModelOptions::default(), transport.clone()).unwrap();

    model.run(&[Message::user("one")]).await.unwrap();
    model.run(&[Message::user("two")]).await.unwrap();

    assert!(transport.payload(1).resume.is_none());
    assert!(!transport.payload(1).continue_conversation);
    assert!(model.session_id().is_none());
    assert_eq!(model.session_state(), SessionState::NoSession);
}

#[tokio::test]
async fn test_resume_attaches_existing_session() {
    let transport = ScriptedTransport::new(vec![simple_turn("prior")]);
    let options = ModelOptions::default()
        .with_continue_conversation(true)
        .with_max_turns(5)
        .with_resume("prior");
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();
    assert_eq!(model.session_state(), SessionState::Active);

    model.run(&[Message::user("where were we")]).await.unwrap();
    assert_eq!(transport.payload(0).resume.as_deref(), Some("prior"));
}

#[tokio::test]
async fn test_cancel_leaves_session_active() {
    let transport = ScriptedTransport::new(vec![
        Script::Stall(vec![text("thinking")]),
        simple_turn("s2"),
    ]);
    let options = ModelOptions::default()
        .with_continue_conversation(true)
        .with_max_turns(3);
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();

    let mut stream = model
        .run_stream(&[Message::user("long task")], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(stream.next_chunk().await, Some(text_chunk("thinking")));
    stream.cancel();

    assert_eq!(model.session_state(), SessionState::Active);
    assert!(!model.session().is_busy());
    assert_eq!(model.session().turn_count(), 0);

    let response = model.run(&[Message::user("short task")]).await.unwrap();
    assert_eq!(response.text, "ok");
    assert_eq!(model.session().turn_count(), 1);

    // the cancelled turn's frame stream is closed as well
    tokio::time::timeout(Duration::from_secs(2), async {
        while !transport.abandoned.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frame stream should be closed on cancel");
}

#[tokio::test]
async fn test_dropped_stream_frees_session_immediately() {
    let transport = ScriptedTransport::new(vec![
        Script::Stall(vec![text("thinking")]),
        simple_turn("s1"),
    ]);
    let model = LocalModel::with_transport(ModelOptions::default(), transport.clone()).unwrap();

    let stream = model
        .run_stream(&[Message::user("long task")], RunOptions::default())
        .await
        .unwrap();
    assert!(model.session().is_busy());
    drop(stream);

    let response = model.run(&[Message::user("next")]).await.unwrap();
    assert_eq!(response.text, "ok");
    assert_eq!(transport.sends(), 2);
}

#[tokio::test]
async fn test_second_turn_while_busy_is_refused() {
    let transport = ScriptedTransport::new(vec![Script::Stall(vec![text("…")])]);
    let model = LocalModel::with_transport(ModelOptions::default(), transport.clone()).unwrap();

    let mut stream = model
        .run_stream(&[Message::user("first")], RunOptions::default())
        .await
        .unwrap();
    assert!(stream.next_chunk().await.is_some());

    let err = model.run(&[Message::user("second")]).await.unwrap_err();
    assert!(matches!(err, LocalModelError::SessionBusy));
    assert_eq!(transport.sends(), 1);
    drop(stream);
}

// ─── Failures ────────────────────────────────────────────────────

#[tokio::test]
async fn test_protocol_error_keeps_streamed_text() {
    let transport = ScriptedTransport::new(vec![
        Script::Fail(
            vec![text("partial ")],
            LocalModelError::BackendProtocol {
                line: 2,
                reason: "expected value".into(),
            },
        ),
        simple_turn("s1"),
    ]);
    let options = ModelOptions::default()
        .with_continue_conversation(true)
        .with_max_turns(3);
    let model = LocalModel::with_transport(options, transport).unwrap();

    let mut stream = model
        .run_stream(&[Message::user("go")], RunOptions::default())
        .await
        .unwrap();
    assert_eq!(stream.next_chunk().await, Some(text_chunk("partial ")));
    let err = stream.finish().await.unwrap_err();
    assert!(matches!(err, LocalModelError::BackendProtocol { line: 2, .. }));
    assert!(err.is_mid_stream());

    assert_eq!(model.session_state(), SessionState::Active);
    assert!(model.run(&[Message::user("retry")]).await.is_ok());
}

#[tokio::test]
async fn test_timeout_closes_session() {
    let transport = ScriptedTransport::new(vec![Script::Fail(
        vec![],
        LocalModelError::BackendTimeout { timeout_ms: 50 },
    )]);
    let options = ModelOptions::default().with_continue_conversation(true);
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();

    let err = model.run(&[Message::user("hello")]).await.unwrap_err();
    assert!(matches!(err, LocalModelError::BackendTimeout { .. }));
    assert_eq!(model.session_state(), SessionState::Closed);

    let err = model.run(&[Message::user("hello again")]).await.unwrap_err();
    assert!(matches!(err, LocalModelError::SessionClosed { .. }));
    assert_eq!(transport.sends(), 1);
}

#[tokio::test]
async fn test_backend_error_frame_is_reported_verbatim() {
    let transport = ScriptedTransport::new(vec![Script::Frames(vec![ReplyFrame::Error {
        message: "prompt is too long".into(),
        code: Some("invalid_request".into()),
        data: Some(json!({"limit": 200000})),
    }])]);
    let model = LocalModel::with_transport(ModelOptions::default(), transport).unwrap();

    match model.run(&[Message::user("huge")]).await {
        Err(LocalModelError::BackendReported {
            message,
            code,
            data,
        }) => {
            assert_eq!(message, "prompt is too long");
            assert_eq!(code.as_deref(), Some("invalid_request"));
            assert_eq!(data, Some(json!({"limit": 200000})));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

// ─── MCP ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mcp_tools_forwarded_and_allowed() {
    let transport = ScriptedTransport::new(vec![Script::Frames(vec![
        tool_request("t1", "mcp__github__create_issue"),
        tool_request("t2", "mcp__github__delete_repo"),
        tool_result("t1"),
        end("s1"),
    ])]);
    let options = ModelOptions::default()
        .with_mcp_server(McpServerSpec::stdio(
            "github",
            "npx",
            vec!["-y".into(), "@modelcontextprotocol/server-github".into()],
        ))
        .with_mcp_tools(["github.create_issue"]);
    let model = LocalModel::with_transport(options, transport.clone()).unwrap();

    let response = model.run(&[Message::user("file a bug")]).await.unwrap();
    assert!(!response.tool_call("t1").unwrap().is_denied());
    assert!(response.tool_call("t2").unwrap().is_denied());

    let mcp = transport.payload(0).mcp.expect("mcp section");
    assert!(mcp.servers.contains_key("github"));
    assert_eq!(mcp.enabled_tools, vec!["github.create_issue"]);
}

fn text_chunk(t: &str) -> ResponseChunk {
    ResponseChunk::TextDelta { text: t.into() }
}

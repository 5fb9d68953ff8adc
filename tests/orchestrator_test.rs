//! Orchestrator scenarios with a scripted chat backend.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use llmcmd::dispatch::ToolDispatcher;
use llmcmd::llm::ChatBackend;
use llmcmd::orchestrator::{Orchestrator, SessionConfig};
use llmcmd::quota::{QuotaManager, QuotaWeights};
use llmcmd::stream::anon_pipe;
use llmcmd::transcript::SystemPrompt;
use llmcmd::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, Role, ToolCallRequest, UsageBlock,
};
use llmcmd::vfs::SharedBuffer;
use llmcmd::{EXIT_BUDGET, Error, Result};

/// Replays a fixed sequence of assistant replies and records every request
/// it saw, so tests can assert on the advertised tools.
struct ScriptedBackend {
    replies: Mutex<VecDeque<ChatMessage>>,
    requests: Mutex<Vec<ChatRequest>>,
    /// Reply produced when the script runs dry.
    fallback: ChatMessage,
}

impl ScriptedBackend {
    fn new(replies: Vec<ChatMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            fallback: assistant_with_calls(vec![tool_call("fallback", "read", json!({"fd": 0}))]),
        }
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let message = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(ChatResponse {
            choices: vec![Choice {
                message,
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: Some(UsageBlock {
                prompt_tokens: 120,
                completion_tokens: 15,
                total_tokens: 135,
                prompt_tokens_details: None,
            }),
        })
    }
}

/// A backend that always fails, for transport-error paths.
struct FailingBackend;

#[async_trait]
impl ChatBackend for FailingBackend {
    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Err(Error::http_status(404, "no such model"))
    }
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, args.to_string())
}

fn assistant_with_calls(calls: Vec<ToolCallRequest>) -> ChatMessage {
    ChatMessage::assistant_with_calls("", calls)
}

struct Session {
    dispatcher: ToolDispatcher,
    stdout: SharedBuffer,
    config: SessionConfig,
}

async fn session_with_stdin(input: &[u8]) -> Session {
    let (stdin, feeder) = anon_pipe();
    let payload = input.to_vec();
    tokio::spawn(async move {
        let _ = feeder.write_all(&payload).await;
        let _ = feeder.send_eof().await;
    });

    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();
    let dispatcher = ToolDispatcher::new(
        stdin,
        stdout.writer(),
        stderr.writer(),
        vec![],
        vec![],
        false,
    )
    .await
    .unwrap();

    let config = SessionConfig {
        model: "test-model".to_string(),
        prompt: "do the task".to_string(),
        max_calls: 10,
        ..SessionConfig::default()
    };
    Session {
        dispatcher,
        stdout,
        config,
    }
}

#[tokio::test]
async fn echo_and_exit_scenario() {
    let session = session_with_stdin(b"hello\n").await;
    let backend = Arc::new(ScriptedBackend::new(vec![assistant_with_calls(vec![
        tool_call("c1", "read", json!({"fd": 0})),
        tool_call("c2", "write", json!({"fd": 1, "data": "HELLO", "newline": true})),
        tool_call("c3", "exit", json!({"code": 0})),
    ])]));
    let quota = Arc::new(QuotaManager::unlimited());

    let outcome = Orchestrator::new(
        backend.clone(),
        session.dispatcher,
        quota.clone(),
        session.config,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.calls_used, 1);
    assert_eq!(session.stdout.snapshot(), b"HELLO\n");
    // The call consumed tokens: quota accounting is non-zero.
    assert!(quota.snapshot().total_weighted > 0.0);
}

#[tokio::test]
async fn grep_pipeline_scenario() {
    let session = session_with_stdin(b"apple\nbanana\ncherry\napricot\n").await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        assistant_with_calls(vec![tool_call(
            "c1",
            "spawn",
            json!({"script": "grep ^ap", "in_fd": 0, "out_fd": 1}),
        )]),
        assistant_with_calls(vec![tool_call("c2", "exit", json!({"code": 0}))]),
    ]));

    let outcome = Orchestrator::new(
        backend,
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        session.config,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(session.stdout.snapshot(), b"apple\napricot\n");
}

#[tokio::test]
async fn budget_exhaustion_forces_terminal_mode_then_exit_code_three() {
    let mut session = session_with_stdin(b"").await;
    session.config.max_calls = 3;

    // The model ignores every hint and keeps reading stdin.
    let backend = Arc::new(ScriptedBackend::new(vec![
        assistant_with_calls(vec![tool_call("c1", "read", json!({"fd": 0}))]),
        assistant_with_calls(vec![tool_call("c2", "read", json!({"fd": 0}))]),
        assistant_with_calls(vec![tool_call("c3", "read", json!({"fd": 0}))]),
    ]));

    let outcome = Orchestrator::new(
        backend.clone(),
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        session.config,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, EXIT_BUDGET);
    assert_eq!(outcome.calls_used, 3);

    // The final request advertised only the exit tool.
    let requests = backend.requests();
    assert_eq!(requests.len(), 3);
    let last_tools = requests[2].tools.as_ref().unwrap();
    assert_eq!(last_tools.len(), 1);
    assert_eq!(last_tools[0].function.name, "exit");
    // Earlier requests advertised the full surface.
    assert_eq!(requests[0].tools.as_ref().unwrap().len(), 7);

    // The terminal turn was announced in the transcript.
    let last_messages = &requests[2].messages;
    assert!(
        last_messages
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("exit tool")),
        "terminal notice missing from transcript"
    );
}

#[tokio::test]
async fn quota_reserve_triggers_terminal_mode() {
    let session = session_with_stdin(b"").await;
    // Budget of 2500 weighted tokens; each scripted call consumes
    // 120 + 15*4 = 180. After three calls 1960 remain, inside the
    // 2000-token response reserve: the fourth request must go terminal.
    let quota = Arc::new(QuotaManager::new(2500, QuotaWeights::default()));

    let backend = Arc::new(ScriptedBackend::new(vec![
        assistant_with_calls(vec![tool_call("c1", "read", json!({"fd": 0}))]),
        assistant_with_calls(vec![tool_call("c2", "read", json!({"fd": 0}))]),
        assistant_with_calls(vec![tool_call("c3", "read", json!({"fd": 0}))]),
        assistant_with_calls(vec![tool_call("c4", "exit", json!({"code": 0}))]),
    ]));

    let outcome = Orchestrator::new(
        backend.clone(),
        session.dispatcher,
        quota,
        session.config,
    )
    .run()
    .await
    .unwrap();
    assert_eq!(outcome.exit_code, 0);

    // Some request before the last ran in terminal (exit-only) mode.
    let requests = backend.requests();
    assert!(
        requests
            .iter()
            .any(|r| r.tools.as_ref().unwrap().len() == 1),
        "no terminal-mode request was issued"
    );
}

#[tokio::test]
async fn plain_text_reply_is_nudged_not_fatal() {
    let session = session_with_stdin(b"").await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        ChatMessage::assistant("I think the answer is 42."),
        assistant_with_calls(vec![tool_call("c1", "exit", json!({"code": 0}))]),
    ]));

    let outcome = Orchestrator::new(
        backend.clone(),
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        session.config,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.calls_used, 2);
    // The second request carried the nudge.
    let requests = backend.requests();
    assert!(
        requests[1]
            .messages
            .iter()
            .any(|m| m.content.contains("No tool calls")),
    );
}

#[tokio::test]
async fn exit_in_the_middle_of_a_batch_stops_processing() {
    let session = session_with_stdin(b"").await;
    let stdout = session.stdout.clone();
    let backend = Arc::new(ScriptedBackend::new(vec![assistant_with_calls(vec![
        tool_call("c1", "exit", json!({"code": 7})),
        // Must never run: exit was already requested.
        tool_call("c2", "write", json!({"fd": 1, "data": "leak"})),
    ])]));

    let outcome = Orchestrator::new(
        backend,
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        session.config,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 7);
    assert!(stdout.snapshot().is_empty(), "post-exit tool call executed");
}

#[tokio::test]
async fn tool_errors_stay_inside_the_loop() {
    let session = session_with_stdin(b"").await;
    let backend = Arc::new(ScriptedBackend::new(vec![
        assistant_with_calls(vec![tool_call("c1", "read", json!({"fd": 99}))]),
        assistant_with_calls(vec![tool_call("c2", "exit", json!({"code": 0}))]),
    ]));

    let outcome = Orchestrator::new(
        backend.clone(),
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        session.config,
    )
    .run()
    .await
    .unwrap();

    // The invalid fd became a tool message, not a session failure.
    assert_eq!(outcome.exit_code, 0);
    let requests = backend.requests();
    assert!(
        requests[1]
            .messages
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("invalid file descriptor")),
    );
}

#[tokio::test]
async fn transport_failure_surfaces_after_teardown() {
    let session = session_with_stdin(b"").await;
    let result = Orchestrator::new(
        Arc::new(FailingBackend),
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        session.config,
    )
    .run()
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), llmcmd::EXIT_TRANSPORT);
}

#[tokio::test]
async fn tools_disabled_run_writes_answer_to_stdout() {
    let session = session_with_stdin(b"").await;
    let backend = Arc::new(ScriptedBackend::new(vec![ChatMessage::assistant(
        "the summary",
    )]));

    let mut config = session.config;
    config.system_prompt = SystemPrompt::ToolsDisabled;
    let outcome = Orchestrator::new(
        backend.clone(),
        session.dispatcher,
        Arc::new(QuotaManager::unlimited()),
        config,
    )
    .run_tools_disabled()
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(session.stdout.snapshot(), b"the summary\n");
    // No tools were advertised.
    assert!(backend.requests()[0].tools.is_none());
}

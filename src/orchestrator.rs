//! The conversation orchestrator: one session, turn by turn.
//!
//! The loop is a small state machine. Init assembles the system, FD-map and
//! task messages. Each turn serializes the transcript, calls the model
//! (through [`ChatBackend`], so tests can script replies), dispatches any
//! tool calls in emission order, and appends their results. When the call
//! budget is down to its last request or the weighted-token quota is inside
//! the response reserve, the turn becomes *terminal*: only the `exit` tool
//! is advertised, with a notice explaining why. A session that still does
//! not exit ends with the budget exit code.
//!
//! Timeouts are enforced here too: a per-call timeout on each chat request
//! and a session deadline across the whole run. Expiry tears the sandbox
//! down (closing handles cascades through dependency order, background
//! tasks get a short grace period) and surfaces a non-zero exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::ToolDispatcher;
use crate::error::EXIT_BUDGET;
use crate::llm::ChatBackend;
use crate::quota::{QuotaManager, QuotaSnapshot, QuotaUsage};
use crate::transcript::{
    self, RESPONSE_RESERVE_TOKENS, SystemPrompt, fd_map_message, prompt_message, system_message,
    terminal_notice,
};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, tool_specs};
use crate::{Error, Result};

/// Conversation-level configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Model identifier sent on every request.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-response token cap.
    pub max_output_tokens: Option<u32>,
    /// Maximum number of chat calls for the session.
    pub max_calls: u32,
    /// Which system prompt the transcript starts with.
    pub system_prompt: SystemPrompt,
    /// The user's instruction.
    pub prompt: String,
    /// Declared input file names, in fd order.
    pub input_names: Vec<String>,
    /// Wall-clock limit for the whole session.
    pub session_timeout: Duration,
    /// Limit for a single chat call.
    pub call_timeout: Duration,
    /// This process's id in the shared quota manager.
    pub process_id: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_output_tokens: Some(4096),
            max_calls: 50,
            system_prompt: SystemPrompt::Default,
            prompt: String::new(),
            input_names: Vec::new(),
            session_timeout: Duration::from_secs(600),
            call_timeout: Duration::from_secs(120),
            process_id: std::process::id(),
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    /// The process exit code to report.
    pub exit_code: i32,
    /// Final message from the model's `exit` call, if any.
    pub message: Option<String>,
    /// Chat calls actually issued.
    pub calls_used: u32,
    /// Final quota accounting.
    pub usage: QuotaSnapshot,
}

/// Drives one session against a chat backend.
pub struct Orchestrator<B: ChatBackend> {
    backend: Arc<B>,
    dispatcher: ToolDispatcher,
    quota: Arc<QuotaManager>,
    config: SessionConfig,
    call_count: u32,
}

impl<B: ChatBackend> Orchestrator<B> {
    /// Assembles an orchestrator over an initialized sandbox.
    pub fn new(
        backend: Arc<B>,
        dispatcher: ToolDispatcher,
        quota: Arc<QuotaManager>,
        config: SessionConfig,
    ) -> Self {
        Self {
            backend,
            dispatcher,
            quota,
            config,
            call_count: 0,
        }
    }

    /// Whether the next request must advertise only `exit`.
    fn terminal_mode(&self) -> bool {
        if self.call_count >= self.config.max_calls.saturating_sub(1) {
            return true;
        }
        let remaining = self.quota.remaining();
        remaining >= 0 && remaining < RESPONSE_RESERVE_TOKENS
    }

    async fn chat_with_deadline(
        &self,
        request: &ChatRequest,
        deadline: Instant,
    ) -> Result<ChatResponse> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::cancelled("session timeout"));
        }
        let window = (deadline - now).min(self.config.call_timeout);
        match tokio::time::timeout(window, self.backend.chat(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Runs the session to completion in tool mode.
    pub async fn run(mut self) -> Result<SessionOutcome> {
        let deadline = Instant::now() + self.config.session_timeout;
        let pid = self.config.process_id;
        self.quota.register(pid, None);

        let mut messages = vec![
            system_message(
                &self.config.system_prompt,
                &self.dispatcher.command_names(),
            ),
            fd_map_message(self.dispatcher.fd_entries()),
            prompt_message(
                &self.config.prompt,
                &self.config.input_names,
                &self.quota.summary(),
            ),
        ];
        let mut terminal_announced = false;

        let outcome = loop {
            if self.call_count >= self.config.max_calls {
                break self.budget_outcome("call budget exhausted without exit");
            }
            if !self.quota.can_call(pid) {
                break self.budget_outcome("token budget exhausted without exit");
            }

            let terminal = self.terminal_mode();
            if terminal && !terminal_announced {
                messages.push(terminal_notice());
                terminal_announced = true;
            }

            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: Some(tool_specs(terminal)),
                tool_choice: None,
                max_tokens: self.config.max_output_tokens,
                temperature: Some(self.config.temperature),
            };

            let response = match self.chat_with_deadline(&request, deadline).await {
                Ok(response) => response,
                Err(e) => {
                    self.dispatcher.teardown().await;
                    self.quota.unregister(pid);
                    return Err(e);
                }
            };
            self.call_count += 1;
            if let Some(usage) = &response.usage {
                self.quota.consume(pid, &QuotaUsage::from_usage_block(usage));
                log::info!(
                    "call {}/{}: +{} prompt (+{} cached), +{} completion; {}",
                    self.call_count,
                    self.config.max_calls,
                    usage.uncached_prompt_tokens(),
                    usage.cached_tokens(),
                    usage.completion_tokens,
                    self.quota.summary()
                );
            } else {
                log::info!(
                    "call {}/{}: no usage block in response",
                    self.call_count,
                    self.config.max_calls
                );
            }

            let reply = match response.message() {
                Ok(reply) => reply.clone(),
                Err(e) => {
                    self.dispatcher.teardown().await;
                    self.quota.unregister(pid);
                    return Err(e);
                }
            };
            messages.push(reply.clone());

            match reply.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    for call in &calls {
                        let tool_message = self.dispatcher.dispatch(call).await;
                        messages.push(tool_message);
                        // After exit, no further tool call is processed.
                        if self.dispatcher.exit_request().is_some() {
                            break;
                        }
                    }
                    if let Some(request) = self.dispatcher.exit_request() {
                        let request = request.clone();
                        break SessionOutcome {
                            exit_code: request.code,
                            message: request.message,
                            calls_used: self.call_count,
                            usage: self.quota.snapshot(),
                        };
                    }
                }
                _ => {
                    // A plain text reply in tool mode: remind the model how
                    // to make progress, and spend another call.
                    messages.push(ChatMessage::user(
                        "No tool calls were received. Use the tools to perform the task, \
                         and call exit when it is done.",
                    ));
                }
            }
        };

        self.dispatcher.teardown().await;
        self.quota.unregister(pid);
        Ok(outcome)
    }

    /// Runs a tools-disabled session: the input files are inlined into the
    /// transcript within the remaining token budget and the model's single
    /// answer is written to stdout.
    pub async fn run_tools_disabled(mut self) -> Result<SessionOutcome> {
        let deadline = Instant::now() + self.config.session_timeout;
        let pid = self.config.process_id;
        self.quota.register(pid, None);

        let mut files = Vec::new();
        for name in &self.config.input_names {
            let content = tokio::fs::read_to_string(name)
                .await
                .map_err(|e| Error::config(format!("{}: {}", name, e)))?;
            files.push((name.clone(), content));
        }

        let budget = match self.quota.remaining() {
            -1 => i64::MAX / 8,
            remaining => (remaining - RESPONSE_RESERVE_TOKENS).max(0),
        };

        let mut messages = vec![system_message(&SystemPrompt::ToolsDisabled, &[])];
        messages.extend(transcript::inline_messages(
            &self.config.prompt,
            &files,
            budget,
        ));

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            tools: None,
            tool_choice: None,
            max_tokens: self.config.max_output_tokens,
            temperature: Some(self.config.temperature),
        };

        let response = match self.chat_with_deadline(&request, deadline).await {
            Ok(response) => response,
            Err(e) => {
                self.dispatcher.teardown().await;
                self.quota.unregister(pid);
                return Err(e);
            }
        };
        self.call_count += 1;
        if let Some(usage) = &response.usage {
            self.quota.consume(pid, &QuotaUsage::from_usage_block(usage));
        }

        let answer = response.message()?.content.clone();
        if let Ok(stdout) = self.dispatcher.stdout() {
            stdout.write_all(answer.as_bytes()).await?;
            if !answer.ends_with('\n') {
                stdout.write_all(b"\n").await?;
            }
        }

        self.dispatcher.teardown().await;
        self.quota.unregister(pid);
        Ok(SessionOutcome {
            exit_code: 0,
            message: None,
            calls_used: self.call_count,
            usage: self.quota.snapshot(),
        })
    }

    fn budget_outcome(&self, reason: &str) -> SessionOutcome {
        log::warn!("{}", reason);
        SessionOutcome {
            exit_code: EXIT_BUDGET,
            message: Some(reason.to_string()),
            calls_used: self.call_count,
            usage: self.quota.snapshot(),
        }
    }
}

//! Core type definitions for llmcmd.
//!
//! This module contains the data structures shared by the orchestrator, the
//! tool dispatcher, and the LLM client. The type system is organized into
//! three main categories:
//!
//! # Transcript Messages
//!
//! - [`ChatMessage`]: one entry of the conversation transcript, in the
//!   Chat-Completions wire shape (role + content + optional tool plumbing)
//! - [`Role`]: who produced the message (System, User, Assistant, Tool)
//! - [`ToolCallRequest`] / [`FunctionCall`]: a function-call request as the
//!   model emits it (arguments arrive as a JSON *string*, not an object)
//!
//! # Wire Schema
//!
//! The agent speaks the OpenAI-compatible chat-completions API, non-streaming:
//!
//! - [`ChatRequest`]: request payload (`model`, `messages`, `tools?`, ...)
//! - [`ChatResponse`] / [`Choice`]: response payload
//! - [`UsageBlock`] / [`PromptTokensDetails`]: token accounting, including
//!   the optional cached-token breakdown consumed by the quota manager
//!
//! # Tool Surface
//!
//! - [`ToolName`]: the closed set of seven tools the dispatcher understands
//! - [`OpenMode`]: `r`/`w`/`a`/`r+`/`w+`/`a+` file open modes
//! - [`tool_specs`]: the JSON-Schema definitions advertised to the model
//!   (only `exit` in terminal mode)
//!
//! Keeping the wire shape and the internal transcript shape identical avoids
//! a conversion layer: the orchestrator appends [`ChatMessage`] values and
//! serializes them directly into the next request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Placeholder substituted when a message would otherwise have empty content.
///
/// Several endpoints reject messages with empty `content`; the transcript
/// invariant is that content is never empty.
pub const NO_OUTPUT: &str = "(no output)";

// ============================================================================
// TRANSCRIPT MESSAGES
// ============================================================================

/// Identifies the sender/role of a message in the conversation.
///
/// Serializes to lowercase strings (`"system"`, `"user"`, ...) to match the
/// chat-completions format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message establishing agent behavior and constraints.
    System,
    /// Input from the human or the calling process.
    User,
    /// Response from the model; may carry `tool_calls`.
    Assistant,
    /// Result of a tool execution, correlated via `tool_call_id`.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A function-call request emitted by the model.
///
/// The `arguments` field is a JSON-encoded *string* per the wire format; the
/// dispatcher parses it into typed argument structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique identifier for this call, echoed back in the tool message.
    pub id: String,

    /// Always `"function"` in the chat-completions schema.
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,

    /// The function name and raw argument string.
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// The function half of a [`ToolCallRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool name; must be one of the seven [`ToolName`] variants.
    pub name: String,

    /// JSON object encoded as a string, e.g. `"{\"fd\": 3}"`.
    pub arguments: String,
}

impl ToolCallRequest {
    /// Convenience constructor used by tests and the proxy's nested-chat path.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// One entry of the conversation transcript.
///
/// The same shape is used internally and on the wire. Assistant messages may
/// carry `tool_calls`; tool messages carry `tool_call_id` and the JSON result
/// text. `content` is never empty — constructors substitute [`NO_OUTPUT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced this message.
    pub role: Role,

    /// Message text. Never empty.
    pub content: String,

    /// Function-call requests (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,

    /// Correlation id for tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn non_empty(content: impl Into<String>) -> String {
        let content = content.into();
        if content.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            content
        }
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Self::non_empty(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Self::non_empty(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Creates a plain assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Self::non_empty(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Creates an assistant message carrying tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: Self::non_empty(content),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Creates a tool-result message correlated to `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Self::non_empty(content),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ============================================================================
// WIRE SCHEMA (chat completions, non-streaming)
// ============================================================================

/// Request payload for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Model identifier at the endpoint.
    pub model: String,

    /// Full conversation transcript.
    pub messages: Vec<ChatMessage>,

    /// Advertised tool definitions. Omitted entirely in tools-disabled mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,

    /// Tool choice directive (`"auto"` / `"required"`); omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    /// Cap on generated tokens for this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Response payload from the chat-completions endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    /// Completion choices; the agent only ever consumes the first.
    pub choices: Vec<Choice>,

    /// Token accounting for quota tracking. Some servers omit it.
    #[serde(default)]
    pub usage: Option<UsageBlock>,
}

impl ChatResponse {
    /// The first choice's message, or an error when the server returned none.
    pub fn message(&self) -> Result<&ChatMessage> {
        self.choices
            .first()
            .map(|c| &c.message)
            .ok_or_else(|| Error::api("response contained no choices"))
    }
}

/// One completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// The assistant message (text and/or tool calls).
    pub message: ChatMessage,

    /// `"stop"`, `"tool_calls"`, `"length"`, ... informational only.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token usage reported by the endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageBlock {
    /// Tokens consumed by the prompt (includes cached tokens).
    #[serde(default)]
    pub prompt_tokens: u64,

    /// Tokens generated by the model.
    #[serde(default)]
    pub completion_tokens: u64,

    /// Total as reported by the server.
    #[serde(default)]
    pub total_tokens: u64,

    /// Optional breakdown; only newer servers report cached tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

impl UsageBlock {
    /// Cached prompt tokens, or 0 when the server did not report the
    /// breakdown. Absence is never inferred as non-zero.
    pub fn cached_tokens(&self) -> u64 {
        self.prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0)
    }

    /// Prompt tokens billed at the full input weight (total minus cached).
    pub fn uncached_prompt_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_sub(self.cached_tokens())
    }
}

/// The `prompt_tokens_details` sub-object of [`UsageBlock`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    /// Prompt tokens served from the provider's cache.
    #[serde(default)]
    pub cached_tokens: Option<u64>,
}

// ============================================================================
// TOOL SURFACE
// ============================================================================

/// The closed set of tools the dispatcher understands.
///
/// New tools are additive here; `match` exhaustiveness keeps the dispatcher
/// honest at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    /// Read bytes or lines from a handle.
    Read,
    /// Write bytes to a handle, optionally propagating EOF.
    Write,
    /// Open a named file (virtual or gated real) and allocate a handle.
    Open,
    /// Run a pipeline script, wiring stdin/stdout per the four patterns.
    Spawn,
    /// Close a handle, joining any backing command task.
    Close,
    /// Look up usage guides by key.
    Help,
    /// Terminate the session with an exit code.
    Exit,
}

impl ToolName {
    /// All tools, in the order they are advertised.
    pub const ALL: [ToolName; 7] = [
        ToolName::Read,
        ToolName::Write,
        ToolName::Open,
        ToolName::Spawn,
        ToolName::Close,
        ToolName::Help,
        ToolName::Exit,
    ];

    /// The wire name of this tool.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Read => "read",
            ToolName::Write => "write",
            ToolName::Open => "open",
            ToolName::Spawn => "spawn",
            ToolName::Close => "close",
            ToolName::Help => "help",
            ToolName::Exit => "exit",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(ToolName::Read),
            "write" => Ok(ToolName::Write),
            "open" => Ok(ToolName::Open),
            "spawn" => Ok(ToolName::Spawn),
            "close" => Ok(ToolName::Close),
            "help" => Ok(ToolName::Help),
            "exit" => Ok(ToolName::Exit),
            other => Err(Error::tool(format!("unknown tool: {}", other))),
        }
    }
}

/// File open modes accepted by the `open` tool and the FS-proxy `OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r` — read only.
    Read,
    /// `w` — write only, truncate.
    Write,
    /// `a` — write only, append.
    Append,
    /// `r+` — read and write, no truncation.
    ReadPlus,
    /// `w+` — read and write, truncate.
    WritePlus,
    /// `a+` — read and append.
    AppendPlus,
}

impl OpenMode {
    /// Whether a handle opened in this mode can be read.
    pub fn is_readable(&self) -> bool {
        matches!(
            self,
            OpenMode::Read | OpenMode::ReadPlus | OpenMode::WritePlus | OpenMode::AppendPlus
        )
    }

    /// Whether a handle opened in this mode can be written.
    pub fn is_writable(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    /// Whether opening truncates an existing file.
    pub fn truncates(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WritePlus)
    }

    /// Whether writes go to the end regardless of position.
    pub fn appends(&self) -> bool {
        matches!(self, OpenMode::Append | OpenMode::AppendPlus)
    }

    /// The mode string as given to `open`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Read => "r",
            OpenMode::Write => "w",
            OpenMode::Append => "a",
            OpenMode::ReadPlus => "r+",
            OpenMode::WritePlus => "w+",
            OpenMode::AppendPlus => "a+",
        }
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r+" => Ok(OpenMode::ReadPlus),
            "w+" => Ok(OpenMode::WritePlus),
            "a+" => Ok(OpenMode::AppendPlus),
            other => Err(Error::invalid_input(format!(
                "invalid open mode: {} (expected r, w, a, r+, w+ or a+)",
                other
            ))),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub spec_type: String,

    /// Name, description, and JSON-Schema parameters.
    pub function: FunctionSpec,
}

/// The function half of a [`ToolSpec`].
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    /// Wire name of the tool.
    pub name: String,

    /// Short description shown to the model.
    pub description: String,

    /// JSON-Schema object describing the parameters.
    pub parameters: serde_json::Value,
}

fn spec(name: ToolName, description: &str, parameters: serde_json::Value) -> ToolSpec {
    ToolSpec {
        spec_type: "function".to_string(),
        function: FunctionSpec {
            name: name.as_str().to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// Build the tool definitions for one chat request.
///
/// In terminal mode only `exit` is advertised; the orchestrator uses this to
/// force the model to wind the session down when the budget is nearly gone.
pub fn tool_specs(terminal: bool) -> Vec<ToolSpec> {
    let exit_spec = spec(
        ToolName::Exit,
        "End the session. Call this exactly once when the task is complete (or cannot proceed).",
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": 255,
                    "description": "Process exit code: 0 for success."
                },
                "message": {
                    "type": "string",
                    "description": "Optional final status message."
                }
            },
            "required": ["code"]
        }),
    );

    if terminal {
        return vec![exit_spec];
    }

    vec![
        spec(
            ToolName::Read,
            "Read from a file descriptor. Returns the bytes read and their count; an empty result means EOF.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "fd": {
                        "type": "integer",
                        "description": "File descriptor to read from (0 is stdin)."
                    },
                    "lines": {
                        "type": "integer",
                        "description": "Read up to this many newline-terminated lines instead of raw bytes."
                    },
                    "count": {
                        "type": "integer",
                        "description": "Maximum bytes to read (default 4096)."
                    }
                },
                "required": ["fd"]
            }),
        ),
        spec(
            ToolName::Write,
            "Write data to a file descriptor. Set eof=true after the final write so downstream readers see end-of-file.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "fd": {
                        "type": "integer",
                        "description": "File descriptor to write to (1 is stdout, 2 is stderr)."
                    },
                    "data": {
                        "type": "string",
                        "description": "Text to write."
                    },
                    "newline": {
                        "type": "boolean",
                        "description": "Append a trailing newline."
                    },
                    "eof": {
                        "type": "boolean",
                        "description": "Propagate end-of-file after writing."
                    }
                },
                "required": ["fd", "data"]
            }),
        ),
        spec(
            ToolName::Open,
            "Open a file by name and allocate a new file descriptor for it.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File name (virtual or declared input/output file)."
                    },
                    "mode": {
                        "type": "string",
                        "enum": ["r", "w", "a", "r+", "w+", "a+"],
                        "description": "Open mode."
                    }
                },
                "required": ["path", "mode"]
            }),
        ),
        spec(
            ToolName::Spawn,
            "Run a pipeline of built-in commands (e.g. \"grep ERROR | sort | uniq -c\"). With both in_fd and out_fd it runs synchronously and returns the exit code; otherwise it runs in the background and returns the allocated descriptors.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "script": {
                        "type": "string",
                        "description": "Pipeline script using the built-in command set."
                    },
                    "in_fd": {
                        "type": "integer",
                        "description": "Existing descriptor to use as the pipeline's stdin."
                    },
                    "out_fd": {
                        "type": "integer",
                        "description": "Existing descriptor to use as the pipeline's stdout."
                    }
                },
                "required": ["script"]
            }),
        ),
        spec(
            ToolName::Close,
            "Close a file descriptor. Closing the output of a spawned pipeline waits for it and returns its exit code.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "fd": {
                        "type": "integer",
                        "description": "File descriptor to close."
                    }
                },
                "required": ["fd"]
            }),
        ),
        spec(
            ToolName::Help,
            "Look up usage guides. Accepts between 1 and 11 documentation keys.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "keys": {
                        "type": "array",
                        "items": {
                            "type": "string",
                            "enum": [
                                "basic_operations", "data_analysis", "text_processing",
                                "file_operations", "content_search", "format_conversion",
                                "log_analysis", "batch_processing", "interactive_workflow",
                                "debugging", "command_usage"
                            ]
                        },
                        "minItems": 1,
                        "maxItems": 11
                    }
                },
                "required": ["keys"]
            }),
        ),
        exit_spec,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content_never_empty() {
        let msg = ChatMessage::tool_result("call_1", "");
        assert_eq!(msg.content, NO_OUTPUT);

        let msg = ChatMessage::assistant("");
        assert_eq!(msg.content, NO_OUTPUT);

        let msg = ChatMessage::user("hello");
        assert_eq!(msg.content, "hello");
    }

    #[test]
    fn test_message_serialization_skips_absent_fields() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));

        let msg = ChatMessage::tool_result("call_7", "{\"size\":3}");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"tool_call_id\":\"call_7\""));
    }

    #[test]
    fn test_response_deserialization() {
        let raw = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "done",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "exit", "arguments": "{\"code\": 0}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "total_tokens": 120,
                "prompt_tokens_details": {"cached_tokens": 60}
            }
        }"#;

        let resp: ChatResponse = serde_json::from_str(raw).unwrap();
        let msg = resp.message().unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "exit");

        let usage = resp.usage.unwrap();
        assert_eq!(usage.cached_tokens(), 60);
        assert_eq!(usage.uncached_prompt_tokens(), 40);
    }

    #[test]
    fn test_usage_without_cached_breakdown() {
        let raw = r#"{"prompt_tokens": 50, "completion_tokens": 5, "total_tokens": 55}"#;
        let usage: UsageBlock = serde_json::from_str(raw).unwrap();
        // Older servers omit the breakdown entirely; cached must read as 0.
        assert_eq!(usage.cached_tokens(), 0);
        assert_eq!(usage.uncached_prompt_tokens(), 50);
    }

    #[test]
    fn test_tool_name_round_trip() {
        for name in ToolName::ALL {
            assert_eq!(name.as_str().parse::<ToolName>().unwrap(), name);
        }
        assert!("launch_missiles".parse::<ToolName>().is_err());
    }

    #[test]
    fn test_open_mode_parse() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("a+".parse::<OpenMode>().unwrap(), OpenMode::AppendPlus);
        assert!("rw".parse::<OpenMode>().is_err());

        assert!(!OpenMode::Read.is_writable());
        assert!(OpenMode::WritePlus.truncates());
        assert!(OpenMode::AppendPlus.is_readable());
        assert!(OpenMode::Append.appends());
    }

    #[test]
    fn test_terminal_mode_advertises_only_exit() {
        let all = tool_specs(false);
        assert_eq!(all.len(), 7);

        let terminal = tool_specs(true);
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].function.name, "exit");
    }

    #[test]
    fn test_empty_choices_is_api_error() {
        let resp: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(resp.message().is_err());
    }
}

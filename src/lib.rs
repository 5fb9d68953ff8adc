//! # llmcmd
//!
//! A sandboxed command-line agent that drives an OpenAI-compatible chat
//! endpoint through an iterative tool-use loop to perform text-processing
//! tasks described in natural language.
//!
//! ## Overview
//!
//! The user supplies a prompt, optional input files and optional output
//! files. The agent issues successive chat-completion requests; each reply
//! either answers in text or emits **tool calls** (`read`, `write`, `open`,
//! `spawn`, `close`, `help`, `exit`). Tool calls execute against a sandbox:
//! a virtual filesystem, a table of numbered stream handles, and a runner
//! that executes pipelines of built-in text commands (`grep`, `sort`,
//! `sed`, `diff`, `patch`, ...) as concurrent tasks connected by bounded
//! pipes. Results feed back into the transcript until the model calls
//! `exit` or a budget runs out.
//!
//! ## Architecture
//!
//! - **commands**: the built-in command registry; each command implements
//!   `execute(args, io) -> exit code` over byte streams
//! - **vfs** / **stream**: named virtual files, gated real files, and
//!   bounded anonymous pipes with back-pressure
//! - **handles**: the numbered handle table with dependency-ordered close
//! - **pipeline**: script parsing and concurrent pipeline execution
//! - **dispatch**: decodes the seven tool calls against the sandbox
//! - **orchestrator**: the turn loop, call/quota budgets, terminal mode
//! - **quota**: weighted-token accounting shared across nested invocations
//! - **proxy**: the parent/child FS-proxy protocol (files + nested chats)
//! - **transcript**: system prompts, the FD map, UTF-8-safe truncation
//! - **llm** / **retry**: the chat-completions client with backoff
//! - **help**: the keyed usage-guide catalogue
//! - **config**: environment, config file, and preset resolution
//!
//! ## Example
//!
//! ```rust,no_run
//! use llmcmd::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> llmcmd::Result<()> {
//!     let backend = Arc::new(LlmClient::new(
//!         "https://api.openai.com/v1",
//!         "sk-...",
//!         Duration::from_secs(120),
//!     )?);
//!     let quota = Arc::new(QuotaManager::new(200_000, QuotaWeights::default()));
//!
//!     let dispatcher = ToolDispatcher::new(
//!         ByteReader::empty(),
//!         ByteWriter::sink(),
//!         ByteWriter::sink(),
//!         vec!["input.txt".to_string()],
//!         vec![],
//!         true,
//!     )
//!     .await?;
//!
//!     let config = SessionConfig {
//!         model: "gpt-4o-mini".to_string(),
//!         prompt: "count the ERROR lines in $1".to_string(),
//!         input_names: vec!["input.txt".to_string()],
//!         ..SessionConfig::default()
//!     };
//!
//!     let outcome = Orchestrator::new(backend, dispatcher, quota, config)
//!         .run()
//!         .await?;
//!     std::process::exit(outcome.exit_code);
//! }
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Built-in command registry: the uniform `execute(args, io)` contract and
/// the closed set of text commands available to `spawn`.
pub mod commands;

/// Configuration resolution: defaults, config file, environment, presets.
pub mod config;

/// The tool dispatcher: decodes model-emitted tool calls into sandbox
/// operations and JSON results.
pub mod dispatch;

/// Error types and the exit-code mapping.
mod error;

/// The numbered handle table with dependency-ordered teardown.
pub mod handles;

/// The keyed help catalogue surfaced by the `help` tool and command.
pub mod help;

/// The chat-completions client and the `ChatBackend` trait.
pub mod llm;

/// The conversation orchestrator: the outer turn loop.
pub mod orchestrator;

/// Script parsing and concurrent pipeline execution.
pub mod pipeline;

/// The FS-proxy protocol server and client.
pub mod proxy;

/// Weighted-token quota accounting, shared across nested invocations.
pub mod quota;

/// Retry with exponential backoff for transport calls.
pub mod retry;

/// Byte-stream endpoints: pipes, buffers, and EOF semantics.
pub mod stream;

/// Transcript assembly: system prompts, the FD map, truncation.
pub mod transcript;

/// Wire types: the chat-completions schema and the tool surface.
pub mod types;

/// The virtual filesystem with gated real-file access.
pub mod vfs;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

pub use error::{
    EXIT_BUDGET, EXIT_CONFIG, EXIT_OK, EXIT_SIGNAL_BASE, EXIT_TOOL, EXIT_TRANSPORT, Error, Result,
};

pub use commands::{Command, CommandIo, CommandRegistry};
pub use config::Settings;
pub use dispatch::ToolDispatcher;
pub use handles::{FD_STDERR, FD_STDIN, FD_STDOUT, HandleTable};
pub use llm::{ChatBackend, LlmClient};
pub use orchestrator::{Orchestrator, SessionConfig, SessionOutcome};
pub use pipeline::PipelineRunner;
pub use proxy::{ProxyClient, ProxyServer, ProxyServerConfig};
pub use quota::{QuotaManager, QuotaUsage, QuotaWeights};
pub use stream::{ByteReader, ByteWriter};
pub use transcript::SystemPrompt;
pub use types::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCallRequest, ToolName};
pub use vfs::Vfs;

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The most commonly used types, importable in one line with
/// `use llmcmd::prelude::*;`.
pub mod prelude {
    pub use crate::{
        ByteReader, ByteWriter, ChatBackend, ChatMessage, ChatRequest, ChatResponse, Error,
        LlmClient, Orchestrator, QuotaManager, QuotaWeights, Result, SessionConfig,
        SessionOutcome, Settings, SystemPrompt, ToolDispatcher, ToolName,
    };
}

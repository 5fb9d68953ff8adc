//! Transcript assembly: system prompts, the FD map, and inlined input.
//!
//! The assembler builds the messages a session starts from. In tool mode
//! that is a system message describing the tool workflow, a user message
//! declaring the FD map (one line per descriptor with label, size and type),
//! and a user message restating the task with `$1, $2, ...` file pins. In
//! tools-disabled mode file contents are inlined instead, split across the
//! remaining token budget proportionally and truncated on UTF-8 boundaries.
//!
//! Token arithmetic uses the character-based approximation (1 token ≈ 4
//! characters). It is an approximation; budgets derived from it keep a
//! safety reserve.

use crate::types::ChatMessage;

/// Bytes per estimated token in the character-based approximation.
pub const BYTES_PER_TOKEN: usize = 4;

/// Weighted tokens held back for the model's answer when inlining input.
pub const RESPONSE_RESERVE_TOKENS: i64 = 2000;

/// Minimum token allowance for any single inlined file.
pub const MIN_FILE_TOKENS: usize = 500;

/// Estimate the token count of a text (1 token ≈ 4 characters, rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + BYTES_PER_TOKEN - 1) / BYTES_PER_TOKEN
}

/// The longest prefix of `text` that fits in `max_bytes` without splitting
/// a multi-byte character.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Renders a byte count with binary prefixes (B, KiB, MiB, GiB).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Coarse size category used in the FD map.
pub fn size_category(bytes: u64) -> &'static str {
    match bytes {
        b if b < 1024 => "small",
        b if b < 1024 * 1024 => "medium",
        b if b < 10 * 1024 * 1024 => "large",
        _ => "very_large",
    }
}

/// A coarse file type derived from the name's extension.
pub fn file_type_for(name: &str) -> &'static str {
    let extension = name.rsplit('.').next().unwrap_or("");
    match extension.to_ascii_lowercase().as_str() {
        "txt" | "text" => "text",
        "log" => "log",
        "json" | "jsonl" => "json",
        "csv" | "tsv" => "csv",
        "md" | "markdown" => "markdown",
        "xml" | "html" | "htm" => "markup",
        "yaml" | "yml" | "toml" | "ini" | "conf" | "cfg" => "config",
        "rs" | "go" | "py" | "js" | "ts" | "c" | "h" | "cpp" | "java" | "sh" => "source",
        "gz" | "zip" | "tar" | "bin" | "exe" | "so" | "png" | "jpg" | "jpeg" | "gif" | "pdf" => {
            "binary"
        }
        _ => "unknown",
    }
}

/// One line of the FD map.
#[derive(Debug, Clone)]
pub struct FdMapEntry {
    /// The descriptor number.
    pub fd: u32,
    /// Human label: "stdin", "stdout", or the file name.
    pub label: String,
    /// Redirection target, when the stream is wired to a file.
    pub redirect: Option<String>,
    /// Size in bytes, when known.
    pub size: Option<u64>,
}

impl FdMapEntry {
    fn render(&self) -> String {
        let mut line = format!("fd {}: {}", self.fd, self.label);
        if let Some(target) = &self.redirect {
            line.push_str(&format!(" -> {}", target));
        }
        if let Some(size) = self.size {
            line.push_str(&format!(
                " ({}, {}, {})",
                format_size(size),
                file_type_for(&self.label),
                size_category(size)
            ));
        }
        line
    }
}

/// Which system prompt a session starts with.
#[derive(Debug, Clone)]
pub enum SystemPrompt {
    /// A user-supplied prompt used verbatim.
    Custom(String),
    /// The terse instruction for tools-disabled runs.
    ToolsDisabled,
    /// The default tool-use instruction.
    Default,
}

/// Renders the session's system message.
pub fn system_message(prompt: &SystemPrompt, command_names: &[&str]) -> ChatMessage {
    match prompt {
        SystemPrompt::Custom(text) => ChatMessage::system(text.clone()),
        SystemPrompt::ToolsDisabled => ChatMessage::system(
            "You are a text-processing assistant. The user's input files are included \
             inline below. Produce the requested output directly as your answer; there \
             are no tools in this mode.",
        ),
        SystemPrompt::Default => ChatMessage::system(format!(
            "You are a text-processing agent operating a sandbox through tool calls.\n\
             \n\
             Tools: read, write, open, spawn, close, help, exit.\n\
             Workflow: read input -> process it -> write output -> exit. Always finish \
             by calling exit exactly once.\n\
             \n\
             spawn runs pipelines of these commands only: {}.\n\
             Pipelines support |, ;, && and ||, plus redirections <, >, >>, 2> and &>.\n\
             \n\
             Named files opened for writing that are not declared outputs are virtual: \
             they live in memory and can be re-opened by name any number of times. \
             Pipes created by spawn are different: their data can be read exactly once.\n\
             \n\
             Data may be binary. When unsure, sample at most 16 bytes at a time before \
             deciding how to process a stream.",
            command_names.join(", ")
        )),
    }
}

/// The notice appended when the orchestrator enters terminal mode.
pub fn terminal_notice() -> ChatMessage {
    ChatMessage::user(
        "The call or token budget is nearly exhausted. Only the exit tool is \
         available now: call exit with an appropriate code (0 if the task was \
         completed, non-zero otherwise).",
    )
}

/// Builds the FD-map user message.
pub fn fd_map_message(entries: &[FdMapEntry]) -> ChatMessage {
    let mut lines = vec!["File descriptors available to this session:".to_string()];
    for entry in entries {
        lines.push(entry.render());
    }
    ChatMessage::user(lines.join("\n"))
}

/// Builds the task user message, pinning input files as `$1, $2, ...` and
/// appending the current quota summary.
pub fn prompt_message(prompt: &str, input_names: &[String], quota_summary: &str) -> ChatMessage {
    let mut text = String::from("Task:\n");
    text.push_str(prompt);
    if !input_names.is_empty() {
        text.push_str("\n\nInput files:");
        for (index, name) in input_names.iter().enumerate() {
            text.push_str(&format!("\n  ${} = {} (fd {})", index + 1, name, 3 + index as u32));
        }
    }
    text.push_str("\n\n");
    text.push_str(quota_summary);
    ChatMessage::user(text)
}

/// Builds the inline user messages for a tools-disabled run.
///
/// `budget_tokens` is the remaining weighted budget minus the response
/// reserve. The allowance is split across files proportionally to their
/// sizes, with a [`MIN_FILE_TOKENS`] floor per file; when the whole budget
/// is below that floor, a single error message is produced instead.
pub fn inline_messages(
    prompt: &str,
    files: &[(String, String)],
    budget_tokens: i64,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::user(format!("Task:\n{}", prompt))];
    if files.is_empty() {
        return messages;
    }

    if budget_tokens < MIN_FILE_TOKENS as i64 {
        return vec![ChatMessage::user(format!(
            "Error: the remaining token budget ({} tokens) is too small to include \
             any input file (minimum {}). Increase the budget or reduce the input.",
            budget_tokens.max(0),
            MIN_FILE_TOKENS
        ))];
    }

    let total_bytes: usize = files.iter().map(|(_, content)| content.len()).sum();
    let budget_bytes = budget_tokens as usize * BYTES_PER_TOKEN;
    let floor_bytes = MIN_FILE_TOKENS * BYTES_PER_TOKEN;

    for (name, content) in files {
        // Proportional share of the byte budget, never below the floor.
        let share = if total_bytes == 0 {
            floor_bytes
        } else {
            (budget_bytes * content.len() / total_bytes).max(floor_bytes)
        };
        let excerpt = truncate_utf8(content, share);
        let truncated = excerpt.len() < content.len();
        let mut text = format!("=== {} ===\n{}", name, excerpt);
        if truncated {
            text.push_str(&format!(
                "\n[... truncated: {} of {} bytes shown]",
                excerpt.len(),
                content.len()
            ));
        }
        messages.push(ChatMessage::user(text));
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_truncate_utf8_never_splits_characters() {
        let text = "héllo wörld";
        for budget in 0..=text.len() {
            let prefix = truncate_utf8(text, budget);
            assert!(prefix.len() <= budget);
            assert!(text.starts_with(prefix));
            // Being a &str at all proves the cut landed on a boundary.
        }
    }

    #[test]
    fn test_truncate_utf8_multibyte_edge() {
        let text = "日本語"; // 3 bytes per character
        assert_eq!(truncate_utf8(text, 4), "日");
        assert_eq!(truncate_utf8(text, 6), "日本");
        assert_eq!(truncate_utf8(text, 2), "");
    }

    #[test]
    fn test_format_size_binary_prefixes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_size_categories() {
        assert_eq!(size_category(100), "small");
        assert_eq!(size_category(100 * 1024), "medium");
        assert_eq!(size_category(5 * 1024 * 1024), "large");
        assert_eq!(size_category(50 * 1024 * 1024), "very_large");
    }

    #[test]
    fn test_file_types() {
        assert_eq!(file_type_for("app.log"), "log");
        assert_eq!(file_type_for("data.json"), "json");
        assert_eq!(file_type_for("notes"), "unknown");
        assert_eq!(file_type_for("archive.tar"), "binary");
    }

    #[test]
    fn test_fd_map_rendering() {
        let entries = vec![
            FdMapEntry {
                fd: 0,
                label: "stdin".to_string(),
                redirect: None,
                size: None,
            },
            FdMapEntry {
                fd: 3,
                label: "input.csv".to_string(),
                redirect: Some("input.csv".to_string()),
                size: Some(2048),
            },
        ];
        let msg = fd_map_message(&entries);
        assert!(msg.content.contains("fd 0: stdin"));
        assert!(msg.content.contains("fd 3: input.csv -> input.csv"));
        assert!(msg.content.contains("2.0 KiB"));
        assert!(msg.content.contains("csv"));
        assert!(msg.content.contains("medium"));
    }

    #[test]
    fn test_prompt_message_pins_files() {
        let msg = prompt_message(
            "count the errors",
            &["a.log".to_string(), "b.log".to_string()],
            "quota: unlimited",
        );
        assert!(msg.content.contains("$1 = a.log (fd 3)"));
        assert!(msg.content.contains("$2 = b.log (fd 4)"));
        assert!(msg.content.contains("quota: unlimited"));
    }

    #[test]
    fn test_inline_messages_budget_too_small() {
        let files = vec![("a.txt".to_string(), "content".to_string())];
        let messages = inline_messages("task", &files, 100);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("too small"));
    }

    #[test]
    fn test_inline_messages_truncate_proportionally() {
        let big = "x".repeat(100_000);
        let small = "y".repeat(1000);
        let files = vec![
            ("big.txt".to_string(), big),
            ("small.txt".to_string(), small),
        ];
        // 2000 tokens = 8000 bytes, split ~proportionally with a floor.
        let messages = inline_messages("task", &files, 2000);
        assert_eq!(messages.len(), 3);
        assert!(messages[1].content.contains("truncated"));
        // The small file got at least the floor.
        let small_body_len = messages[2].content.len();
        assert!(small_body_len >= 1000);
    }

    #[test]
    fn test_inline_messages_fit_without_truncation() {
        let files = vec![("a.txt".to_string(), "short content".to_string())];
        let messages = inline_messages("task", &files, 100_000);
        assert!(!messages[1].content.contains("truncated"));
        assert!(messages[1].content.contains("short content"));
    }

    #[test]
    fn test_system_message_variants() {
        let default = system_message(&SystemPrompt::Default, &["cat", "grep"]);
        assert!(default.content.contains("cat, grep"));
        assert!(default.content.contains("16 bytes"));

        let custom = system_message(&SystemPrompt::Custom("be terse".to_string()), &[]);
        assert_eq!(custom.content, "be terse");

        let disabled = system_message(&SystemPrompt::ToolsDisabled, &[]);
        assert!(disabled.content.contains("no tools"));
    }
}

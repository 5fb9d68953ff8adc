//! Configuration: defaults, environment variables, and the config file.
//!
//! Settings resolve in three layers, lowest priority first:
//!
//! 1. built-in defaults,
//! 2. the INI-style config file at `~/.config/llmcmd/config` (or the path
//!    given with `-c`),
//! 3. environment variables,
//!
//! with CLI flags applied on top by the binary. The API key is the one
//! setting with no default: a missing or malformed key is a configuration
//! error before any LLM call is made.

use std::env;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Environment variable holding the API key (required).
pub const ENV_API_KEY: &str = "LLMCMD_API_KEY";
/// Environment variable overriding the default model.
pub const ENV_MODEL: &str = "LLMCMD_MODEL";
/// Environment variable overriding the endpoint base URL.
pub const ENV_BASE_URL: &str = "LLMCMD_BASE_URL";
/// Environment variable overriding the weighted-token budget.
pub const ENV_MAX_TOKENS: &str = "LLMCMD_MAX_TOKENS";
/// Environment variable overriding the sampling temperature.
pub const ENV_TEMPERATURE: &str = "LLMCMD_TEMPERATURE";
/// Environment variable overriding the chat-call budget.
pub const ENV_MAX_CALLS: &str = "LLMCMD_MAX_CALLS";
/// Environment variable overriding the session timeout (seconds).
pub const ENV_TIMEOUT: &str = "LLMCMD_TIMEOUT";

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bearer token for the endpoint. No default.
    pub api_key: String,
    /// OpenAI-compatible endpoint base URL.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Model used for nested (non-top-level) chats over the proxy.
    pub nested_model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Weighted-token budget; `<= 0` means unlimited.
    pub max_weighted_tokens: i64,
    /// Per-response token cap.
    pub max_output_tokens: u32,
    /// Maximum chat calls per session.
    pub max_calls: u32,
    /// Session timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            nested_model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_weighted_tokens: 0,
            max_output_tokens: 4096,
            max_calls: 50,
            timeout_secs: 600,
        }
    }
}

impl Settings {
    /// Defaults overlaid with whatever environment variables are set.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Ok(key) = env::var(ENV_API_KEY) {
            settings.api_key = key;
        }
        if let Ok(model) = env::var(ENV_MODEL) {
            settings.model = model;
        }
        if let Ok(url) = env::var(ENV_BASE_URL) {
            settings.base_url = url;
        }
        if let Ok(value) = env::var(ENV_MAX_TOKENS) {
            if let Ok(parsed) = value.parse() {
                settings.max_weighted_tokens = parsed;
            }
        }
        if let Ok(value) = env::var(ENV_TEMPERATURE) {
            if let Ok(parsed) = value.parse() {
                settings.temperature = parsed;
            }
        }
        if let Ok(value) = env::var(ENV_MAX_CALLS) {
            if let Ok(parsed) = value.parse() {
                settings.max_calls = parsed;
            }
        }
        if let Ok(value) = env::var(ENV_TIMEOUT) {
            if let Ok(parsed) = value.parse() {
                settings.timeout_secs = parsed;
            }
        }
        settings
    }

    /// The default user config path (`~/.config/llmcmd/config`), when a
    /// home directory can be determined.
    pub fn default_config_path() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| {
            Path::new(&home)
                .join(".config")
                .join("llmcmd")
                .join("config")
        })
    }

    /// Applies an INI-style config file: `key = value` lines, `#` comments.
    /// Unknown keys are warned about and skipped; malformed values are
    /// configuration errors.
    pub fn apply_config_text(&mut self, text: &str) -> Result<()> {
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::config(format!(
                    "config line {}: expected key = value, got {:?}",
                    line_no + 1,
                    line
                )));
            };
            let key = key.trim();
            let value = value.trim();
            let parse_err = |what: &str| {
                Error::config(format!(
                    "config line {}: invalid {} value {:?}",
                    line_no + 1,
                    what,
                    value
                ))
            };
            match key {
                "api_key" => self.api_key = value.to_string(),
                "base_url" => self.base_url = value.to_string(),
                "model" => self.model = value.to_string(),
                "nested_model" => self.nested_model = value.to_string(),
                "temperature" => {
                    self.temperature = value.parse().map_err(|_| parse_err("temperature"))?
                }
                "max_tokens" => {
                    self.max_weighted_tokens = value.parse().map_err(|_| parse_err("max_tokens"))?
                }
                "max_output_tokens" => {
                    self.max_output_tokens =
                        value.parse().map_err(|_| parse_err("max_output_tokens"))?
                }
                "max_calls" => {
                    self.max_calls = value.parse().map_err(|_| parse_err("max_calls"))?
                }
                "timeout" => {
                    self.timeout_secs = value.parse().map_err(|_| parse_err("timeout"))?
                }
                other => log::warn!("config line {}: unknown key {:?} ignored", line_no + 1, other),
            }
        }
        Ok(())
    }

    /// Loads and applies a config file from disk.
    pub fn apply_config_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        self.apply_config_text(&text)
    }

    /// Validates the settings that gate session start.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::config(format!(
                "API key is required: set {} or api_key in the config file",
                ENV_API_KEY
            )));
        }
        if self.api_key.chars().any(char::is_whitespace) {
            return Err(Error::config("API key is malformed (contains whitespace)"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::config(
                "base_url must start with http:// or https://",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::config("temperature must be between 0.0 and 2.0"));
        }
        if self.max_calls == 0 {
            return Err(Error::config("max_calls must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// PROMPT PRESETS
// ============================================================================

/// The built-in system-prompt presets, a closed set checked at parse time.
pub const PRESETS: [(&str, &str); 5] = [
    (
        "summarize",
        "You are a summarization agent. Read the input, produce a concise summary \
         that preserves the key facts and figures, write it to stdout, then exit.",
    ),
    (
        "extract",
        "You are an extraction agent. Pull out exactly the records or fields the \
         task asks for, one per line, with no commentary, then exit.",
    ),
    (
        "transform",
        "You are a transformation agent. Rewrite the input into the requested \
         format without adding or dropping information, write the result to \
         stdout, then exit.",
    ),
    (
        "analyze",
        "You are an analysis agent. Compute the statistics or patterns the task \
         asks about, prefer pipelines (sort, uniq -c, wc) over manual counting, \
         report the results, then exit.",
    ),
    (
        "filter",
        "You are a filtering agent. Select only the input lines the task asks \
         for, preserving their order and exact content, write them to stdout, \
         then exit.",
    ),
];

/// The prompt text for a preset, if the name is known.
pub fn preset_prompt(name: &str) -> Option<&'static str> {
    PRESETS
        .iter()
        .find(|(preset, _)| *preset == name)
        .map(|(_, prompt)| *prompt)
}

/// All preset names, in catalogue order.
pub fn preset_names() -> Vec<&'static str> {
    PRESETS.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.api_key.is_empty());
        assert_eq!(settings.max_weighted_tokens, 0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_config_text_round_trip() {
        let mut settings = Settings::default();
        settings
            .apply_config_text(
                "# llmcmd configuration\n\
                 api_key = sk-test-123\n\
                 model = my-model\n\
                 temperature = 0.5\n\
                 max_tokens = 100000\n\
                 max_calls = 12\n\
                 \n\
                 unknown_key = whatever\n",
            )
            .unwrap();
        assert_eq!(settings.api_key, "sk-test-123");
        assert_eq!(settings.model, "my-model");
        assert_eq!(settings.temperature, 0.5);
        assert_eq!(settings.max_weighted_tokens, 100_000);
        assert_eq!(settings.max_calls, 12);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_config_text_rejects_malformed_lines() {
        let mut settings = Settings::default();
        assert!(settings.apply_config_text("just words\n").is_err());
        assert!(settings.apply_config_text("temperature = warm\n").is_err());
        assert!(settings.apply_config_text("max_calls = -3\n").is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_key() {
        let mut settings = Settings::default();
        settings.api_key = "sk test with spaces".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_validate_rejects_bad_url_and_temperature() {
        let mut settings = Settings {
            api_key: "k".to_string(),
            ..Settings::default()
        };
        settings.base_url = "localhost".to_string();
        assert!(settings.validate().is_err());

        settings.base_url = "http://localhost/v1".to_string();
        settings.temperature = 3.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_presets_are_a_closed_set() {
        assert!(preset_prompt("summarize").is_some());
        assert!(preset_prompt("jailbreak").is_none());
        assert_eq!(preset_names().len(), PRESETS.len());
    }
}

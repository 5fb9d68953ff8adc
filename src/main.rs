//! The llmcmd binary: CLI parsing, configuration merge, session launch.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use llmcmd::config::{preset_names, preset_prompt};
use llmcmd::prelude::*;
use llmcmd::{EXIT_SIGNAL_BASE, quota::QuotaSnapshot};

/// Sandboxed LLM agent for text-processing pipelines.
#[derive(Parser, Debug)]
#[command(name = "llmcmd", version, about, disable_help_subcommand = true)]
struct Cli {
    /// Free-form instruction for the agent.
    #[arg(value_name = "INSTRUCTION")]
    instruction: Vec<String>,

    /// Instruction text (overrides the positional words).
    #[arg(short = 'p', long = "prompt")]
    prompt: Option<String>,

    /// System-prompt preset (see --list-presets).
    #[arg(short = 'r', long = "preset")]
    preset: Option<String>,

    /// Input file, readable by the agent (repeatable).
    #[arg(short = 'i', long = "input")]
    input: Vec<String>,

    /// Output file: fd 1 is redirected to it.
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Configuration file path (default: ~/.config/llmcmd/config).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log every LLM call, tool invocation and quota delta.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Print session statistics to stderr at the end.
    #[arg(short = 's', long = "stats")]
    stats: bool,

    /// Do not read the process stdin; fd 0 is immediately at EOF.
    #[arg(short = 'n', long = "no-stdin")]
    no_stdin: bool,

    /// Run without tool calls: inline the inputs and answer directly.
    #[arg(long = "no-tools")]
    no_tools: bool,

    /// List the available presets and exit.
    #[arg(long = "list-presets")]
    list_presets: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if cli.verbose { "llmcmd=debug" } else { "llmcmd=warn" }),
    )
    .init();

    if cli.list_presets {
        for name in preset_names() {
            println!("{}", name);
        }
        std::process::exit(llmcmd::EXIT_OK);
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("llmcmd: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    // Layered configuration: defaults <- config file <- environment; the
    // environment pass ran first only to locate overrides, so re-apply it
    // on top of the file.
    let mut settings = Settings::default();
    match &cli.config {
        Some(path) => settings.apply_config_file(path)?,
        None => {
            if let Some(path) = Settings::default_config_path() {
                if path.exists() {
                    settings.apply_config_file(&path)?;
                }
            }
        }
    }
    let env_overrides = Settings::from_env();
    if !env_overrides.api_key.is_empty() {
        settings.api_key = env_overrides.api_key;
    }
    if std::env::var_os(llmcmd::config::ENV_MODEL).is_some() {
        settings.model = env_overrides.model;
    }
    if std::env::var_os(llmcmd::config::ENV_BASE_URL).is_some() {
        settings.base_url = env_overrides.base_url;
    }
    if std::env::var_os(llmcmd::config::ENV_MAX_TOKENS).is_some() {
        settings.max_weighted_tokens = env_overrides.max_weighted_tokens;
    }
    if std::env::var_os(llmcmd::config::ENV_TEMPERATURE).is_some() {
        settings.temperature = env_overrides.temperature;
    }
    if std::env::var_os(llmcmd::config::ENV_MAX_CALLS).is_some() {
        settings.max_calls = env_overrides.max_calls;
    }
    if std::env::var_os(llmcmd::config::ENV_TIMEOUT).is_some() {
        settings.timeout_secs = env_overrides.timeout_secs;
    }
    settings.validate()?;

    let system_prompt = match &cli.preset {
        Some(name) => {
            let text = preset_prompt(name).ok_or_else(|| {
                Error::Config(format!(
                    "unknown preset {:?} (available: {})",
                    name,
                    preset_names().join(", ")
                ))
            })?;
            SystemPrompt::Custom(text.to_string())
        }
        None => SystemPrompt::Default,
    };

    let prompt = match &cli.prompt {
        Some(text) => text.clone(),
        None if !cli.instruction.is_empty() => cli.instruction.join(" "),
        None => {
            return Err(Error::Config(
                "no instruction given (pass it as arguments or with --prompt)".to_string(),
            ));
        }
    };

    // Session endpoints: process stdio, with fd 0 optionally silenced and
    // fd 1 optionally redirected to the declared output file.
    let stdin = if cli.no_stdin {
        ByteReader::empty()
    } else {
        ByteReader::new(Box::new(tokio::io::stdin()))
    };
    let stdout = match &cli.output {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await
                .map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
            ByteWriter::new(Box::new(file))
        }
        None => ByteWriter::new(Box::new(tokio::io::stdout())),
    };
    let stderr = ByteWriter::new(Box::new(tokio::io::stderr()));

    let outputs: Vec<String> = cli.output.iter().cloned().collect();
    let dispatcher = ToolDispatcher::new(
        stdin,
        stdout,
        stderr,
        cli.input.clone(),
        outputs,
        true,
    )
    .await?;

    let quota = Arc::new(QuotaManager::new(
        settings.max_weighted_tokens,
        QuotaWeights::default(),
    ));
    let backend = Arc::new(LlmClient::new(
        settings.base_url.clone(),
        settings.api_key.clone(),
        Duration::from_secs(120),
    )?);

    let config = SessionConfig {
        model: settings.model.clone(),
        temperature: settings.temperature,
        max_output_tokens: Some(settings.max_output_tokens),
        max_calls: settings.max_calls,
        system_prompt,
        prompt,
        input_names: cli.input.clone(),
        session_timeout: Duration::from_secs(settings.timeout_secs),
        call_timeout: Duration::from_secs(120),
        process_id: std::process::id(),
    };

    let orchestrator = Orchestrator::new(backend, dispatcher, quota, config);
    let outcome = tokio::select! {
        outcome = async {
            if cli.no_tools {
                orchestrator.run_tools_disabled().await
            } else {
                orchestrator.run().await
            }
        } => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("llmcmd: interrupted");
            std::process::exit(EXIT_SIGNAL_BASE + 2);
        }
    };

    if cli.stats {
        print_stats(&outcome);
    }
    if let Some(message) = &outcome.message {
        log::info!("session message: {}", message);
    }
    Ok(outcome.exit_code)
}

fn print_stats(outcome: &SessionOutcome) {
    let QuotaSnapshot {
        usage,
        total_weighted,
        remaining,
        quota_exceeded,
    } = &outcome.usage;
    eprintln!("--- session stats ---");
    eprintln!("calls used:      {}", outcome.calls_used);
    eprintln!("input tokens:    {}", usage.input);
    eprintln!("cached tokens:   {}", usage.cached);
    eprintln!("output tokens:   {}", usage.output);
    eprintln!("weighted total:  {:.0}", total_weighted);
    match remaining {
        -1 => eprintln!("remaining:       unlimited"),
        r => eprintln!("remaining:       {}{}", r, if *quota_exceeded { " (exceeded)" } else { "" }),
    }
    eprintln!("exit code:       {}", outcome.exit_code);
}

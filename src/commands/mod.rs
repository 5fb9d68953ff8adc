//! The built-in command registry.
//!
//! Every text command the pipeline runner can spawn implements the same
//! contract: `execute(args, io) -> exit code`. Commands are pure with
//! respect to global state — they see only their arguments and the
//! [`CommandIo`] they are handed. Named file arguments (e.g. `grep PATTERN
//! file.txt`, `tee out.txt`) resolve through the sandbox's virtual
//! filesystem, never the real one directly, so the permission gating of the
//! session applies uniformly.
//!
//! The registry is a closed set. `spawn` scripts naming anything else fail
//! with "command not found" before any task starts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::stream::{ByteReader, ByteWriter};
use crate::vfs::Vfs;
use crate::{Error, Result};

mod basic;
mod diff;
mod filter;
mod helpcmd;
mod lines;
mod patch;
mod sort;

pub use diff::DIFF_SEPARATOR;
pub use patch::PATCH_SEPARATOR;

/// Execution context handed to one command invocation.
pub struct CommandIo {
    /// The command's input stream.
    pub stdin: ByteReader,
    /// The command's output stream.
    pub stdout: ByteWriter,
    /// The command's error stream.
    pub stderr: ByteWriter,
    vfs: Option<Arc<Mutex<Vfs>>>,
    top_level: bool,
}

impl CommandIo {
    /// A context with plain streams and no filesystem access (unit tests).
    pub fn new(stdin: ByteReader, stdout: ByteWriter, stderr: ByteWriter) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            vfs: None,
            top_level: false,
        }
    }

    /// A context that can resolve file arguments through the sandbox VFS.
    pub fn with_vfs(
        stdin: ByteReader,
        stdout: ByteWriter,
        stderr: ByteWriter,
        vfs: Arc<Mutex<Vfs>>,
        top_level: bool,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            vfs: Some(vfs),
            top_level,
        }
    }

    /// Opens a named input file through the VFS.
    pub async fn open_input(&self, name: &str) -> Result<ByteReader> {
        match &self.vfs {
            Some(vfs) => vfs.lock().await.open_for_read(name, self.top_level).await,
            None => Err(Error::tool(format!("{}: not found or not accessible", name))),
        }
    }

    /// Opens a named output file through the VFS.
    pub async fn open_output(&self, name: &str, append: bool) -> Result<ByteWriter> {
        match &self.vfs {
            Some(vfs) => {
                vfs.lock()
                    .await
                    .open_for_write(name, append, self.top_level)
                    .await
            }
            None => Err(Error::tool(format!("{}: not found or not accessible", name))),
        }
    }
}

/// The uniform contract every built-in command implements.
#[async_trait]
pub trait Command: Send + Sync {
    /// The name the command is invoked by.
    fn name(&self) -> &'static str;

    /// One-block usage text printed for `--help`.
    fn usage(&self) -> &'static str;

    /// Runs the command to completion. Returns the exit code; `Err` is
    /// reserved for internal failures and is mapped to exit 1 by the
    /// pipeline runner.
    async fn execute(&self, args: &[String], io: &mut CommandIo) -> Result<i32>;
}

/// Checks for `--help`/`-h` and prints usage when present.
///
/// Returns `true` when the caller should stop and exit 0.
pub(crate) async fn wants_help(args: &[String], usage: &str, io: &CommandIo) -> Result<bool> {
    if args.iter().any(|a| a == "--help" || a == "-h") {
        io.stdout.write_all(usage.as_bytes()).await?;
        if !usage.ends_with('\n') {
            io.stdout.write_all(b"\n").await?;
        }
        return Ok(true);
    }
    Ok(false)
}

/// Reads the whole logical input: the named files in order, or stdin when
/// none are given.
pub(crate) async fn read_all_input(io: &CommandIo, files: &[String]) -> Result<String> {
    if files.is_empty() {
        return Ok(io.stdin.read_to_string_lossy().await?);
    }
    let mut out = String::new();
    for name in files {
        let reader = io.open_input(name).await?;
        out.push_str(&reader.read_to_string_lossy().await?);
    }
    Ok(out)
}

/// Writes a diagnostic line to stderr, prefixed with the command name.
pub(crate) async fn complain(io: &CommandIo, name: &str, msg: &str) -> Result<()> {
    io.stderr
        .write_all(format!("{}: {}\n", name, msg).as_bytes())
        .await?;
    Ok(())
}

/// The closed set of built-in commands.
pub struct CommandRegistry {
    commands: HashMap<&'static str, Arc<dyn Command>>,
}

impl CommandRegistry {
    /// Builds the registry with every built-in installed.
    pub fn builtin() -> Self {
        let mut registry = Self {
            commands: HashMap::new(),
        };
        registry.register(Arc::new(basic::Cat));
        registry.register(Arc::new(basic::Echo));
        registry.register(Arc::new(basic::Tee));
        registry.register(Arc::new(basic::Rev));
        registry.register(Arc::new(basic::Wc));
        registry.register(Arc::new(filter::Grep));
        registry.register(Arc::new(filter::Sed));
        registry.register(Arc::new(filter::Tr));
        registry.register(Arc::new(filter::Cut));
        registry.register(Arc::new(lines::Head));
        registry.register(Arc::new(lines::Tail));
        registry.register(Arc::new(lines::Uniq));
        registry.register(Arc::new(lines::Nl));
        registry.register(Arc::new(sort::Sort));
        registry.register(Arc::new(diff::Diff));
        registry.register(Arc::new(patch::Patch));
        registry.register(Arc::new(helpcmd::Help));
        registry
    }

    fn register(&mut self, command: Arc<dyn Command>) {
        self.commands.insert(command.name(), command);
    }

    /// Looks up a command by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.commands.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contains_the_whitelist() {
        let registry = CommandRegistry::builtin();
        for name in [
            "cat", "grep", "sed", "head", "tail", "sort", "wc", "tr", "cut", "uniq", "nl", "tee",
            "rev", "diff", "patch", "echo", "help",
        ] {
            assert!(registry.get(name).is_some(), "missing builtin: {}", name);
        }
        assert!(registry.get("rm").is_none());
        assert_eq!(registry.names().len(), 17);
    }

    #[tokio::test]
    async fn test_every_command_honors_help_flag() {
        let registry = CommandRegistry::builtin();
        for name in registry.names() {
            let command = registry.get(name).unwrap();
            let (code, stdout, _) = testutil::run(command.as_ref(), &["--help"], "").await;
            assert_eq!(code, 0, "{} --help exit code", name);
            assert!(!stdout.is_empty(), "{} --help printed nothing", name);
        }
    }
}

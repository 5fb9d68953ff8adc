//! The pipeline runner: parse a shell-like script, run it as tasks.
//!
//! The grammar is a small POSIX fragment: commands joined by `|` into
//! pipelines, pipelines chained by `;` (always), `&&` (on success) and `||`
//! (on failure), with per-command redirections `< f`, `> f`, `>> f`, `2> f`
//! and `&> f`. Tokenization is delegated to `shell-words` after a pre-pass
//! that spaces out operators, so quoting behaves the way the model expects
//! from a shell.
//!
//! Execution spawns every command of a pipeline as its own tokio task,
//! connected by bounded anonymous pipes from the VFS. Back-pressure is the
//! pipe buffer; a downstream command exiting early surfaces upstream as a
//! broken pipe, which the task wrapper translates into a clean exit. The
//! pipeline's exit code is the rightmost command's.
//!
//! The runner owns every running command task. The handle table refers to
//! tasks only by [`TaskId`]; `close` on an output handle joins the task
//! through [`TaskRegistry::join`] and reports its exit code.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::commands::{CommandIo, CommandRegistry};
use crate::stream::{ByteReader, ByteWriter, is_broken_pipe};
use crate::vfs::Vfs;
use crate::{Error, Result};

/// Exit code reported for a task that was cancelled rather than joined.
pub const CANCELLED_EXIT_CODE: i32 = 130;

/// Identifier of a running command task in the registry.
pub type TaskId = u64;

// ============================================================================
// SCRIPT GRAMMAR
// ============================================================================

/// How a segment is gated on the previous segment's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `;` (or the first segment): always runs.
    Always,
    /// `&&`: runs when the previous segment exited 0.
    IfSuccess,
    /// `||`: runs when the previous segment exited non-zero.
    IfFailure,
}

/// Per-command redirections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Redirections {
    /// `< file`
    pub stdin: Option<String>,
    /// `> file` / `>> file` (target, append)
    pub stdout: Option<(String, bool)>,
    /// `2> file`
    pub stderr: Option<String>,
    /// `&> file` — stdout and stderr both
    pub both: Option<String>,
}

/// One command of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
    pub redirs: Redirections,
}

/// One `;`/`&&`/`||` segment: a pipeline plus its gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub connector: Connector,
    pub pipeline: Vec<ParsedCommand>,
}

/// Inserts spaces around shell operators outside quotes so `shell-words`
/// tokenizes `grep a|sort` the same as `grep a | sort`.
fn space_operators(script: &str) -> String {
    let mut out = String::with_capacity(script.len() + 16);
    let mut chars = script.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => {
                out.push(c);
                escaped = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            _ if in_single || in_double => out.push(c),
            '|' => {
                if chars.peek() == Some(&'|') {
                    chars.next();
                    out.push_str(" || ");
                } else {
                    out.push_str(" | ");
                }
            }
            ';' => out.push_str(" ; "),
            '&' => {
                if chars.peek() == Some(&'&') {
                    chars.next();
                    out.push_str(" && ");
                } else if chars.peek() == Some(&'>') {
                    chars.next();
                    out.push_str(" &> ");
                } else {
                    out.push(c);
                }
            }
            '>' => {
                if chars.peek() == Some(&'>') {
                    chars.next();
                    out.push_str(" >> ");
                } else {
                    out.push_str(" > ");
                }
            }
            '<' => out.push_str(" < "),
            '2' if chars.peek() == Some(&'>')
                && out.chars().last().map(char::is_whitespace).unwrap_or(true) =>
            {
                chars.next();
                out.push_str(" 2> ");
            }
            other => out.push(other),
        }
    }
    out
}

/// Parses a script into gated segments of pipelines.
pub fn parse_script(script: &str) -> Result<Vec<Segment>> {
    let tokens = shell_words::split(&space_operators(script))
        .map_err(|e| Error::pipeline(format!("parse error: {}", e)))?;

    let mut segments: Vec<Segment> = Vec::new();
    let mut connector = Connector::Always;
    let mut pipeline: Vec<ParsedCommand> = Vec::new();
    let mut current: Option<ParsedCommand> = None;

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        match token.as_str() {
            "|" | ";" | "&&" | "||" => {
                let cmd = current
                    .take()
                    .ok_or_else(|| Error::pipeline(format!("syntax error near {:?}", token)))?;
                pipeline.push(cmd);
                if token == "|" {
                    continue;
                }
                segments.push(Segment {
                    connector,
                    pipeline: std::mem::take(&mut pipeline),
                });
                connector = match token.as_str() {
                    "&&" => Connector::IfSuccess,
                    "||" => Connector::IfFailure,
                    _ => Connector::Always,
                };
            }
            "<" | ">" | ">>" | "2>" | "&>" => {
                let target = iter
                    .next()
                    .ok_or_else(|| Error::pipeline(format!("redirection {:?} missing target", token)))?;
                if matches!(target.as_str(), "|" | ";" | "&&" | "||" | "<" | ">" | ">>" | "2>" | "&>")
                {
                    return Err(Error::pipeline(format!(
                        "redirection {:?} missing target",
                        token
                    )));
                }
                let cmd = current
                    .as_mut()
                    .ok_or_else(|| Error::pipeline(format!("redirection {:?} before command", token)))?;
                match token.as_str() {
                    "<" => cmd.redirs.stdin = Some(target),
                    ">" => cmd.redirs.stdout = Some((target, false)),
                    ">>" => cmd.redirs.stdout = Some((target, true)),
                    "2>" => cmd.redirs.stderr = Some(target),
                    "&>" => cmd.redirs.both = Some(target),
                    _ => unreachable!(),
                }
            }
            word => match current.as_mut() {
                Some(cmd) => cmd.args.push(word.to_string()),
                None => {
                    current = Some(ParsedCommand {
                        name: word.to_string(),
                        args: Vec::new(),
                        redirs: Redirections::default(),
                    });
                }
            },
        }
    }

    if let Some(cmd) = current.take() {
        pipeline.push(cmd);
    }
    if !pipeline.is_empty() {
        segments.push(Segment {
            connector,
            pipeline,
        });
    }
    if segments.is_empty() {
        return Err(Error::pipeline("empty script"));
    }
    Ok(segments)
}

// ============================================================================
// TASK REGISTRY
// ============================================================================

/// Owner of all running pipeline tasks, keyed by [`TaskId`].
#[derive(Default)]
pub struct TaskRegistry {
    next_id: TaskId,
    tasks: HashMap<TaskId, JoinHandle<i32>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running task and returns its id.
    pub fn insert(&mut self, handle: JoinHandle<i32>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(id, handle);
        id
    }

    /// Joins the task, returning its exit code. A task that was aborted
    /// reports [`CANCELLED_EXIT_CODE`]. Joining an unknown or already
    /// joined id is an error.
    pub async fn join(&mut self, id: TaskId) -> Result<i32> {
        let handle = self
            .tasks
            .remove(&id)
            .ok_or_else(|| Error::pipeline(format!("unknown task {}", id)))?;
        match handle.await {
            Ok(code) => Ok(code),
            Err(e) if e.is_cancelled() => Ok(CANCELLED_EXIT_CODE),
            Err(e) => Err(Error::pipeline(format!("task panicked: {}", e))),
        }
    }

    /// Aborts everything still running (session teardown) and joins each
    /// with the cancelled code.
    pub async fn abort_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Number of tasks not yet joined.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Executes scripts against a command registry and the session VFS.
pub struct PipelineRunner {
    registry: Arc<CommandRegistry>,
    vfs: Arc<Mutex<Vfs>>,
    top_level: bool,
    /// Running background tasks; the dispatcher joins them on `close`.
    pub tasks: TaskRegistry,
}

impl PipelineRunner {
    /// Creates a runner over the shared VFS.
    pub fn new(registry: Arc<CommandRegistry>, vfs: Arc<Mutex<Vfs>>, top_level: bool) -> Self {
        Self {
            registry,
            vfs,
            top_level,
            tasks: TaskRegistry::new(),
        }
    }

    /// Parses and validates a script: grammar plus command-name lookup.
    /// Unknown commands are rejected here, before any task or handle is
    /// created.
    pub fn parse(&self, script: &str) -> Result<Vec<Segment>> {
        let segments = parse_script(script)?;
        for segment in &segments {
            for cmd in &segment.pipeline {
                if self.registry.get(&cmd.name).is_none() {
                    return Err(Error::pipeline(format!("command not found: {}", cmd.name)));
                }
            }
        }
        Ok(segments)
    }

    /// Runs a parsed script to completion with the given endpoints.
    pub async fn run(
        &self,
        segments: Vec<Segment>,
        stdin: ByteReader,
        stdout: ByteWriter,
        stderr: ByteWriter,
    ) -> i32 {
        execute_segments(
            self.registry.clone(),
            self.vfs.clone(),
            self.top_level,
            segments,
            stdin,
            stdout,
            stderr,
        )
        .await
    }

    /// Spawns a parsed script in the background, returning the task id the
    /// caller links into the handle table.
    pub fn spawn_background(
        &mut self,
        segments: Vec<Segment>,
        stdin: ByteReader,
        stdout: ByteWriter,
        stderr: ByteWriter,
    ) -> TaskId {
        let registry = self.registry.clone();
        let vfs = self.vfs.clone();
        let top_level = self.top_level;
        let handle = tokio::spawn(async move {
            execute_segments(registry, vfs, top_level, segments, stdin, stdout, stderr).await
        });
        self.tasks.insert(handle)
    }
}

async fn execute_segments(
    registry: Arc<CommandRegistry>,
    vfs: Arc<Mutex<Vfs>>,
    top_level: bool,
    segments: Vec<Segment>,
    stdin: ByteReader,
    stdout: ByteWriter,
    stderr: ByteWriter,
) -> i32 {
    let mut last_code = 0;
    for segment in segments {
        match segment.connector {
            Connector::IfSuccess if last_code != 0 => continue,
            Connector::IfFailure if last_code == 0 => continue,
            _ => {}
        }
        last_code = execute_pipeline(
            &registry,
            &vfs,
            top_level,
            segment.pipeline,
            stdin.clone(),
            stdout.clone(),
            stderr.clone(),
        )
        .await;
    }
    last_code
}

/// Runs one `|` pipeline: every command concurrently, connected by bounded
/// pipes, exit code from the rightmost command.
async fn execute_pipeline(
    registry: &Arc<CommandRegistry>,
    vfs: &Arc<Mutex<Vfs>>,
    top_level: bool,
    commands: Vec<ParsedCommand>,
    stdin: ByteReader,
    stdout: ByteWriter,
    stderr: ByteWriter,
) -> i32 {
    let n = commands.len();
    let mut handles = Vec::with_capacity(n);
    let mut next_stdin = stdin;

    for (index, cmd) in commands.into_iter().enumerate() {
        let last = index == n - 1;

        // stdin: explicit `< file` beats the incoming stream.
        let stage_stdin = if let Some(name) = &cmd.redirs.stdin {
            match vfs.lock().await.open_for_read(name, top_level).await {
                Ok(reader) => reader,
                Err(e) => {
                    report(&stderr, &cmd.name, &e.to_string()).await;
                    return 1;
                }
            }
        } else {
            next_stdin.clone()
        };

        // stdout: explicit redirect beats the pipe to the next stage.
        let (stage_stdout, upstream) = if let Some(name) = &cmd.redirs.both {
            match vfs.lock().await.open_for_write(name, false, top_level).await {
                Ok(writer) => (writer, None),
                Err(e) => {
                    report(&stderr, &cmd.name, &e.to_string()).await;
                    return 1;
                }
            }
        } else if let Some((name, append)) = &cmd.redirs.stdout {
            match vfs.lock().await.open_for_write(name, *append, top_level).await {
                Ok(writer) => (writer, None),
                Err(e) => {
                    report(&stderr, &cmd.name, &e.to_string()).await;
                    return 1;
                }
            }
        } else if last {
            (stdout.clone(), None)
        } else {
            let (reader, writer) = vfs.lock().await.create_pipe();
            (writer, Some(reader))
        };

        // stderr: `2>`/`&>` redirect, else inherit the session's.
        let stage_stderr = if let Some(name) = &cmd.redirs.both {
            match vfs.lock().await.open_for_write(name, true, top_level).await {
                Ok(writer) => writer,
                Err(e) => {
                    report(&stderr, &cmd.name, &e.to_string()).await;
                    return 1;
                }
            }
        } else if let Some(name) = &cmd.redirs.stderr {
            match vfs.lock().await.open_for_write(name, false, top_level).await {
                Ok(writer) => writer,
                Err(e) => {
                    report(&stderr, &cmd.name, &e.to_string()).await;
                    return 1;
                }
            }
        } else {
            stderr.clone()
        };

        next_stdin = match upstream {
            Some(reader) => reader,
            // Redirected stdout mid-pipeline: the next stage reads nothing.
            None => ByteReader::empty(),
        };

        let command = registry
            .get(&cmd.name)
            .expect("parse() validated command names");
        let args = cmd.args.clone();
        let name = cmd.name.clone();
        let report_to = stage_stderr.clone();
        let command_vfs = vfs.clone();
        handles.push(tokio::spawn(async move {
            // File arguments (grep FILE, tee FILE, cat FILE) resolve
            // through the same gated VFS as everything else.
            let mut io = CommandIo::with_vfs(
                stage_stdin,
                stage_stdout,
                stage_stderr,
                command_vfs,
                top_level,
            );
            run_one(command.as_ref(), &name, &args, &mut io, &report_to).await
        }));
    }

    let mut exit_code = 0;
    for handle in handles {
        exit_code = match handle.await {
            Ok(code) => code,
            Err(_) => CANCELLED_EXIT_CODE,
        };
    }
    exit_code
}

async fn run_one(
    command: &dyn crate::commands::Command,
    name: &str,
    args: &[String],
    io: &mut CommandIo,
    report_to: &ByteWriter,
) -> i32 {
    match command.execute(args, io).await {
        Ok(code) => code,
        // A vanished reader is normal termination, not a failure.
        Err(Error::Io(e)) if is_broken_pipe(&e) => 0,
        Err(e) => {
            report(report_to, name, &e.to_string()).await;
            1
        }
    }
}

async fn report(stderr: &ByteWriter, name: &str, msg: &str) {
    let _ = stderr
        .write_all(format!("{}: {}\n", name, msg).as_bytes())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::anon_pipe;
    use crate::vfs::SharedBuffer;

    fn runner() -> PipelineRunner {
        PipelineRunner::new(
            Arc::new(CommandRegistry::builtin()),
            Arc::new(Mutex::new(Vfs::new([], []))),
            false,
        )
    }

    async fn run_script(runner: &PipelineRunner, script: &str, input: &str) -> (i32, String) {
        let segments = runner.parse(script).unwrap();
        let (stdin, feeder) = anon_pipe();
        // Feed concurrently: inputs larger than the pipe buffer must not
        // deadlock the test against back-pressure.
        let payload = input.as_bytes().to_vec();
        let feed = tokio::spawn(async move {
            let _ = feeder.write_all(&payload).await;
            let _ = feeder.send_eof().await;
        });
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        let code = runner
            .run(segments, stdin, out.writer(), err.writer())
            .await;
        feed.await.unwrap();
        (code, String::from_utf8_lossy(&out.snapshot()).into_owned())
    }

    #[test]
    fn test_parse_simple_pipeline() {
        let segments = parse_script("grep ERROR | sort | uniq -c").unwrap();
        assert_eq!(segments.len(), 1);
        let names: Vec<&str> = segments[0]
            .pipeline
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["grep", "sort", "uniq"]);
        assert_eq!(segments[0].pipeline[2].args, vec!["-c"]);
    }

    #[test]
    fn test_parse_operators_without_spaces() {
        let segments = parse_script("grep a|sort>out.txt").unwrap();
        assert_eq!(segments[0].pipeline.len(), 2);
        assert_eq!(
            segments[0].pipeline[1].redirs.stdout,
            Some(("out.txt".to_string(), false))
        );
    }

    #[test]
    fn test_parse_quoting_protects_operators() {
        let segments = parse_script("echo 'a|b' \"c;d\"").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].pipeline[0].args, vec!["a|b", "c;d"]);
    }

    #[test]
    fn test_parse_connectors() {
        let segments = parse_script("sort < in ; grep x && wc -l || echo failed").unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].connector, Connector::Always);
        assert_eq!(segments[1].connector, Connector::Always);
        assert_eq!(segments[2].connector, Connector::IfSuccess);
        assert_eq!(segments[3].connector, Connector::IfFailure);
        assert_eq!(segments[0].pipeline[0].redirs.stdin, Some("in".to_string()));
    }

    #[test]
    fn test_parse_stderr_redirects() {
        let segments = parse_script("grep x 2> errs &> all").unwrap();
        let redirs = &segments[0].pipeline[0].redirs;
        assert_eq!(redirs.stderr, Some("errs".to_string()));
        assert_eq!(redirs.both, Some("all".to_string()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_script("").is_err());
        assert!(parse_script("| sort").is_err());
        assert!(parse_script("sort >").is_err());
        assert!(parse_script("sort > |").is_err());
        assert!(parse_script("echo 'unterminated").is_err());
    }

    #[test]
    fn test_unknown_command_rejected_before_execution() {
        let r = runner();
        let err = r.parse("frobnicate -x").unwrap_err();
        assert!(err.to_string().contains("command not found: frobnicate"));
    }

    #[tokio::test]
    async fn test_single_command_pipeline() {
        let r = runner();
        let (code, out) = run_script(&r, "grep ^ap", "apple\nbanana\napricot\n").await;
        assert_eq!(code, 0);
        assert_eq!(out, "apple\napricot\n");
    }

    #[tokio::test]
    async fn test_multi_stage_pipeline() {
        let r = runner();
        let (code, out) = run_script(&r, "sort | uniq -c | sort -n", "b\na\nb\nb\na\n").await;
        assert_eq!(code, 0);
        assert_eq!(out, format!("{:>7} a\n{:>7} b\n", 2, 3));
    }

    #[tokio::test]
    async fn test_exit_code_is_rightmost() {
        let r = runner();
        // grep matches nothing (exit 1) but cat succeeds.
        let (code, _) = run_script(&r, "grep zzz | cat", "a\n").await;
        assert_eq!(code, 0);
        // Rightmost failure wins.
        let (code, _) = run_script(&r, "cat | grep zzz", "a\n").await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_and_or_gating() {
        let r = runner();
        let (code, out) = run_script(&r, "grep zzz && echo found || echo missing", "a\n").await;
        assert_eq!(code, 0);
        assert_eq!(out, "missing\n");

        let (_, out) = run_script(&r, "grep a && echo found", "a\n").await;
        assert_eq!(out, "a\nfound\n");
    }

    #[tokio::test]
    async fn test_redirect_to_virtual_file_and_back() {
        let r = runner();
        let (code, out) = run_script(
            &r,
            "sort > sorted.txt ; cat < sorted.txt | head -n 2",
            "c\na\nb\n",
        )
        .await;
        assert_eq!(code, 0);
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn test_early_exit_downstream_does_not_deadlock() {
        let r = runner();
        // head stops after 1 line; cat keeps writing into a bounded pipe and
        // must finish cleanly on the broken pipe.
        let big: String = (0..50_000).map(|i| format!("line {}\n", i)).collect();
        let (code, out) = run_script(&r, "cat | head -n 1", &big).await;
        assert_eq!(code, 0);
        assert_eq!(out, "line 0\n");
    }

    #[tokio::test]
    async fn test_task_registry_join_and_unknown() {
        let mut tasks = TaskRegistry::new();
        let id = tasks.insert(tokio::spawn(async { 7 }));
        assert_eq!(tasks.join(id).await.unwrap(), 7);
        assert!(tasks.join(id).await.is_err());
    }

    #[tokio::test]
    async fn test_task_registry_abort_reports_cancelled() {
        let mut tasks = TaskRegistry::new();
        let id = tasks.insert(tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            0
        }));
        let handle_count = tasks.running();
        assert_eq!(handle_count, 1);

        // Abort through the join path.
        let handle = tasks.tasks.get(&id).unwrap();
        handle.abort();
        assert_eq!(tasks.join(id).await.unwrap(), CANCELLED_EXIT_CODE);
    }
}

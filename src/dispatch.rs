//! The tool dispatcher: seven tool calls against the sandbox.
//!
//! Each model-emitted tool call is decoded into a typed argument struct and
//! executed against the handle table, the VFS and the pipeline runner. Every
//! outcome — success or failure — becomes the JSON content of a tool
//! message; errors never escape the dispatch loop. The session ends only
//! through the `exit` tool or the orchestrator's budget enforcement.

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::commands::CommandRegistry;
use crate::handles::{FD_STDERR, FD_STDOUT, HandleKind, HandleTable};
use crate::help;
use crate::pipeline::PipelineRunner;
use crate::stream::{ByteReader, ByteWriter, is_broken_pipe};
use crate::transcript::FdMapEntry;
use crate::types::{ChatMessage, OpenMode, ToolCallRequest, ToolName};
use crate::vfs::Vfs;
use crate::{Error, Result};

/// Default byte budget for `read` without an explicit count.
const DEFAULT_READ_BYTES: usize = 4096;
/// Hard cap on a single `read`, lines or bytes notwithstanding.
const MAX_READ_BYTES: usize = 64 * 1024;

/// The model's `exit` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRequest {
    /// Exit code, already clamped to 0–255.
    pub code: i32,
    /// Optional final status message.
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct ReadArgs {
    fd: u32,
    lines: Option<usize>,
    count: Option<usize>,
}

#[derive(Deserialize)]
struct WriteArgs {
    fd: u32,
    data: String,
    #[serde(default)]
    newline: bool,
    #[serde(default)]
    eof: bool,
}

#[derive(Deserialize)]
struct OpenArgs {
    path: String,
    mode: String,
}

#[derive(Deserialize)]
struct SpawnArgs {
    script: String,
    in_fd: Option<u32>,
    out_fd: Option<u32>,
}

#[derive(Deserialize)]
struct CloseArgs {
    fd: u32,
}

#[derive(Deserialize)]
struct HelpArgs {
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct ExitArgs {
    code: i64,
    message: Option<String>,
}

/// Executes tool calls against the session sandbox.
pub struct ToolDispatcher {
    handles: HandleTable,
    vfs: Arc<Mutex<Vfs>>,
    runner: PipelineRunner,
    registry: Arc<CommandRegistry>,
    top_level: bool,
    exit_request: Option<ExitRequest>,
    fd_entries: Vec<FdMapEntry>,
}

impl ToolDispatcher {
    /// Builds the sandbox: permission sets from the declared input/output
    /// files, standard streams on fds 0–2, and each input file pre-opened
    /// on fds 3, 4, ...
    pub async fn new(
        stdin: ByteReader,
        stdout: ByteWriter,
        stderr: ByteWriter,
        inputs: Vec<String>,
        outputs: Vec<String>,
        top_level: bool,
    ) -> Result<Self> {
        let registry = Arc::new(CommandRegistry::builtin());
        let vfs = Arc::new(Mutex::new(Vfs::new(
            inputs.iter().cloned(),
            outputs.iter().cloned(),
        )));
        let runner = PipelineRunner::new(registry.clone(), vfs.clone(), top_level);
        let mut handles = HandleTable::new(stdin, stdout, stderr);

        let mut fd_entries = vec![
            FdMapEntry {
                fd: 0,
                label: "stdin".to_string(),
                redirect: None,
                size: None,
            },
            FdMapEntry {
                fd: 1,
                label: "stdout".to_string(),
                redirect: outputs.first().cloned(),
                size: None,
            },
            FdMapEntry {
                fd: 2,
                label: "stderr".to_string(),
                redirect: None,
                size: None,
            },
        ];

        for name in &inputs {
            let reader = vfs.lock().await.open_for_read(name, top_level).await?;
            let fd = handles.allocate(HandleKind::RealFile, name.clone(), Some(reader), None);
            let size = tokio::fs::metadata(name).await.ok().map(|m| m.len());
            fd_entries.push(FdMapEntry {
                fd,
                label: name.clone(),
                redirect: Some(name.clone()),
                size,
            });
        }

        Ok(Self {
            handles,
            vfs,
            runner,
            registry,
            top_level,
            exit_request: None,
            fd_entries,
        })
    }

    /// The FD map declared to the model.
    pub fn fd_entries(&self) -> &[FdMapEntry] {
        &self.fd_entries
    }

    /// Registered command names, for the system prompt's whitelist.
    pub fn command_names(&self) -> Vec<&'static str> {
        self.registry.names()
    }

    /// The exit request, once the model has made one.
    pub fn exit_request(&self) -> Option<&ExitRequest> {
        self.exit_request.as_ref()
    }

    /// Shared VFS (the proxy server resolves child opens against it).
    pub fn vfs(&self) -> Arc<Mutex<Vfs>> {
        self.vfs.clone()
    }

    /// The session's stdout endpoint (tools-disabled runs write the answer
    /// here directly).
    pub fn stdout(&self) -> Result<ByteWriter> {
        self.handles.writer(FD_STDOUT)
    }

    /// Dispatches one tool call, producing the tool message to append.
    pub async fn dispatch(&mut self, call: &ToolCallRequest) -> ChatMessage {
        let outcome = self
            .dispatch_value(&call.function.name, &call.function.arguments)
            .await;
        let content = match outcome {
            Ok(value) => value.to_string(),
            Err(e) => json!({ "error": error_text(&e) }).to_string(),
        };
        log::debug!(
            "tool {} {} -> {}",
            call.function.name,
            call.function.arguments,
            content
        );
        ChatMessage::tool_result(call.id.clone(), content)
    }

    async fn dispatch_value(&mut self, name: &str, arguments: &str) -> Result<serde_json::Value> {
        let tool: ToolName = name.parse()?;
        let raw = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments
        };
        match tool {
            ToolName::Read => self.do_read(parse_args(raw)?).await,
            ToolName::Write => self.do_write(parse_args(raw)?).await,
            ToolName::Open => self.do_open(parse_args(raw)?).await,
            ToolName::Spawn => self.do_spawn(parse_args(raw)?).await,
            ToolName::Close => self.do_close(parse_args(raw)?).await,
            ToolName::Help => self.do_help(parse_args(raw)?),
            ToolName::Exit => self.do_exit(parse_args(raw)?),
        }
    }

    async fn do_read(&mut self, args: ReadArgs) -> Result<serde_json::Value> {
        let reader = self.handles.reader(args.fd)?;
        let bytes = if let Some(lines) = args.lines {
            reader.read_lines(lines).await?
        } else {
            let budget = args.count.unwrap_or(DEFAULT_READ_BYTES).min(MAX_READ_BYTES);
            reader.read_some(budget).await?
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(json!({ "input": text, "size": bytes.len() }))
    }

    async fn do_write(&mut self, args: WriteArgs) -> Result<serde_json::Value> {
        let writer = self.handles.writer(args.fd)?;
        let mut data = args.data.into_bytes();
        if args.newline {
            data.push(b'\n');
        }
        let size = data.len();
        if let Err(e) = writer.write_all(&data).await {
            if is_broken_pipe(&e) {
                return Err(Error::tool("broken pipe: the reading side has closed"));
            }
            return Err(e.into());
        }
        if args.eof {
            writer.send_eof().await?;
        }
        Ok(json!({ "success": true, "size": size }))
    }

    async fn do_open(&mut self, args: OpenArgs) -> Result<serde_json::Value> {
        let mode: OpenMode = args.mode.parse()?;
        let mut vfs = self.vfs.lock().await;

        // Open the write side first so truncating modes clear the buffer
        // before a reader takes its snapshot.
        let writer = if mode.is_writable() {
            Some(
                vfs.open_for_write(&args.path, mode.appends(), self.top_level)
                    .await?,
            )
        } else {
            None
        };
        let reader = if mode.is_readable() {
            Some(vfs.open_for_read(&args.path, self.top_level).await?)
        } else {
            None
        };

        let kind = if vfs.virtual_file(&args.path).is_some() {
            HandleKind::VirtualFile
        } else {
            HandleKind::RealFile
        };
        drop(vfs);

        let fd = self
            .handles
            .allocate(kind, args.path.clone(), reader, writer);
        Ok(json!({ "fd": fd }))
    }

    async fn do_spawn(&mut self, args: SpawnArgs) -> Result<serde_json::Value> {
        // Parse and validate before any handle is allocated, so failed
        // spawns leave no debris behind.
        let segments = self.runner.parse(&args.script)?;
        let stderr = self
            .handles
            .writer(FD_STDERR)
            .unwrap_or_else(|_| ByteWriter::sink());

        match (args.in_fd, args.out_fd) {
            (None, None) => {
                let (pipe_in_reader, pipe_in_writer) = self.vfs.lock().await.create_pipe();
                let (pipe_out_reader, pipe_out_writer) = self.vfs.lock().await.create_pipe();

                let in_fd = self.handles.allocate(
                    HandleKind::CommandStdio,
                    format!("stdin of: {}", args.script),
                    None,
                    Some(pipe_in_writer),
                );
                let out_fd = self.handles.allocate(
                    HandleKind::CommandStdio,
                    format!("stdout of: {}", args.script),
                    Some(pipe_out_reader),
                    None,
                );
                // The model-facing output consumes what the model feeds in:
                // close the read side before the write side.
                self.handles.add_dependent(in_fd, out_fd)?;

                let task = self
                    .runner
                    .spawn_background(segments, pipe_in_reader, pipe_out_writer, stderr);
                self.handles.set_task(out_fd, task)?;
                Ok(json!({ "in_fd": in_fd, "out_fd": out_fd }))
            }
            (Some(in_fd), None) => {
                let stdin = self.handles.take_reader(in_fd)?;
                let (pipe_out_reader, pipe_out_writer) = self.vfs.lock().await.create_pipe();
                let out_fd = self.handles.allocate(
                    HandleKind::CommandStdio,
                    format!("stdout of: {}", args.script),
                    Some(pipe_out_reader),
                    None,
                );
                let task = self
                    .runner
                    .spawn_background(segments, stdin, pipe_out_writer, stderr);
                self.handles.set_task(out_fd, task)?;
                Ok(json!({ "out_fd": out_fd }))
            }
            (None, Some(out_fd)) => {
                let stdout = self.handles.writer(out_fd)?;
                let (pipe_in_reader, pipe_in_writer) = self.vfs.lock().await.create_pipe();
                let in_fd = self.handles.allocate(
                    HandleKind::CommandStdio,
                    format!("stdin of: {}", args.script),
                    None,
                    Some(pipe_in_writer),
                );
                let task = self
                    .runner
                    .spawn_background(segments, pipe_in_reader, stdout, stderr);
                self.handles.set_task(in_fd, task)?;
                Ok(json!({ "in_fd": in_fd }))
            }
            (Some(in_fd), Some(out_fd)) => {
                let stdin = self.handles.take_reader(in_fd)?;
                let stdout = self.handles.writer(out_fd)?;
                let exit_code = self.runner.run(segments, stdin, stdout, stderr).await;
                Ok(json!({ "exit_code": exit_code }))
            }
        }
    }

    async fn do_close(&mut self, args: CloseArgs) -> Result<serde_json::Value> {
        let codes = self.close_cascade(args.fd).await?;
        let mut result = json!({ "success": true });
        if let Some(code) = codes.get(&args.fd).or_else(|| codes.values().last()) {
            result["exit_code"] = json!(code);
            result["message"] = json!(format!("command exited with code {}", code));
        }
        Ok(result)
    }

    /// Closes `fd` and everything that depends on it, dependent-first,
    /// joining backing tasks. Returns the exit codes collected per handle.
    async fn close_cascade(&mut self, fd: u32) -> Result<HashMap<u32, i32>> {
        let order = self.handles.close_order(fd)?;
        let mut codes = HashMap::new();
        for id in order {
            // Before joining a task, the handles feeding it must see EOF,
            // or the join would wait on input that can never end.
            let has_task = self.handles.get(id)?.task.is_some();
            if has_task {
                for feeder in self.handles.feeders_of(id) {
                    if let Ok(writer) = self.handles.writer(feeder) {
                        let _ = writer.send_eof().await;
                    }
                }
            }

            let handle = self.handles.remove(id)?;
            let (reader, writer, task) = handle.into_parts();
            if let Some(writer) = &writer {
                let _ = writer.send_eof().await;
            }
            // Dropping the endpoints releases the underlying streams: the
            // write side EOFs its pipe, the read side breaks its producer.
            drop(reader);
            drop(writer);
            if let Some(task) = task {
                let code = self.runner.tasks.join(task).await?;
                codes.insert(id, code);
            }
        }
        Ok(codes)
    }

    fn do_help(&mut self, args: HelpArgs) -> Result<serde_json::Value> {
        let text = help::lookup(&args.keys)?;
        Ok(json!({ "help": text }))
    }

    fn do_exit(&mut self, args: ExitArgs) -> Result<serde_json::Value> {
        let code = args.code.clamp(0, 255) as i32;
        self.exit_request = Some(ExitRequest {
            code,
            message: args.message.clone(),
        });
        let mut result = json!({ "success": true, "code": code });
        if let Some(message) = args.message {
            result["message"] = json!(message);
        }
        Ok(result)
    }

    /// Session teardown: close every live handle (cascading through
    /// dependencies), then abort whatever tasks are still running.
    pub async fn teardown(&mut self) {
        for id in self.handles.live_ids() {
            if self.handles.contains(id) && id != FD_STDOUT && id != FD_STDERR {
                let _ = self.close_cascade(id).await;
            }
        }
        self.runner.tasks.abort_all().await;
    }
}

fn parse_args<'a, T: Deserialize<'a>>(raw: &'a str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| Error::tool(format!("invalid tool arguments: {}", e)))
}

/// The message placed in `{"error": ...}` results: sandbox-level errors go
/// out verbatim, everything else keeps its taxonomy prefix.
fn error_text(error: &Error) -> String {
    match error {
        Error::Tool(msg) | Error::Pipeline(msg) | Error::InvalidInput(msg) => msg.clone(),
        other => other.to_string(),
    }
}

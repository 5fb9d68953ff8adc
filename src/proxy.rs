//! The FS-proxy protocol: controlled file and LLM access for child agents.
//!
//! A nested agent invocation holds no credentials and no filesystem rights
//! of its own. Everything flows over one inherited pipe pair speaking a
//! length-framed line protocol: each request is a single ASCII header line
//! (`COMMAND arg1 arg2 ...\n`), optionally followed by a binary payload
//! whose byte count appears in the header; each reply is `OK data\n` or
//! `ERROR message\n`, optionally followed by a payload with its length in
//! `data`.
//!
//! | Command    | Request                                              | Reply                          |
//! |------------|------------------------------------------------------|--------------------------------|
//! | OPEN       | `OPEN name mode top_level`                           | `OK fileno`                    |
//! | READ       | `READ fileno size`                                   | `OK n` + n bytes (`OK 0` = EOF)|
//! | WRITE      | `WRITE fileno n` + n bytes                           | `OK written`                   |
//! | CLOSE      | `CLOSE fileno`                                       | `OK`                           |
//! | LLM_CHAT   | `LLM_CHAT top_level in_cnt out_cnt p_len s_len` + payloads | `OK resp_len quota_status` + JSON |
//! | LLM_QUOTA  | `LLM_QUOTA`                                          | `OK usage_summary`             |
//! | LLM_CONFIG | `LLM_CONFIG`                                         | `OK cfg_len` + JSON            |
//!
//! The server enforces the sandbox at the OPEN entry point: a child's
//! `top_level` claim is honored only when the server was explicitly built to
//! allow it. EOF on the request pipe — or abnormal child termination, which
//! produces the same EOF — triggers automatic cleanup of every fileno that
//! client opened. Malformed requests get an `ERROR` reply and the
//! connection keeps serving; only a failure to *send* a reply is fatal.

use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::llm::ChatBackend;
use crate::quota::{QuotaManager, QuotaUsage};
use crate::stream::{ByteReader, ByteWriter};
use crate::types::{ChatMessage, ChatRequest, OpenMode};
use crate::vfs::Vfs;
use crate::{Error, Result};

/// Model settings the server applies to nested chats.
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Model used when the caller is top-level.
    pub model: String,
    /// The fixed small model forced on non-top-level nested chats.
    pub nested_model: String,
    /// Sampling temperature for nested chats.
    pub temperature: f32,
    /// Per-response token cap for nested chats.
    pub max_output_tokens: Option<u32>,
    /// Whether this server honors `top_level=true` claims. False for
    /// every child of a nested invocation.
    pub allow_top_level: bool,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            nested_model: String::new(),
            temperature: 0.2,
            max_output_tokens: Some(2048),
            allow_top_level: false,
        }
    }
}

struct ClientFile {
    reader: Option<ByteReader>,
    writer: Option<ByteWriter>,
}

/// The parent-side protocol server.
///
/// One instance serves many clients; call [`ProxyServer::serve`] on its own
/// task per client so a blocked read on one child cannot starve another.
pub struct ProxyServer<B: ChatBackend> {
    vfs: Arc<Mutex<Vfs>>,
    quota: Arc<QuotaManager>,
    backend: Arc<B>,
    config: ProxyServerConfig,
}

impl<B: ChatBackend> ProxyServer<B> {
    /// Builds a server over the session's VFS and quota manager.
    pub fn new(
        vfs: Arc<Mutex<Vfs>>,
        quota: Arc<QuotaManager>,
        backend: Arc<B>,
        config: ProxyServerConfig,
    ) -> Self {
        Self {
            vfs,
            quota,
            backend,
            config,
        }
    }

    /// Serves one client until EOF on its request pipe.
    ///
    /// Returns `Ok` on orderly EOF (after cleanup) and `Err` only when a
    /// reply could not be sent — the one fatal condition.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W, client_id: u32) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut reader = BufReader::new(reader);
        let mut files: HashMap<u32, ClientFile> = HashMap::new();
        let mut next_fileno: u32 = 3;
        self.quota.register(client_id, Some(std::process::id()));

        let result = loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => break Ok(()), // EOF: orderly shutdown
                Ok(_) => {}
                Err(e) => break Err(Error::Io(e)),
            }

            let reply = self
                .handle_request(line.trim_end(), &mut reader, &mut files, &mut next_fileno, client_id)
                .await;

            let (header, payload) = match reply {
                Ok((header, payload)) => (header, payload),
                Err(e) => (format!("ERROR {}", flatten(&e.to_string())), Vec::new()),
            };
            // Send failures are fatal to this client; cleanup still runs.
            if let Err(e) = writer.write_all(header.as_bytes()).await {
                break Err(Error::Io(e));
            }
            if let Err(e) = writer.write_all(b"\n").await {
                break Err(Error::Io(e));
            }
            if !payload.is_empty() {
                if let Err(e) = writer.write_all(&payload).await {
                    break Err(Error::Io(e));
                }
            }
            if let Err(e) = writer.flush().await {
                break Err(Error::Io(e));
            }
        };

        // Automatic cleanup: every fileno this client opened is closed and
        // the client record retired, whether the exit was orderly or not.
        for (_, file) in files.drain() {
            if let Some(writer) = file.writer {
                let _ = writer.send_eof().await;
            }
        }
        self.quota.unregister(client_id);
        result
    }

    async fn handle_request<R>(
        &self,
        line: &str,
        reader: &mut BufReader<R>,
        files: &mut HashMap<u32, ClientFile>,
        next_fileno: &mut u32,
        client_id: u32,
    ) -> Result<(String, Vec<u8>)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match command {
            "OPEN" => {
                let [name, mode, top_level] = take_args::<3>(&args, "OPEN name mode top_level")?;
                let mode = OpenMode::from_str(mode)?;
                let top_level = parse_bool(top_level)? && self.config.allow_top_level;

                let mut vfs = self.vfs.lock().await;
                let writer = if mode.is_writable() {
                    Some(vfs.open_for_write(name, mode.appends(), top_level).await?)
                } else {
                    None
                };
                let reader_end = if mode.is_readable() {
                    Some(vfs.open_for_read(name, top_level).await?)
                } else {
                    None
                };
                drop(vfs);

                let fileno = *next_fileno;
                *next_fileno += 1;
                files.insert(
                    fileno,
                    ClientFile {
                        reader: reader_end,
                        writer,
                    },
                );
                Ok((format!("OK {}", fileno), Vec::new()))
            }
            "READ" => {
                let [fileno, size] = take_args::<2>(&args, "READ fileno size")?;
                let fileno: u32 = parse_num(fileno)?;
                let size: usize = parse_num(size)?;
                let file = files
                    .get(&fileno)
                    .ok_or_else(|| Error::protocol(format!("unknown fileno {}", fileno)))?;
                let reader_end = file
                    .reader
                    .as_ref()
                    .ok_or_else(|| Error::protocol("not opened for reading"))?;
                let bytes = reader_end.read_some(size).await?;
                Ok((format!("OK {}", bytes.len()), bytes))
            }
            "WRITE" => {
                let [fileno, len] = take_args::<2>(&args, "WRITE fileno length")?;
                let fileno: u32 = parse_num(fileno)?;
                let len: usize = parse_num(len)?;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;

                let file = files
                    .get(&fileno)
                    .ok_or_else(|| Error::protocol(format!("unknown fileno {}", fileno)))?;
                let writer_end = file
                    .writer
                    .as_ref()
                    .ok_or_else(|| Error::protocol("not opened for writing"))?;
                writer_end.write_all(&payload).await?;
                Ok((format!("OK {}", len), Vec::new()))
            }
            "CLOSE" => {
                let [fileno] = take_args::<1>(&args, "CLOSE fileno")?;
                let fileno: u32 = parse_num(fileno)?;
                let file = files
                    .remove(&fileno)
                    .ok_or_else(|| Error::protocol(format!("unknown fileno {}", fileno)))?;
                if let Some(writer_end) = file.writer {
                    let _ = writer_end.send_eof().await;
                }
                Ok(("OK".to_string(), Vec::new()))
            }
            "LLM_QUOTA" => Ok((format!("OK {}", self.quota.summary()), Vec::new())),
            "LLM_CONFIG" => {
                let cfg = json!({
                    "model": self.config.model,
                    "nested_model": self.config.nested_model,
                    "temperature": self.config.temperature,
                    "max_output_tokens": self.config.max_output_tokens,
                })
                .to_string()
                .into_bytes();
                Ok((format!("OK {}", cfg.len()), cfg))
            }
            "LLM_CHAT" => {
                let [top_level, in_cnt, out_cnt, prompt_len, preset_len] =
                    take_args::<5>(&args, "LLM_CHAT top_level in_cnt out_cnt prompt_len preset_len")?;
                let top_level = parse_bool(top_level)? && self.config.allow_top_level;
                let in_cnt: usize = parse_num(in_cnt)?;
                let out_cnt: usize = parse_num(out_cnt)?;
                let prompt_len: usize = parse_num(prompt_len)?;
                let preset_len: usize = parse_num(preset_len)?;

                // Payload: one name per line for inputs then outputs, then
                // the prompt and preset as raw byte runs.
                let mut names = Vec::new();
                for _ in 0..in_cnt + out_cnt {
                    let mut name = String::new();
                    reader.read_line(&mut name).await?;
                    names.push(name.trim_end().to_string());
                }
                let mut prompt = vec![0u8; prompt_len];
                reader.read_exact(&mut prompt).await?;
                let mut preset = vec![0u8; preset_len];
                reader.read_exact(&mut preset).await?;

                if !self.quota.can_call(client_id) {
                    return Err(Error::budget("quota exhausted"));
                }

                let prompt = String::from_utf8_lossy(&prompt).into_owned();
                let preset = String::from_utf8_lossy(&preset).into_owned();
                let mut messages = Vec::new();
                if !preset.is_empty() {
                    messages.push(ChatMessage::system(preset));
                }
                messages.push(ChatMessage::user(prompt));

                // A nested caller never chooses its own model.
                let model = if top_level {
                    self.config.model.clone()
                } else {
                    self.config.nested_model.clone()
                };
                let request = ChatRequest {
                    model,
                    messages,
                    tools: None,
                    tool_choice: None,
                    max_tokens: self.config.max_output_tokens,
                    temperature: Some(self.config.temperature),
                };
                let response = self.backend.chat(&request).await?;
                if let Some(usage) = &response.usage {
                    self.quota
                        .consume(client_id, &QuotaUsage::from_usage_block(usage));
                }

                let content = response.message()?.content.clone();
                let body = json!({ "content": content }).to_string().into_bytes();
                let quota_status = if self.quota.quota_exceeded() {
                    "exceeded"
                } else {
                    "ok"
                };
                Ok((format!("OK {} {}", body.len(), quota_status), body))
            }
            "" => Err(Error::protocol("empty request")),
            other => Err(Error::protocol(format!("unknown command {:?}", other))),
        }
    }
}

/// The child-side protocol client.
pub struct ProxyClient<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> ProxyClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps the inherited pipe pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn request(&mut self, header: &str, payload: &[u8]) -> Result<String> {
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        if !payload.is_empty() {
            self.writer.write_all(payload).await?;
        }
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(Error::protocol("server closed the connection"));
        }
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("OK") {
            Ok(rest.trim_start().to_string())
        } else if let Some(message) = line.strip_prefix("ERROR ") {
            Err(Error::protocol(message.to_string()))
        } else {
            Err(Error::protocol(format!("malformed reply {:?}", line)))
        }
    }

    async fn read_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Opens `name` on the parent, returning the fileno.
    pub async fn open(&mut self, name: &str, mode: OpenMode, top_level: bool) -> Result<u32> {
        if name.chars().any(char::is_whitespace) {
            return Err(Error::protocol(
                "file names with whitespace cannot cross the proxy",
            ));
        }
        let data = self
            .request(&format!("OPEN {} {} {}", name, mode, top_level), &[])
            .await?;
        parse_num(&data)
    }

    /// Reads up to `size` bytes. Empty means EOF.
    pub async fn read(&mut self, fileno: u32, size: usize) -> Result<Vec<u8>> {
        let data = self.request(&format!("READ {} {}", fileno, size), &[]).await?;
        let len: usize = parse_num(&data)?;
        self.read_payload(len).await
    }

    /// Writes `payload`, returning the byte count the parent accepted.
    pub async fn write(&mut self, fileno: u32, payload: &[u8]) -> Result<usize> {
        let data = self
            .request(&format!("WRITE {} {}", fileno, payload.len()), payload)
            .await?;
        parse_num(&data)
    }

    /// Closes a fileno on the parent.
    pub async fn close(&mut self, fileno: u32) -> Result<()> {
        self.request(&format!("CLOSE {}", fileno), &[]).await?;
        Ok(())
    }

    /// Fetches the parent's quota summary line.
    pub async fn quota(&mut self) -> Result<String> {
        self.request("LLM_QUOTA", &[]).await
    }

    /// Fetches the parent's nested-chat configuration.
    pub async fn config(&mut self) -> Result<serde_json::Value> {
        let data = self.request("LLM_CONFIG", &[]).await?;
        let len: usize = parse_num(&data)?;
        let payload = self.read_payload(len).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Runs a nested chat through the parent. Returns the reply JSON and
    /// the quota status token.
    pub async fn chat(
        &mut self,
        prompt: &str,
        preset: &str,
        inputs: &[String],
        outputs: &[String],
        top_level: bool,
    ) -> Result<(serde_json::Value, String)> {
        let mut payload = Vec::new();
        for name in inputs.iter().chain(outputs) {
            payload.extend_from_slice(name.as_bytes());
            payload.push(b'\n');
        }
        payload.extend_from_slice(prompt.as_bytes());
        payload.extend_from_slice(preset.as_bytes());

        let header = format!(
            "LLM_CHAT {} {} {} {} {}",
            top_level,
            inputs.len(),
            outputs.len(),
            prompt.len(),
            preset.len()
        );
        let data = self.request(&header, &payload).await?;
        let mut parts = data.split_whitespace();
        let len: usize = parse_num(parts.next().unwrap_or(""))?;
        let status = parts.next().unwrap_or("ok").to_string();
        let body = self.read_payload(len).await?;
        Ok((serde_json::from_slice(&body)?, status))
    }
}

fn take_args<'a, const N: usize>(args: &[&'a str], usage: &str) -> Result<[&'a str; N]> {
    if args.len() != N {
        return Err(Error::protocol(format!("expected {}", usage)));
    }
    let mut out = [""; N];
    out.copy_from_slice(args);
    Ok(out)
}

fn parse_num<T: FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::protocol(format!("invalid number {:?}", s)))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::protocol(format!("invalid boolean {:?}", other))),
    }
}

/// Replies are single lines; anything multi-line in an error message would
/// corrupt the framing.
fn flatten(message: &str) -> String {
    message.replace('\n', " ")
}

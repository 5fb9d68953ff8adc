//! Virtual filesystem: named in-memory files plus gated real-file access.
//!
//! The sandbox never hands the model a raw path. Every `open` resolves here,
//! against three layers:
//!
//! 1. a cache of already-opened real files (repeated opens share a handle),
//! 2. named virtual files — in-memory byte buffers created on demand,
//! 3. the real filesystem, reachable only when the session is top-level or
//!    the name appears in the declared input/output sets.
//!
//! # Pipe vs named-file semantics
//!
//! An anonymous pipe (from [`Vfs::create_pipe`]) is strictly single-shot:
//! once its sole consumer drains the buffer, further reads return EOF.
//! A named virtual file instead supports any number of opens, each producing
//! a fresh reader positioned at offset 0 of the buffer as it stands; writers
//! append, and each reader sees the bytes written before its read call.
//!
//! Permission sets are fixed at session start from the input/output file
//! lists. In a non-top-level (nested-agent) context, a write to a name
//! outside the write set silently lands in a virtual file instead of
//! touching the real filesystem.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::stream::{ByteReader, ByteWriter, anon_pipe};
use crate::{Error, Result};

// ============================================================================
// SHARED BUFFER + VIRTUAL FILE ENDPOINTS
// ============================================================================

/// The byte storage behind one named virtual file.
///
/// Writers append under the lock; readers copy out from their own offset.
/// The lock is only ever held for a memcpy, never across an await.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer seeded with `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current contents out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    /// Truncates to zero length (open mode `w`).
    pub fn clear(&self) {
        self.bytes.lock().unwrap().clear();
    }

    /// A fresh reader positioned at offset 0.
    pub fn reader(&self) -> ByteReader {
        ByteReader::new(Box::new(BufferReader {
            buffer: self.clone(),
            pos: 0,
        }))
    }

    /// An appending writer.
    pub fn writer(&self) -> ByteWriter {
        ByteWriter::new(Box::new(BufferWriter {
            buffer: self.clone(),
        }))
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer").field("len", &self.len()).finish()
    }
}

/// Read side of a virtual file: independent position, EOF at the end of the
/// bytes present when the read happens.
struct BufferReader {
    buffer: SharedBuffer,
    pos: usize,
}

impl AsyncRead for BufferReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let bytes = self.buffer.bytes.lock().unwrap();
        if self.pos >= bytes.len() {
            // Snapshot semantics: the end of the current buffer is EOF,
            // not "wait for more".
            return Poll::Ready(Ok(()));
        }
        let n = buf.remaining().min(bytes.len() - self.pos);
        buf.put_slice(&bytes[self.pos..self.pos + n]);
        drop(bytes);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Write side of a virtual file: append-only.
struct BufferWriter {
    buffer: SharedBuffer,
}

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.bytes.lock().unwrap().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// VFS
// ============================================================================

/// The session's filesystem view.
pub struct Vfs {
    /// Named in-memory files.
    virtual_files: HashMap<String, SharedBuffer>,

    /// Real files already opened for reading; repeated opens share a handle.
    real_readers: HashMap<String, ByteReader>,

    /// Real files already opened for writing.
    real_writers: HashMap<String, ByteWriter>,

    /// Names the session may read from the real filesystem.
    read_allowed: HashSet<String>,

    /// Names the session may write on the real filesystem.
    write_allowed: HashSet<String>,
}

impl Vfs {
    /// Builds the filesystem view from the declared input/output sets.
    pub fn new(
        inputs: impl IntoIterator<Item = String>,
        outputs: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            virtual_files: HashMap::new(),
            real_readers: HashMap::new(),
            real_writers: HashMap::new(),
            read_allowed: inputs.into_iter().collect(),
            write_allowed: outputs.into_iter().collect(),
        }
    }

    /// Whether `name` currently resolves to anything readable.
    pub fn contains(&self, name: &str) -> bool {
        self.virtual_files.contains_key(name)
            || self.real_readers.contains_key(name)
            || self.read_allowed.contains(name)
    }

    /// Direct access to a virtual file's buffer (tests and stats).
    pub fn virtual_file(&self, name: &str) -> Option<&SharedBuffer> {
        self.virtual_files.get(name)
    }

    /// Creates (or returns) a named virtual file.
    pub fn ensure_virtual(&mut self, name: &str) -> SharedBuffer {
        self.virtual_files
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Opens `name` for reading.
    ///
    /// Resolution order: cached real handle, named virtual file, then the
    /// real filesystem if `top_level` or the name is in the read set.
    pub async fn open_for_read(&mut self, name: &str, top_level: bool) -> Result<ByteReader> {
        if let Some(cached) = self.real_readers.get(name) {
            return Ok(cached.clone());
        }

        if let Some(buffer) = self.virtual_files.get(name) {
            return Ok(buffer.reader());
        }

        if top_level || self.read_allowed.contains(name) {
            let file = tokio::fs::File::open(name)
                .await
                .map_err(|e| Error::tool(format!("{}: {}", name, e)))?;
            let reader = ByteReader::new(Box::new(file));
            self.real_readers.insert(name.to_string(), reader.clone());
            return Ok(reader);
        }

        Err(Error::tool(format!("{}: not found or not accessible", name)))
    }

    /// Opens `name` for writing.
    ///
    /// In non-top-level context a name outside the write set becomes an
    /// in-memory virtual file rather than touching the real filesystem.
    pub async fn open_for_write(
        &mut self,
        name: &str,
        append: bool,
        top_level: bool,
    ) -> Result<ByteWriter> {
        if let Some(buffer) = self.virtual_files.get(name) {
            if !append {
                buffer.clear();
            }
            return Ok(buffer.writer());
        }

        if top_level || self.write_allowed.contains(name) {
            if let Some(cached) = self.real_writers.get(name) {
                return Ok(cached.clone());
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(name)
                .await
                .map_err(|e| Error::tool(format!("{}: {}", name, e)))?;
            let writer = ByteWriter::new(Box::new(file));
            self.real_writers.insert(name.to_string(), writer.clone());
            return Ok(writer);
        }

        let buffer = self.ensure_virtual(name);
        Ok(buffer.writer())
    }

    /// Creates an anonymous single-reader, single-writer pipe.
    pub fn create_pipe(&self) -> (ByteReader, ByteWriter) {
        anon_pipe()
    }

    /// Removes `name`: deletes the virtual file, or drops cached real
    /// handles and attempts filesystem removal.
    pub async fn remove(&mut self, name: &str) -> Result<()> {
        if self.virtual_files.remove(name).is_some() {
            return Ok(());
        }

        let had_real =
            self.real_readers.remove(name).is_some() | self.real_writers.remove(name).is_some();
        if had_real || self.read_allowed.contains(name) || self.write_allowed.contains(name) {
            tokio::fs::remove_file(name)
                .await
                .map_err(|e| Error::tool(format!("{}: {}", name, e)))?;
            return Ok(());
        }

        Err(Error::tool(format!("{}: not found or not accessible", name)))
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("virtual_files", &self.virtual_files.len())
            .field("read_allowed", &self.read_allowed)
            .field("write_allowed", &self.write_allowed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_virtual_file_multiple_readers() {
        let mut vfs = Vfs::new([], []);
        let writer = vfs.open_for_write("scratch", false, false).await.unwrap();
        writer.write_all(b"alpha\n").await.unwrap();

        // Each open yields a fresh reader at offset 0.
        let r1 = vfs.open_for_read("scratch", false).await.unwrap();
        assert_eq!(r1.read_to_end().await.unwrap(), b"alpha\n");

        writer.write_all(b"beta\n").await.unwrap();
        let r2 = vfs.open_for_read("scratch", false).await.unwrap();
        assert_eq!(r2.read_to_end().await.unwrap(), b"alpha\nbeta\n");
    }

    #[tokio::test]
    async fn test_virtual_file_truncate_on_write_mode() {
        let mut vfs = Vfs::new([], []);
        let w = vfs.open_for_write("f", false, false).await.unwrap();
        w.write_all(b"old").await.unwrap();

        // Re-open without append truncates.
        let w2 = vfs.open_for_write("f", false, false).await.unwrap();
        w2.write_all(b"new").await.unwrap();
        let r = vfs.open_for_read("f", false).await.unwrap();
        assert_eq!(r.read_to_end().await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_unlisted_read_denied_in_nested_context() {
        let mut vfs = Vfs::new(["input.txt".to_string()], []);
        let err = vfs.open_for_read("/etc/passwd", false).await.unwrap_err();
        assert!(err.to_string().contains("not found or not accessible"));
    }

    #[tokio::test]
    async fn test_unlisted_write_becomes_virtual_in_nested_context() {
        let mut vfs = Vfs::new([], ["out.txt".to_string()]);
        let w = vfs
            .open_for_write("side-channel.txt", false, false)
            .await
            .unwrap();
        w.write_all(b"captured").await.unwrap();

        // Nothing hit the real filesystem; the bytes live in a virtual file.
        assert!(vfs.virtual_file("side-channel.txt").is_some());
        assert_eq!(
            vfs.virtual_file("side-channel.txt").unwrap().snapshot(),
            b"captured"
        );
    }

    #[tokio::test]
    async fn test_real_file_read_allowed_and_cached() {
        let path = std::env::temp_dir().join(format!("llmcmd-vfs-test-{}", std::process::id()));
        let path_str = path.to_string_lossy().into_owned();
        tokio::fs::write(&path, b"line 1\nline 2\n").await.unwrap();

        let mut vfs = Vfs::new([path_str.clone()], []);
        let r1 = vfs.open_for_read(&path_str, false).await.unwrap();
        assert_eq!(r1.read_line_bytes().await.unwrap(), b"line 1\n");

        // A second open returns the cached handle: the position is shared.
        let r2 = vfs.open_for_read(&path_str, false).await.unwrap();
        assert_eq!(r2.read_line_bytes().await.unwrap(), b"line 2\n");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_is_single_shot() {
        let vfs = Vfs::new([], []);
        let (reader, writer) = vfs.create_pipe();
        writer.write_all(b"once").await.unwrap();
        writer.send_eof().await.unwrap();

        assert_eq!(reader.read_to_end().await.unwrap(), b"once");
        // Drained: subsequent reads stay at EOF.
        assert!(reader.read_some(8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_virtual_file() {
        let mut vfs = Vfs::new([], []);
        vfs.ensure_virtual("tmp");
        vfs.remove("tmp").await.unwrap();
        assert!(vfs.virtual_file("tmp").is_none());
        assert!(vfs.remove("tmp").await.is_err());
    }
}

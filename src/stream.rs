//! Byte-stream endpoints shared by handles, pipelines, and commands.
//!
//! Everything that moves bytes in the sandbox — process stdio, anonymous
//! pipes, virtual files, gated real files — is wrapped into one of two
//! endpoint types:
//!
//! - [`ByteReader`]: a buffered, lock-protected read endpoint
//! - [`ByteWriter`]: a lock-protected write endpoint with explicit EOF
//!
//! Both are cheap `Arc` clones. The handle table hands a clone to a spawned
//! pipeline and forgets its own (see `HandleTable::take_*`); when the last
//! clone drops, the underlying stream closes, which is what propagates EOF
//! to peers. Anonymous pipes are [`tokio::io::duplex`] pairs: the buffer is
//! bounded (writers block when it fills), dropping the write side yields EOF
//! on the read side, and writing after the read side is gone yields a
//! `BrokenPipe` error that pipeline commands treat as clean termination.
//!
//! Readers buffer internally so the `read` tool call can serve both
//! line-oriented and byte-oriented requests from the same endpoint.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Capacity of an anonymous pipe's in-memory buffer.
///
/// Writers beyond this block until the reader drains; this is the
/// back-pressure bound for pipeline stages.
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Boxed raw read stream.
pub type RawReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed raw write stream.
pub type RawWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A shared, buffered read endpoint.
///
/// Reads are serialized through an async mutex; within a session exactly one
/// party reads an endpoint at a time (the dispatcher, or the single pipeline
/// command the endpoint was donated to), so the lock is uncontended in
/// practice.
#[derive(Clone)]
pub struct ByteReader {
    inner: Arc<Mutex<BufReader<RawReader>>>,
}

impl ByteReader {
    /// Wraps a raw stream into a buffered shared endpoint.
    pub fn new(raw: RawReader) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufReader::new(raw))),
        }
    }

    /// An endpoint that is immediately at EOF (used for `--no-stdin`).
    pub fn empty() -> Self {
        Self::new(Box::new(tokio::io::empty()))
    }

    /// Reads up to `max` bytes, blocking until at least one byte is
    /// available or the stream hits EOF. Returns an empty vec at EOF.
    pub async fn read_some(&self, max: usize) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let available = inner.fill_buf().await?;
        let n = available.len().min(max);
        let out = available[..n].to_vec();
        inner.consume(n);
        Ok(out)
    }

    /// Reads one line including its terminating newline (if present).
    /// Returns an empty vec at EOF.
    pub async fn read_line_bytes(&self) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let mut line = Vec::new();
        inner.read_until(b'\n', &mut line).await?;
        Ok(line)
    }

    /// Reads up to `n` newline-terminated lines as one byte vector.
    /// Stops early at EOF.
    pub async fn read_lines(&self, n: usize) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();
        for _ in 0..n {
            let len_before = out.len();
            inner.read_until(b'\n', &mut out).await?;
            if out.len() == len_before {
                break;
            }
        }
        Ok(out)
    }

    /// Drains the stream to EOF.
    pub async fn read_to_end(&self) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut *inner, &mut out).await?;
        Ok(out)
    }

    /// Drains the stream to EOF and interprets it as UTF-8, replacing
    /// invalid sequences.
    pub async fn read_to_string_lossy(&self) -> io::Result<String> {
        let bytes = self.read_to_end().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for ByteReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteReader").finish_non_exhaustive()
    }
}

struct WriterInner {
    raw: RawWriter,
    eof_sent: bool,
}

/// A shared write endpoint with explicit EOF propagation.
#[derive(Clone)]
pub struct ByteWriter {
    inner: Arc<Mutex<WriterInner>>,
}

impl ByteWriter {
    /// Wraps a raw stream.
    pub fn new(raw: RawWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterInner {
                raw,
                eof_sent: false,
            })),
        }
    }

    /// A sink that discards everything.
    pub fn sink() -> Self {
        Self::new(Box::new(tokio::io::sink()))
    }

    /// Writes the whole buffer, then flushes.
    ///
    /// Fails with `BrokenPipe` once the peer reader is gone, and with
    /// `BrokenPipe` after EOF has been sent on this endpoint.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.eof_sent {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after EOF",
            ));
        }
        inner.raw.write_all(buf).await?;
        inner.raw.flush().await
    }

    /// Sends EOF downstream. Idempotent.
    pub async fn send_eof(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.eof_sent {
            return Ok(());
        }
        inner.eof_sent = true;
        inner.raw.shutdown().await
    }

    /// Whether EOF has already been propagated on this endpoint.
    pub async fn eof_sent(&self) -> bool {
        self.inner.lock().await.eof_sent
    }
}

impl std::fmt::Debug for ByteWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteWriter").finish_non_exhaustive()
    }
}

/// Creates an anonymous pipe: bytes written to the returned writer come out
/// of the returned reader, through a bounded [`PIPE_BUFFER_SIZE`] buffer.
pub fn anon_pipe() -> (ByteReader, ByteWriter) {
    let (write_half, read_half) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    (
        ByteReader::new(Box::new(read_half)),
        ByteWriter::new(Box::new(write_half)),
    )
}

/// True when an I/O error means the peer went away and writing should stop
/// quietly rather than fail the command.
pub fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_round_trip() {
        let (reader, writer) = anon_pipe();
        writer.write_all(b"hello\nworld\n").await.unwrap();
        writer.send_eof().await.unwrap();

        let line = reader.read_line_bytes().await.unwrap();
        assert_eq!(line, b"hello\n");
        let rest = reader.read_to_end().await.unwrap();
        assert_eq!(rest, b"world\n");
        // Past EOF a pipe keeps returning empty.
        assert!(reader.read_some(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eof_on_writer_drop() {
        let (reader, writer) = anon_pipe();
        writer.write_all(b"x").await.unwrap();
        drop(writer);
        assert_eq!(reader.read_some(16).await.unwrap(), b"x");
        assert!(reader.read_some(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_after_eof_is_broken_pipe() {
        let (_reader, writer) = anon_pipe();
        writer.send_eof().await.unwrap();
        let err = writer.write_all(b"late").await.unwrap_err();
        assert!(is_broken_pipe(&err));
    }

    #[tokio::test]
    async fn test_write_to_dropped_reader_is_broken_pipe() {
        let (reader, writer) = anon_pipe();
        drop(reader);
        // The duplex buffer may absorb a first write; a bounded number of
        // further writes must surface the broken pipe.
        let mut saw_broken = false;
        for _ in 0..4 {
            if let Err(e) = writer.write_all(&[0u8; PIPE_BUFFER_SIZE]).await {
                assert!(is_broken_pipe(&e));
                saw_broken = true;
                break;
            }
        }
        assert!(saw_broken);
    }

    #[tokio::test]
    async fn test_read_lines_stops_at_count_and_eof() {
        let (reader, writer) = anon_pipe();
        writer.write_all(b"a\nb\nc\n").await.unwrap();
        writer.send_eof().await.unwrap();

        let two = reader.read_lines(2).await.unwrap();
        assert_eq!(two, b"a\nb\n");
        let rest = reader.read_lines(10).await.unwrap();
        assert_eq!(rest, b"c\n");
        assert!(reader.read_lines(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_back_pressure_blocks_then_drains() {
        let (reader, writer) = anon_pipe();
        let payload = vec![7u8; PIPE_BUFFER_SIZE * 3];
        let expected = payload.len();

        let producer = tokio::spawn({
            let writer = writer.clone();
            async move {
                writer.write_all(&payload).await.unwrap();
                writer.send_eof().await.unwrap();
            }
        });
        drop(writer);

        let drained = reader.read_to_end().await.unwrap();
        assert_eq!(drained.len(), expected);
        producer.await.unwrap();
    }
}

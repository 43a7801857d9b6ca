//! Buffered protocol connection over a [`WireStream`].
//!
//! Small reads and writes are staged through fixed-capacity buffers to
//! amortize syscalls. The blocked-write handler is the deadlock-avoidance
//! hook for pipelined traffic: before the connection blocks on flushing a
//! full write buffer, an installed handler gets a chance to drain incoming
//! replies that the peer is waiting for us to consume.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::{IoOp, Result, WireError};
use crate::stream::WireStream;

/// Size of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 4096;
/// Size of the per-connection write buffer.
pub const WRITE_BUFFER_SIZE: usize = 4096;

/// Handler invoked when a write is about to block on a full buffer flush.
///
/// The handler may read from the connection (typically draining pending
/// acknowledgements) but must never invoke write paths: that would recurse
/// into the very flush it is unblocking.
#[async_trait]
pub trait BlockHandler: Send {
    async fn on_write_blocked(&mut self, conn: &mut Connection) -> Result<()>;
}

/// A buffered, single-owner protocol connection.
///
/// Exactly one logical task drives a connection at a time; the buffers and
/// byte counters are unsynchronized by design.
pub struct Connection {
    stream: Box<dyn WireStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    block_handler: Option<Box<dyn BlockHandler>>,
    uuid: Option<String>,
    repos_root: Option<String>,
    capabilities: HashSet<String>,
    bytes_read: u64,
    bytes_written: u64,
}

impl Connection {
    pub fn new(stream: Box<dyn WireStream>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            block_handler: None,
            uuid: None,
            repos_root: None,
            capabilities: HashSet::new(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Appends `data` to the write buffer, flushing whenever the buffer
    /// would otherwise exceed its capacity. Writing exactly one buffer's
    /// worth into an empty buffer triggers exactly one flush.
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let space = WRITE_BUFFER_SIZE - self.write_buf.len();
            if rest.len() < space {
                self.write_buf.extend_from_slice(rest);
                return Ok(());
            }
            self.write_buf.extend_from_slice(&rest[..space]);
            rest = &rest[space..];
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes out everything staged in the write buffer.
    ///
    /// If a blocked-write handler is installed it runs first, so that input
    /// the peer needs us to consume gets drained before we commit to a
    /// blocking write.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        while !self.write_buf.is_empty() {
            // Re-run before every write attempt: the peer may be unable to
            // accept more bytes until we consume what it already sent.
            self.run_block_handler().await?;
            let n = self
                .stream
                .write(&self.write_buf)
                .await
                .map_err(|e| WireError::io(IoOp::Write, e))?;
            if n == 0 {
                return Err(WireError::io(
                    IoOp::Write,
                    std::io::Error::new(std::io::ErrorKind::WriteZero, "stream accepted no bytes"),
                ));
            }
            self.bytes_written += n as u64;
            self.write_buf.advance(n);
        }
        trace!(bytes_written = self.bytes_written, "flushed write buffer");
        Ok(())
    }

    async fn run_block_handler(&mut self) -> Result<()> {
        if let Some(mut handler) = self.block_handler.take() {
            let result = handler.on_write_blocked(self).await;
            self.block_handler = Some(handler);
            result?;
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, serving buffered data first and going
    /// to the stream only when the buffer is empty. Returns 0 on clean EOF.
    pub async fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.read_buf.is_empty() && self.fill_read_buf().await? == 0 {
            return Ok(0);
        }
        let n = self.read_buf.len().min(buf.len());
        buf[..n].copy_from_slice(&self.read_buf[..n]);
        self.read_buf.advance(n);
        Ok(n)
    }

    /// Reads a single byte; a mid-item EOF is a protocol error, never a
    /// blocking wait, so the codec surfaces truncation as malformed data.
    pub async fn read_byte(&mut self) -> Result<u8> {
        if self.read_buf.is_empty() && self.fill_read_buf().await? == 0 {
            return Err(WireError::malformed("unexpected connection close"));
        }
        let b = self.read_buf[0];
        self.read_buf.advance(1);
        Ok(b)
    }

    /// Reads exactly `len` bytes, failing on truncation.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.read_raw(&mut out[filled..]).await?;
            if n == 0 {
                return Err(WireError::malformed(format!(
                    "connection closed with {} of {} bytes unread",
                    len - filled,
                    len
                )));
            }
            filled += n;
        }
        Ok(out)
    }

    async fn fill_read_buf(&mut self) -> Result<usize> {
        let mut tmp = [0u8; READ_BUFFER_SIZE];
        let n = self
            .stream
            .read(&mut tmp)
            .await
            .map_err(|e| WireError::io(IoOp::Read, e))?;
        self.bytes_read += n as u64;
        self.read_buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// True if a read could make progress without blocking: either buffered
    /// bytes remain or the stream reports pending data.
    pub fn input_waiting(&mut self) -> bool {
        !self.read_buf.is_empty() || self.stream.has_pending()
    }

    /// Installs a blocked-write handler, replacing any previous one.
    pub fn set_block_handler(&mut self, handler: Box<dyn BlockHandler>) {
        self.block_handler = Some(handler);
    }

    /// Returns to plain blocking writes.
    pub fn clear_block_handler(&mut self) {
        self.block_handler = None;
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.stream.set_timeout(timeout);
    }

    /// Applies a negotiated security layer to the owned stream. Stays in
    /// effect for the remaining life of the connection.
    pub fn wrap_stream<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn WireStream>) -> Box<dyn WireStream>,
    {
        let stream = std::mem::replace(&mut self.stream, Box::new(ClosedStream));
        self.stream = wrap(stream);
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn set_uuid(&mut self, uuid: impl Into<String>) {
        self.uuid = Some(uuid.into());
    }

    pub fn repos_root(&self) -> Option<&str> {
        self.repos_root.as_deref()
    }

    pub fn set_repos_root(&mut self, root: impl Into<String>) {
        self.repos_root = Some(root.into());
    }

    /// Records capability words agreed at connect time. Unknown words are
    /// preserved as-is for forward compatibility.
    pub fn add_capabilities<I, S>(&mut self, caps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for cap in caps {
            self.capabilities.insert(cap.into());
        }
    }

    pub fn has_capability(&self, word: &str) -> bool {
        self.capabilities.contains(word)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(|s| s.as_str())
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    #[cfg(test)]
    pub(crate) fn write_buf_len(&self) -> usize {
        self.write_buf.len()
    }
}

/// Placeholder stream used only while a security layer swap is in flight.
struct ClosedStream;

#[async_trait]
impl WireStream for ClosedStream {
    async fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection stream detached",
        ))
    }

    async fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection stream detached",
        ))
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    fn has_pending(&mut self) -> bool {
        false
    }
}

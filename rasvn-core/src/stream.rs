//! Byte stream abstraction underneath a protocol connection.
//!
//! Different from plain `AsyncRead`/`AsyncWrite` in that it carries a
//! per-stream timeout and can report whether input is immediately available,
//! which the pipelined editor drive needs to poll before blocking.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::TcpStream;

/// A byte-oriented endpoint owned by exactly one connection.
///
/// `read` returns 0 on clean EOF. `write` may be short; callers loop.
/// `has_pending` must be true iff at least one byte can be read without
/// blocking.
#[async_trait]
pub trait WireStream: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn set_timeout(&mut self, timeout: Option<Duration>);
    fn has_pending(&mut self) -> bool;
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    what: &'static str,
    fut: impl std::future::Future<Output = io::Result<T>> + Send,
) -> io::Result<T> {
    match timeout {
        Some(t) => match tokio::time::timeout(t, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, what)),
        },
        None => fut.await,
    }
}

/// Socket-backed stream.
pub struct TcpWireStream {
    inner: TcpStream,
    timeout: Option<Duration>,
}

impl TcpWireStream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            timeout: None,
        }
    }

    /// Connects to `addr` and disables Nagle, matching the latency profile
    /// the request/response protocol wants.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let inner = TcpStream::connect(addr).await?;
        inner.set_nodelay(true)?;
        Ok(Self::new(inner))
    }
}

#[async_trait]
impl WireStream for TcpWireStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_timeout(self.timeout, "read timed out", self.inner.read(buf)).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        with_timeout(self.timeout, "write timed out", self.inner.write(buf)).await
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn has_pending(&mut self) -> bool {
        // A single non-blocking poll of read readiness; does not consume.
        match self.inner.ready(Interest::READABLE).now_or_never() {
            Some(Ok(ready)) => ready.is_readable(),
            _ => false,
        }
    }
}

/// Stream over a reader/writer pair: tunneled subprocess stdio, or an
/// in-memory duplex in tests.
///
/// Pipes have no readiness API of their own, so `has_pending` makes one
/// non-blocking read attempt and parks whatever arrived in a peek buffer
/// that `read` drains first.
pub struct PipeWireStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    peeked: BytesMut,
    timeout: Option<Duration>,
}

impl PipeWireStream {
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader,
            writer,
            peeked: BytesMut::new(),
            timeout: None,
        }
    }

    /// Builds a stream over a spawned tunnel process (e.g. `ssh ... svnserve -t`).
    /// The child must have been spawned with piped stdin/stdout.
    pub fn from_child(child: &mut tokio::process::Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("tunnel process has no piped stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("tunnel process has no piped stdout"))?;
        Ok(Self::new(Box::new(stdout), Box::new(stdin)))
    }
}

#[async_trait]
impl WireStream for PipeWireStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.peeked.is_empty() {
            let n = self.peeked.len().min(buf.len());
            buf[..n].copy_from_slice(&self.peeked[..n]);
            self.peeked.advance(n);
            return Ok(n);
        }
        with_timeout(self.timeout, "read timed out", self.reader.read(buf)).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        with_timeout(self.timeout, "write timed out", self.writer.write(buf)).await
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn has_pending(&mut self) -> bool {
        if !self.peeked.is_empty() {
            return true;
        }
        let mut tmp = [0u8; 4096];
        match self.reader.read(&mut tmp).now_or_never() {
            Some(Ok(n)) if n > 0 => {
                self.peeked.extend_from_slice(&tmp[..n]);
                true
            }
            // EOF or not ready: nothing a read could return right now
            // without blocking (or it would return 0, which callers treat
            // as close, not pending input).
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duplex_pair() -> (PipeWireStream, PipeWireStream) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            PipeWireStream::new(Box::new(ar), Box::new(aw)),
            PipeWireStream::new(Box::new(br), Box::new(bw)),
        )
    }

    #[tokio::test]
    async fn test_pipe_roundtrip() {
        let (mut a, mut b) = duplex_pair();
        let n = a.write(b"hello").await.unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_pipe_has_pending_parks_bytes() {
        let (mut a, mut b) = duplex_pair();
        assert!(!b.has_pending());
        a.write(b"x").await.unwrap();
        // Give the duplex a chance to make the byte visible.
        tokio::task::yield_now().await;
        assert!(b.has_pending());
        // The peeked byte must still come out of read().
        let mut buf = [0u8; 4];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x");
    }

    #[tokio::test]
    async fn test_read_timeout_fires() {
        let (_a, mut b) = duplex_pair();
        b.set_timeout(Some(Duration::from_millis(10)));
        let mut buf = [0u8; 4];
        let err = b.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}

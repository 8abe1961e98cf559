//! Bounded read-ahead over a Tokio `AsyncRead`.
//!
//! [`ReadAhead`] accumulates input for inspection (the first-request peek)
//! and then hands everything back through its own `AsyncRead`, buffered bytes
//! first, so nothing read early is ever lost to the relay that follows.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

pub(crate) struct ReadAhead<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> ReadAhead<R> {
    /// Wraps `inner`, never accumulating more than `limit` bytes.
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(limit.min(4 * 1024)),
            limit,
        }
    }

    /// The accumulated, not-yet-consumed bytes.
    pub(crate) fn peeked(&self) -> &[u8] {
        &self.buf
    }

    /// Whether the accumulation limit has been reached.
    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Reads more input into the accumulation buffer, up to the limit.
    /// Returns the number of bytes added; zero means end of input or a full
    /// buffer.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(room as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadAhead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.buf.len().min(out.remaining());
        let chunk = self.buf.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

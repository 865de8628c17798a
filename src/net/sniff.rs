//! Request-line sniffing on a fresh connection.
//!
//! CONNECT requests bypass hyper entirely, so the first bytes of every
//! connection are read here to pick a path. Bytes consumed while deciding
//! are replayed to hyper through [`PrefixedIo`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Outcome of sniffing a connection's first bytes.
#[derive(Debug)]
pub enum Sniffed {
    /// Request line starts with `CONNECT `; buffer holds everything read so far.
    Connect(BytesMut),
    /// Anything else; buffer must be replayed before the socket.
    Http(BytesMut),
    /// Peer closed before sending a byte.
    Closed,
}

/// Read just enough of `stream` to tell a CONNECT request from anything else.
pub async fn sniff<S>(stream: &mut S) -> io::Result<Sniffed>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(if buf.is_empty() {
                Sniffed::Closed
            } else {
                Sniffed::Http(buf)
            });
        }

        let seen = buf.len().min(CONNECT_PREFIX.len());
        if buf[..seen] != CONNECT_PREFIX[..seen] {
            return Ok(Sniffed::Http(buf));
        }
        if seen == CONNECT_PREFIX.len() {
            return Ok(Sniffed::Connect(buf));
        }
    }
}

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct PrefixedIo<T> {
    prefix: BytesMut,
    inner: T,
}

impl<T> PrefixedIo<T> {
    pub fn new(prefix: BytesMut, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PrefixedIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

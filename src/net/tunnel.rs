//! CONNECT tunnel bridge.
//!
//! # Data Flow
//! ```text
//! Client ── CONNECT head ──▶ Proxy ── TCP connect ──▶ localhost:<target>
//! Client ◀── 200 Connection Established
//! Client ◀═════════ opaque bytes (copy_bidirectional) ═════════▶ Backend
//! ```
//!
//! # Design Decisions
//! - Tunnelled bytes are never inspected, captured or broadcast
//! - Bytes that arrived after the CONNECT head go to the backend first
//! - Either side failing tears down both; no reconnection

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::BACKEND_HOST;

/// Reply sent once the backend connection is up.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Reply sent when the backend cannot be reached.
pub const CONNECT_FAILED: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors that end a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("CONNECT head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("client closed before the CONNECT head was complete")]
    Truncated,

    #[error("backend localhost:{port} unreachable: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes moved in each direction over a tunnel's life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Read until the end of the request head. Returns the head length; `buf`
/// keeps everything read, including bytes past the head.
async fn read_head<S>(stream: &mut S, buf: &mut BytesMut, max_head_bytes: usize) -> Result<usize, TunnelError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf
            .windows(HEAD_TERMINATOR.len())
            .position(|w| w == HEAD_TERMINATOR)
        {
            return Ok(pos + HEAD_TERMINATOR.len());
        }
        if buf.len() >= max_head_bytes {
            return Err(TunnelError::HeadTooLarge(max_head_bytes));
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(TunnelError::Truncated);
        }
    }
}

/// Serve a raw CONNECT connection: finish reading its head, connect to the
/// backend, acknowledge, then splice until either side is done.
pub async fn bridge<S>(
    mut client: S,
    mut buffered: BytesMut,
    target_port: u16,
    max_head_bytes: usize,
) -> Result<TunnelStats, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head_len = read_head(&mut client, &mut buffered, max_head_bytes).await?;
    let early = buffered.split_off(head_len);

    if let Some(line) = buffered[..].split(|b| *b == b'\n').next() {
        tracing::debug!(
            request_line = %String::from_utf8_lossy(line).trim_end(),
            target_port,
            "CONNECT received"
        );
    }

    let mut backend = match TcpStream::connect((BACKEND_HOST, target_port)).await {
        Ok(stream) => stream,
        Err(source) => {
            let _ = client.write_all(CONNECT_FAILED).await;
            let _ = client.shutdown().await;
            return Err(TunnelError::Connect {
                port: target_port,
                source,
            });
        }
    };
    let _ = backend.set_nodelay(true);

    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;
    if !early.is_empty() {
        backend.write_all(&early).await?;
    }

    let mut stats = splice(&mut client, &mut backend).await?;
    stats.client_to_backend += early.len() as u64;
    Ok(stats)
}

/// Copy bytes both ways until both directions reach EOF or one fails.
pub async fn splice<A, B>(client: &mut A, backend: &mut B) -> Result<TunnelStats, TunnelError>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (client_to_backend, backend_to_client) = tokio::io::copy_bidirectional(client, backend).await?;
    Ok(TunnelStats {
        client_to_backend,
        backend_to_client,
    })
}

//! Transport layer
//!
//! A uniform async byte-stream interface over the underlying transport.
//! The listener side (plain TCP, TLS, WebSocket framing) lives outside
//! this crate; anything that can move bytes both ways can implement
//! [`StreamAdapter`] and be attached to a handler.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bidirectional byte stream as seen by the protocol handler.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    /// Receive the next chunk of bytes, at most `max`.
    ///
    /// An empty result signals EOF. Implementations must be restartable:
    /// a call dropped before completion (e.g. by `select!`) must not lose
    /// bytes.
    async fn receive(&mut self, max: usize) -> io::Result<Bytes>;

    /// Send all of `data`.
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the transport.
    async fn close(&mut self) -> io::Result<()>;
}

/// Receive exactly `n` bytes from the adapter; a short result signals EOF.
///
/// Not cancellation-safe: bytes already collected are dropped if the
/// future is. Use only where the read runs to completion.
pub async fn receive_exact(
    stream: &mut dyn StreamAdapter,
    n: usize,
) -> io::Result<Bytes> {
    let mut out = BytesMut::with_capacity(n);
    while out.len() < n {
        let chunk = stream.receive(n - out.len()).await?;
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}

/// [`StreamAdapter`] over any tokio byte stream.
///
/// Buffers internally so that a `receive` interrupted mid-read leaves
/// already-arrived bytes queued for the next call.
pub struct NetStream<S> {
    stream: S,
    pending: BytesMut,
}

impl<S> NetStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
        }
    }

    /// Recover the inner transport.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> StreamAdapter for NetStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn receive(&mut self, max: usize) -> io::Result<Bytes> {
        if self.pending.is_empty() {
            self.pending.reserve(max.max(1));
            let n = self.stream.read_buf(&mut self.pending).await?;
            if n == 0 {
                return Ok(Bytes::new());
            }
        }
        let take = self.pending.len().min(max);
        Ok(self.pending.split_to(take).freeze())
    }

    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

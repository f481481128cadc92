//! Byte-stream adapter over a websocket.
//!
//! The mux layer wants an ordered byte stream; websockets hand us discrete
//! messages. This adapter flattens binary messages into `AsyncRead` and
//! wraps writes into one binary message each, working over both the
//! tungstenite client stream and the axum server socket.

use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Message conversion implemented for each websocket flavor.
pub trait WsMessage: Sized {
    fn binary(data: Vec<u8>) -> Self;
    /// Payload of a binary message; `None` for control/text frames, which
    /// the adapter skips.
    fn into_binary(self) -> Option<Vec<u8>>;
    fn is_close(&self) -> bool;
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn into_binary(self) -> Option<Vec<u8>> {
        match self {
            Self::Binary(data) => Some(data),
            _ => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn into_binary(self) -> Option<Vec<u8>> {
        match self {
            Self::Binary(data) => Some(data),
            _ => None,
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

/// `AsyncRead + AsyncWrite` over a websocket carrying binary messages.
pub struct WsByteStream<S, M> {
    inner: S,
    read_buf: Bytes,
    _marker: std::marker::PhantomData<M>,
}

impl<S, M, E> WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>>,
    M: WsMessage,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

fn to_io_error<E: std::fmt::Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err.to_string())
}

impl<S, M, E> AsyncRead for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: WsMessage + Unpin,
    E: std::fmt::Display,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    if msg.is_close() {
                        return Poll::Ready(Ok(()));
                    }
                    if let Some(data) = msg.into_binary() {
                        self.read_buf = Bytes::from(data);
                    }
                    // Non-binary frames: keep polling.
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(to_io_error(err))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsByteStream<S, M>
where
    S: Sink<M, Error = E> + Unpin,
    M: WsMessage + Unpin,
    E: std::fmt::Display,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(to_io_error(err))),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut self.inner)
            .start_send(M::binary(buf.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(to_io_error)
    }
}

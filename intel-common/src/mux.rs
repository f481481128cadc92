//! Stream multiplexer for the agent/collector websocket.
//!
//! One websocket carries many concurrent logical streams: the control-plane
//! `Listen` stream stays open for the life of the connection while unary
//! calls come and go. Frames use yamux-compatible headers (12 bytes,
//! big-endian: version, type, flags, stream id, length) so the read limit on
//! the websocket can be aligned with the frame cap. Flow-control windows are
//! not enforced; both endpoints are ours and every data frame is capped at
//! [`MAX_FRAME_SIZE`].

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

/// Maximum data-frame payload. The websocket read limit is aligned to this.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const HEADER_LEN: usize = 12;
const PROTO_VERSION: u8 = 0;

const TYPE_DATA: u8 = 0;
const TYPE_WINDOW_UPDATE: u8 = 1;
const TYPE_PING: u8 = 2;
const TYPE_GO_AWAY: u8 = 3;

const FLAG_SYN: u16 = 0x1;
const FLAG_ACK: u16 = 0x2;
const FLAG_FIN: u16 = 0x4;
const FLAG_RST: u16 = 0x8;

/// Per-stream inbound buffer, in frames.
const STREAM_BUFFER: usize = 64;
/// Outbound frame queue shared by all streams.
const WRITE_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum MuxError {
    /// The session was torn down, locally or by the peer.
    #[error("mux session shutdown")]
    SessionShutdown,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
struct Frame {
    ty: u8,
    flags: u16,
    stream_id: u32,
    /// Length field; payload length for data frames, opaque value otherwise.
    length: u32,
    payload: Bytes,
}

impl Frame {
    fn data(stream_id: u32, flags: u16, payload: Bytes) -> Self {
        Self {
            ty: TYPE_DATA,
            flags,
            stream_id,
            length: payload.len() as u32,
            payload,
        }
    }

    fn control(ty: u8, flags: u16, stream_id: u32, length: u32) -> Self {
        Self {
            ty,
            flags,
            stream_id,
            length,
            payload: Bytes::new(),
        }
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&[PROTO_VERSION, self.ty]);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

struct Shared {
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    write_tx: mpsc::Sender<Frame>,
    next_stream_id: AtomicU32,
    shutdown: CancellationToken,
    go_away_sent: AtomicBool,
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A multiplexed session over a reliable byte stream.
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    read_task: tokio::task::JoinHandle<()>,
    write_task: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    /// Start the client half of a session. Client-opened streams use odd ids.
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, 1)
    }

    /// Start the server half of a session. Server-opened streams use even ids.
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, 2)
    }

    fn start<T>(io: T, first_stream_id: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER);
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            write_tx,
            next_stream_id: AtomicU32::new(first_stream_id),
            shutdown: CancellationToken::new(),
            go_away_sent: AtomicBool::new(false),
        });

        let read_task = tokio::spawn(read_loop(read_half, shared.clone(), accept_tx));
        let write_task = tokio::spawn(write_loop(write_half, write_rx, shared.clone()));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            read_task,
            write_task,
        }
    }

    /// Open a new outbound stream.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        if self.shared.is_shutdown() {
            return Err(MuxError::SessionShutdown);
        }
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = register_stream(&self.shared, id);
        self.shared
            .write_tx
            .send(Frame::control(TYPE_WINDOW_UPDATE, FLAG_SYN, id, 0))
            .await
            .map_err(|_| MuxError::SessionShutdown)?;
        Ok(stream)
    }

    /// Wait for the next peer-opened stream.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(MuxError::SessionShutdown)
    }

    /// Resolves once the session is dead, for whatever reason.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Tear the session down, notifying the peer with a GoAway frame.
    pub fn close(&self) {
        if !self.shared.go_away_sent.swap(true, Ordering::SeqCst) {
            let _ = self
                .shared
                .write_tx
                .try_send(Frame::control(TYPE_GO_AWAY, 0, 0, 0));
        }
        self.shared.shutdown.cancel();
        self.shared.streams.lock().unwrap().clear();
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.close();
        self.read_task.abort();
        // Let the write task drain the GoAway before dying with the channel.
        self.write_task.abort();
    }
}

fn register_stream(shared: &Arc<Shared>, id: u32) -> MuxStream {
    let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
    shared.streams.lock().unwrap().insert(id, data_tx);
    MuxStream {
        id,
        shared: shared.clone(),
        data_rx,
        read_buf: Bytes::new(),
        write: PollSender::new(shared.write_tx.clone()),
        fin_sent: false,
    }
}

async fn read_loop<R>(
    mut read_half: R,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let err = loop {
        let mut header = [0u8; HEADER_LEN];
        if let Err(err) = read_half.read_exact(&mut header).await {
            break Some(err.to_string());
        }
        if header[0] != PROTO_VERSION {
            break Some(format!("unknown protocol version {}", header[0]));
        }
        let ty = header[1];
        let flags = u16::from_be_bytes([header[2], header[3]]);
        let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        let payload = if ty == TYPE_DATA {
            if length as usize > MAX_FRAME_SIZE {
                break Some(format!("frame of {length} bytes exceeds read limit"));
            }
            let mut buf = vec![0u8; length as usize];
            if let Err(err) = read_half.read_exact(&mut buf).await {
                break Some(err.to_string());
            }
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        match ty {
            TYPE_DATA | TYPE_WINDOW_UPDATE => {
                handle_stream_frame(&shared, &accept_tx, stream_id, flags, payload).await;
            }
            TYPE_PING => {
                if flags & FLAG_SYN != 0 {
                    let _ = shared
                        .write_tx
                        .send(Frame::control(TYPE_PING, FLAG_ACK, 0, length))
                        .await;
                }
            }
            TYPE_GO_AWAY => {
                debug!("peer sent GoAway, shutting down mux session");
                break None;
            }
            other => break Some(format!("unknown frame type {other}")),
        }
    };
    if let Some(err) = err {
        debug!(error = %err, "mux read loop exited");
    }
    shared.shutdown.cancel();
    shared.streams.lock().unwrap().clear();
}

async fn handle_stream_frame(
    shared: &Arc<Shared>,
    accept_tx: &mpsc::Sender<MuxStream>,
    stream_id: u32,
    flags: u16,
    payload: Bytes,
) {
    if flags & FLAG_SYN != 0 {
        let stream = register_stream(shared, stream_id);
        if accept_tx.send(stream).await.is_err() {
            shared.streams.lock().unwrap().remove(&stream_id);
            return;
        }
    }
    if !payload.is_empty() {
        let tx = shared.streams.lock().unwrap().get(&stream_id).cloned();
        match tx {
            // A slow reader applies backpressure here; the whole session
            // stalls rather than buffering without bound.
            Some(tx) => {
                let _ = tx.send(payload).await;
            }
            None => trace!(stream_id, "dropping data for unknown stream"),
        }
    }
    if flags & (FLAG_FIN | FLAG_RST) != 0 {
        // Removing the sender closes the receiver once it drains.
        shared.streams.lock().unwrap().remove(&stream_id);
    }
}

async fn write_loop<W>(mut write_half: W, mut write_rx: mpsc::Receiver<Frame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = write_rx.recv().await {
        let buf = frame.encode();
        if write_half.write_all(&buf).await.is_err() || write_half.flush().await.is_err() {
            break;
        }
        if frame.ty == TYPE_GO_AWAY {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    shared.shutdown.cancel();
}

/// One logical stream within a [`MuxSession`].
///
/// Reads return EOF after the peer half-closes (FIN) and the buffered frames
/// drain, or when the session dies. Dropping the stream half-closes it.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    data_rx: mpsc::Receiver<Bytes>,
    read_buf: Bytes,
    write: PollSender<Frame>,
    fin_sent: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the parent session has been shut down.
    pub fn session_closed(&self) -> bool {
        self.shared.is_shutdown()
    }
}

impl AsyncRead for MuxStream {
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
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.read_buf = chunk;
                }
                // Channel closed: FIN, RST, or session shutdown. EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.is_shutdown() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                MuxError::SessionShutdown.to_string(),
            )));
        }
        match self.write.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    MuxError::SessionShutdown.to_string(),
                )))
            }
            Poll::Pending => return Poll::Pending,
        }
        let n = buf.len().min(MAX_FRAME_SIZE);
        let frame = Frame::data(self.id, 0, Bytes::copy_from_slice(&buf[..n]));
        if self.write.send_item(frame).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                MuxError::SessionShutdown.to_string(),
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session write task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match self.write.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = Frame::data(self.id, FLAG_FIN, Bytes::new());
                let _ = self.write.send_item(frame);
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            // Session gone; nothing left to half-close.
            Poll::Ready(Err(_)) => {
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.streams.lock().unwrap().remove(&self.id);
        if !self.fin_sent && !self.shared.is_shutdown() {
            let _ = self
                .shared
                .write_tx
                .try_send(Frame::data(self.id, FLAG_FIN, Bytes::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
            server
        });

        let mut stream = client.open().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_interleave() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxSession::client(a));
        let server = Arc::new(MuxSession::server(b));

        let server_task = tokio::spawn({
            let server = server.clone();
            async move {
                for _ in 0..4 {
                    let mut stream = server.accept().await.unwrap();
                    tokio::spawn(async move {
                        let mut data = Vec::new();
                        stream.read_to_end(&mut data).await.unwrap();
                        stream.write_all(&data).await.unwrap();
                        stream.shutdown().await.unwrap();
                    });
                }
            }
        });

        let mut tasks = Vec::new();
        for i in 0u8..4 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = client.open().await.unwrap();
                let payload = vec![i; 1000];
                stream.write_all(&payload).await.unwrap();
                stream.shutdown().await.unwrap();
                let mut echoed = Vec::new();
                stream.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn large_write_spans_frames() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        let payload = vec![0x5Au8; MAX_FRAME_SIZE + 1234];
        let expected = payload.clone();
        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await.unwrap();
            data
        });

        let mut stream = client.open().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);
        assert_eq!(server_task.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn close_unblocks_peer() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::client(a);
        let server = MuxSession::server(b);

        client.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), server.closed())
            .await
            .expect("server should observe shutdown");
        assert!(matches!(
            server.open().await,
            Err(MuxError::SessionShutdown)
        ));
    }
}

//! RPC dispatch over a [`MuxSession`].
//!
//! Every call opens a fresh logical stream. The request is one
//! length-prefixed record (`u32` big-endian length, `u8` method id, prost
//! body). Unary responses are one length-prefixed record (`u8` status, body
//! on success / UTF-8 message on failure). The `Listen` method instead
//! streams length-prefixed `SystemResponse` records until either endpoint
//! closes.

use crate::mux::{MuxError, MuxSession, MuxStream};
use crate::proto::{
    Empty, ListenRequest, RecordInvocationRequest, ReportPathRequest, SystemResponse,
};
use async_trait::async_trait;
use prost::Message;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const METHOD_LISTEN: u8 = 1;
const METHOD_RECORD_INVOCATION: u8 = 2;
const METHOD_REPORT_PATH: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Upper bound on a single RPC record. A full invocation batch fits with
/// room to spare.
const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The session or stream ended; treated as a clean shutdown by the
    /// agent's loops.
    #[error("rpc connection closed")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("message of {0} bytes exceeds the rpc size limit")]
    TooLarge(u32),
    #[error("unknown rpc method {0}")]
    UnknownMethod(u8),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Io(io::Error),
}

impl RpcError {
    /// Whether this error is an expected teardown rather than a fault.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RpcError::Closed | RpcError::Mux(MuxError::SessionShutdown))
    }

    fn from_io(err: io::Error, stream: &MuxStream) -> Self {
        if stream.session_closed() || err.kind() == io::ErrorKind::UnexpectedEof {
            RpcError::Closed
        } else {
            RpcError::Io(err)
        }
    }
}

async fn write_record(stream: &mut MuxStream, parts: &[&[u8]]) -> Result<(), RpcError> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    for part in parts {
        buf.extend_from_slice(part);
    }
    stream
        .write_all(&buf)
        .await
        .map_err(|err| RpcError::from_io(err, stream))
}

async fn read_record(stream: &mut MuxStream) -> Result<Vec<u8>, RpcError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|err| RpcError::from_io(err, stream))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(RpcError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|err| RpcError::from_io(err, stream))?;
    Ok(body)
}

/// Client half of the agent/collector protocol. Lives on the agent.
pub struct RpcClient {
    session: Arc<MuxSession>,
}

impl RpcClient {
    pub fn new(session: MuxSession) -> Self {
        Self {
            session: Arc::new(session),
        }
    }

    /// Resolves when the underlying session dies.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Tear down the transport.
    pub fn close(&self) {
        self.session.close();
    }

    async fn call_unary<Req: Message>(&self, method: u8, req: &Req) -> Result<Empty, RpcError> {
        let mut stream = self.session.open().await?;
        write_record(&mut stream, &[&[method], &req.encode_to_vec()]).await?;
        let record = read_record(&mut stream).await?;
        decode_unary(&record)
    }

    /// Open the server-push control-plane stream.
    pub async fn listen(&self, req: &ListenRequest) -> Result<ListenStream, RpcError> {
        let mut stream = self.session.open().await?;
        write_record(&mut stream, &[&[METHOD_LISTEN], &req.encode_to_vec()]).await?;
        Ok(ListenStream { stream })
    }

    /// Upload a batch of invocations.
    pub async fn record_invocation(
        &self,
        req: &RecordInvocationRequest,
    ) -> Result<Empty, RpcError> {
        self.call_unary(METHOD_RECORD_INVOCATION, req).await
    }

    /// Reserved.
    pub async fn report_path(&self, req: &ReportPathRequest) -> Result<Empty, RpcError> {
        self.call_unary(METHOD_REPORT_PATH, req).await
    }
}

fn decode_unary(record: &[u8]) -> Result<Empty, RpcError> {
    match record.split_first() {
        Some((&STATUS_OK, body)) => Ok(Empty::decode(body)?),
        Some((&STATUS_ERROR, body)) => {
            Err(RpcError::Remote(String::from_utf8_lossy(body).into_owned()))
        }
        _ => Err(RpcError::Closed),
    }
}

/// Receiving half of the `Listen` stream, held by the agent.
pub struct ListenStream {
    stream: MuxStream,
}

impl ListenStream {
    /// Receive the next server directive. Returns [`RpcError::Closed`] when
    /// the stream or session ends.
    pub async fn recv(&mut self) -> Result<SystemResponse, RpcError> {
        let record = read_record(&mut self.stream).await?;
        Ok(SystemResponse::decode(record.as_slice())?)
    }
}

/// Sending half of the `Listen` stream, held by the collector session.
pub struct SystemStream {
    stream: MuxStream,
}

impl SystemStream {
    /// Push one directive to the agent.
    pub async fn send(&mut self, resp: &SystemResponse) -> Result<(), RpcError> {
        write_record(&mut self.stream, &[&resp.encode_to_vec()]).await
    }
}

/// Collector-side handlers, one instance per connected machine.
#[async_trait]
pub trait IntelService: Send + Sync + 'static {
    /// Serve the control-plane stream. The implementation owns the stream
    /// until the session ends; returning closes it.
    async fn listen(&self, req: ListenRequest, stream: SystemStream) -> Result<(), RpcError>;

    async fn record_invocation(&self, req: RecordInvocationRequest) -> Result<Empty, RpcError>;

    async fn report_path(&self, req: ReportPathRequest) -> Result<Empty, RpcError>;
}

/// Serve `service` over `session` until the transport closes.
///
/// Per-stream failures are contained: expected teardown logs at debug,
/// anything else at warn, and the accept loop keeps going either way.
pub async fn serve(session: &MuxSession, service: Arc<dyn IntelService>) {
    loop {
        let stream = match session.accept().await {
            Ok(stream) => stream,
            Err(MuxError::SessionShutdown) => return,
            Err(err) => {
                warn!(error = %err, "mux accept failed");
                return;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_stream(stream, service).await {
                if err.is_shutdown() {
                    debug!(error = %err, "rpc stream closed");
                } else {
                    warn!(error = %err, "rpc stream failed");
                }
            }
        });
    }
}

async fn serve_stream(
    mut stream: MuxStream,
    service: Arc<dyn IntelService>,
) -> Result<(), RpcError> {
    let record = read_record(&mut stream).await?;
    let Some((&method, body)) = record.split_first() else {
        return Err(RpcError::Closed);
    };
    match method {
        METHOD_LISTEN => {
            let req = ListenRequest::decode(body)?;
            service.listen(req, SystemStream { stream }).await
        }
        METHOD_RECORD_INVOCATION => {
            let req = RecordInvocationRequest::decode(body)?;
            let result = service.record_invocation(req).await;
            respond_unary(&mut stream, result).await
        }
        METHOD_REPORT_PATH => {
            let req = ReportPathRequest::decode(body)?;
            let result = service.report_path(req).await;
            respond_unary(&mut stream, result).await
        }
        other => {
            let err = RpcError::UnknownMethod(other);
            respond_unary::<Empty>(&mut stream, Err(RpcError::UnknownMethod(other))).await?;
            Err(err)
        }
    }
}

async fn respond_unary<Resp: Message>(
    stream: &mut MuxStream,
    result: Result<Resp, RpcError>,
) -> Result<(), RpcError> {
    match result {
        Ok(resp) => {
            write_record(stream, &[&[STATUS_OK], &resp.encode_to_vec()]).await?;
        }
        Err(err) => {
            write_record(stream, &[&[STATUS_ERROR], err.to_string().as_bytes()]).await?;
        }
    }
    stream
        .shutdown()
        .await
        .map_err(|err| RpcError::from_io(err, stream))
}

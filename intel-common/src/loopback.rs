//! Loopback transport between the shim and the agent.
//!
//! The shim runs once per tracked invocation, so the send path must stay
//! cheap: a single unix datagram where the platform allows it, otherwise a
//! short-lived TCP connection. The agent side listens with tokio and feeds
//! each decoded request to a callback.
//!
//! The address is resolved from the environment on every call; the shim is a
//! one-shot process so there is no state to keep.

use crate::proto::{
    ReportInvocationRequest, DAEMON_ADDRESS_ENV, DAEMON_SOCKET_NAME, DAEMON_TIMEOUT_ENV,
    LOOPBACK_DIAL_TIMEOUT_MS, LOOPBACK_TCP_ADDRESS,
};
use prost::Message;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

/// Largest loopback message the agent will accept.
const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("invalid daemon address {0:?}")]
    InvalidAddress(String),
    #[error("invalid {DAEMON_TIMEOUT_ENV} value {0:?}")]
    InvalidTimeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Path of the loopback datagram socket.
pub fn socket_path() -> PathBuf {
    std::env::temp_dir().join(DAEMON_SOCKET_NAME)
}

fn datagram_mode() -> bool {
    std::env::var_os(DAEMON_ADDRESS_ENV).is_none() && !cfg!(windows)
}

fn tcp_address() -> String {
    std::env::var(DAEMON_ADDRESS_ENV).unwrap_or_else(|_| LOOPBACK_TCP_ADDRESS.to_string())
}

fn dial_timeout() -> Result<Duration, LoopbackError> {
    match std::env::var(DAEMON_TIMEOUT_ENV) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| LoopbackError::InvalidTimeout(raw)),
        Err(_) => Ok(Duration::from_millis(LOOPBACK_DIAL_TIMEOUT_MS)),
    }
}

/// Send one invocation report to a local agent, if one is running.
///
/// Synchronous by design: the shim exits immediately afterwards, and the
/// sockets are intentionally left for the OS to reap.
pub fn report_invocation(req: &ReportInvocationRequest) -> Result<(), LoopbackError> {
    let data = req.encode_to_vec();
    if datagram_mode() {
        #[cfg(unix)]
        {
            let sock = std::os::unix::net::UnixDatagram::unbound()?;
            sock.set_write_timeout(Some(dial_timeout()?))?;
            sock.connect(socket_path())?;
            sock.send(&data)?;
            return Ok(());
        }
    }
    let address = tcp_address();
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LoopbackError::InvalidAddress(address.clone()))?;
    let mut stream = TcpStream::connect_timeout(&addr, dial_timeout()?)?;
    stream.set_write_timeout(Some(dial_timeout()?))?;
    stream.write_all(&data)?;
    Ok(())
}

/// Handle to a running loopback listener. Aborts the listener task on
/// [`LoopbackListener::close`] or drop.
pub struct LoopbackListener {
    task: JoinHandle<()>,
    #[cfg(unix)]
    socket_file: Option<PathBuf>,
}

impl LoopbackListener {
    pub fn close(&self) {
        self.task.abort();
        #[cfg(unix)]
        if let Some(path) = &self.socket_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Start listening for invocation reports from shims on this host.
///
/// `on_report` is called once per decoded request. Malformed payloads are
/// dropped; a shim crashing mid-write must never take the agent down.
pub fn listen_for_invocations<F>(on_report: F) -> Result<LoopbackListener, LoopbackError>
where
    F: Fn(ReportInvocationRequest) + Send + Sync + 'static,
{
    if datagram_mode() {
        #[cfg(unix)]
        {
            let path = socket_path();
            // A previous daemon may have left the socket file behind.
            let _ = std::fs::remove_file(&path);
            let socket = tokio::net::UnixDatagram::bind(&path)?;
            let task = tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    let Ok(count) = socket.recv(&mut buf).await else {
                        return;
                    };
                    decode_and_report(&buf[..count], &on_report);
                }
            });
            return Ok(LoopbackListener {
                task,
                socket_file: Some(path),
            });
        }
    }

    let address = tcp_address();
    let std_listener = std::net::TcpListener::bind(&address)?;
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;
    let task = tokio::spawn(async move {
        let on_report = std::sync::Arc::new(on_report);
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            let on_report = on_report.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let Ok(count) = conn.read(&mut buf).await else {
                    return;
                };
                decode_and_report(&buf[..count], on_report.as_ref());
            });
        }
    });
    Ok(LoopbackListener {
        task,
        #[cfg(unix)]
        socket_file: None,
    })
}

fn decode_and_report<F>(data: &[u8], on_report: &F)
where
    F: Fn(ReportInvocationRequest),
{
    match ReportInvocationRequest::decode(data) {
        Ok(req) => on_report(req),
        Err(err) => debug!(error = %err, "dropping malformed loopback message"),
    }
}

//! Agent control plane: connect, listen, and upload loops.
//!
//! Three tasks cooperate over one cancellable scope. The connect loop owns
//! the collector connection and publishes the live client; the listen loop
//! consumes server directives and drives the alias installer; the upload
//! loop drains the invocation queue through the current client. All three
//! self-heal with the same bounded back-off.

use crate::client::{Connector, DialError};
use crate::queue::InvocationQueue;
use crate::{pathman, tracker};
use intel_common::proto::{
    system_response, ListenRequest, RecordInvocationRequest, ReportInvocationRequest,
};
use intel_common::queue::FlushLoopError;
use intel_common::rpc::{RpcClient, RpcError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF_FLOOR: Duration = Duration::from_millis(50);
const BACKOFF_CEILING: Duration = Duration::from_secs(10);

/// Default interval between invocation uploads.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

pub struct DaemonOptions {
    pub connector: Connector,
    pub invoke_directory: PathBuf,
    pub flush_interval: Duration,
    pub queue_limit: usize,
    /// Operator-supplied metadata merged over the gathered host facts.
    pub extra_metadata: HashMap<String, String>,
    /// Skip editing shell rc files; used by tests.
    pub manage_path: bool,
}

/// Handle to the running agent.
pub struct Daemon {
    queue: Arc<InvocationQueue>,
    scope: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    client_rx: watch::Receiver<Option<Arc<RpcClient>>>,
    fatal: Arc<Mutex<Option<DialError>>>,
}

impl Daemon {
    pub fn start(opts: DaemonOptions) -> Self {
        let scope = CancellationToken::new();
        let queue = Arc::new(InvocationQueue::new(opts.flush_interval, opts.queue_limit));
        let (client_tx, client_rx) = watch::channel(None);
        let fatal = Arc::new(Mutex::new(None));
        let opts = Arc::new(opts);

        let tasks = vec![
            tokio::spawn(connect_loop(
                opts.clone(),
                scope.clone(),
                client_tx,
                fatal.clone(),
            )),
            tokio::spawn(listen_loop(opts.clone(), scope.clone(), client_rx.clone())),
            tokio::spawn(upload_loop(queue.clone(), scope.clone(), client_rx.clone())),
        ];

        Self {
            queue,
            scope,
            tasks,
            client_rx,
            fatal,
        }
    }

    /// Queue one invocation report from a shim.
    pub fn report_invocation(&self, req: ReportInvocationRequest) {
        let queue = self.queue.clone();
        tokio::spawn(async move { queue.enqueue(req).await });
    }

    pub fn queue(&self) -> &Arc<InvocationQueue> {
        &self.queue
    }

    /// Resolves when the daemon stops on its own (today: fatal dial error).
    pub async fn stopped(&self) {
        self.scope.cancelled().await;
    }

    /// The permanent error that stopped the daemon, if any.
    pub fn fatal_error(&self) -> Option<DialError> {
        self.fatal.lock().unwrap().take()
    }

    /// Cancel the scope and wait for all loops to return.
    pub async fn close(mut self) {
        self.scope.cancel();
        if let Some(client) = self.client_rx.borrow().clone() {
            client.close();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_FLOOR,
        }
    }

    fn reset(&mut self) {
        self.current = BACKOFF_FLOOR;
    }

    /// Sleep the current delay and double it. False when the scope died.
    async fn wait(&mut self, scope: &CancellationToken) -> bool {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_CEILING);
        tokio::select! {
            _ = scope.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn shim_binary_path(invoke_directory: &std::path::Path) -> PathBuf {
    let mut name = "coder-intel-invoke".to_string();
    if cfg!(windows) {
        name.push_str(".exe");
    }
    invoke_directory.join(name)
}

async fn connect_loop(
    opts: Arc<DaemonOptions>,
    scope: CancellationToken,
    client_tx: watch::Sender<Option<Arc<RpcClient>>>,
    fatal: Arc<Mutex<Option<DialError>>>,
) {
    let metadata = crate::host::gather_metadata(&opts.extra_metadata);
    let shim_path = shim_binary_path(&opts.invoke_directory);
    let mut backoff = Backoff::new();

    loop {
        debug!(url = %opts.connector.base_url, "dialing collector");
        let client = match opts.connector.dial(&metadata).await {
            Ok(client) => Arc::new(client),
            Err(err) if err.is_permanent() => {
                error!(error = %err, "not authorized to dial collector, giving up");
                *fatal.lock().unwrap() = Some(err);
                scope.cancel();
                return;
            }
            Err(err) => {
                warn!(error = %err, "collector dial failed");
                if !backoff.wait(&scope).await {
                    return;
                }
                continue;
            }
        };
        info!(instance_id = %opts.connector.instance_id, "connected to collector");

        if let Err(err) = opts.connector.download_shim_binary(&shim_path).await {
            warn!(error = %err, "unable to download shim binary");
            client.close();
            if !backoff.wait(&scope).await {
                return;
            }
            continue;
        }
        backoff.reset();
        client_tx.send_replace(Some(client.clone()));

        tokio::select! {
            _ = scope.cancelled() => {
                client.close();
                return;
            }
            _ = client.closed() => {
                info!("connection to collector closed");
                client_tx.send_replace(None);
            }
        }
        if !backoff.wait(&scope).await {
            return;
        }
    }
}

async fn listen_loop(
    opts: Arc<DaemonOptions>,
    scope: CancellationToken,
    mut client_rx: watch::Receiver<Option<Arc<RpcClient>>>,
) {
    let shim_path = shim_binary_path(&opts.invoke_directory);
    let mut backoff = Backoff::new();

    loop {
        let Some(client) = wait_for_client(&mut client_rx, &scope).await else {
            debug!("shut down before a client connected");
            return;
        };

        if opts.manage_path {
            if let Err(err) = pathman::prepend(&opts.invoke_directory) {
                error!(error = %err, "unable to prepend invoke directory to PATH");
            }
        }

        let request = ListenRequest {
            git_config_email: fetch_git_config("user.email").await,
            git_config_name: fetch_git_config("user.name").await,
            installed_software: Some(Default::default()),
        };
        let mut stream = match client.listen(&request).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "listen stream failed to open");
                if !backoff.wait(&scope).await {
                    return;
                }
                continue;
            }
        };
        backoff.reset();

        loop {
            let response = tokio::select! {
                _ = scope.cancelled() => return,
                response = stream.recv() => response,
            };
            match response {
                Ok(resp) => match resp.msg {
                    Some(system_response::Msg::TrackExecutables(track)) => {
                        match tracker::sync_aliases(
                            &opts.invoke_directory,
                            &shim_path,
                            &track.binary_name,
                        ) {
                            Ok(()) => info!(
                                binary_names = ?track.binary_name,
                                "tracked executables"
                            ),
                            Err(err) => warn!(error = %err, "unable to track executables"),
                        }
                    }
                    None => debug!("ignoring empty system response"),
                },
                Err(err) => {
                    if err.is_shutdown() {
                        debug!("listen stream closed");
                    } else {
                        warn!(error = %err, "unable to receive a directive");
                    }
                    break;
                }
            }
        }
        if !backoff.wait(&scope).await {
            return;
        }
    }
}

async fn upload_loop(
    queue: Arc<InvocationQueue>,
    scope: CancellationToken,
    client_rx: watch::Receiver<Option<Arc<RpcClient>>>,
) {
    loop {
        let result = queue
            .batch()
            .run_flush_loop(scope.clone(), |invocations| {
                let mut client_rx = client_rx.clone();
                let scope = scope.clone();
                async move {
                    let Some(client) = wait_for_client(&mut client_rx, &scope).await else {
                        return Err(RpcError::Closed);
                    };
                    client
                        .record_invocation(&RecordInvocationRequest { invocations })
                        .await?;
                    Ok(())
                }
            })
            .await;
        match result {
            Ok(()) => return,
            Err(FlushLoopError::Canceled) => {
                debug!("invocation upload loop exited");
                return;
            }
            // The batch stays queued; it is retried on the next connect.
            Err(FlushLoopError::Flush(err)) if err.is_shutdown() => {
                debug!("upload interrupted by disconnect, will retry");
            }
            Err(FlushLoopError::Flush(err)) => {
                warn!(error = %err, "failed to send invocations");
            }
        }
        if scope.is_cancelled() {
            return;
        }
    }
}

/// Current client, waiting through reconnects. `None` once the scope dies.
async fn wait_for_client(
    client_rx: &mut watch::Receiver<Option<Arc<RpcClient>>>,
    scope: &CancellationToken,
) -> Option<Arc<RpcClient>> {
    loop {
        if let Some(client) = client_rx.borrow().clone() {
            if !client.is_closed() {
                return Some(client);
            }
        }
        tokio::select! {
            _ = scope.cancelled() => return None,
            changed = client_rx.changed() => changed.ok()?,
        }
    }
}

/// A property from the user's git config; empty when git is missing or the
/// property is unset, matching what the collector expects.
async fn fetch_git_config(property: &str) -> String {
    let Ok(output) = tokio::process::Command::new("git")
        .args(["config", "--get", property])
        .output()
        .await
    else {
        return String::new();
    };
    if !output.status.success() {
        return String::new();
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

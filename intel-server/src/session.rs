//! Per-machine RPC session.
//!
//! One session exists per connected agent, bound to the machine row that
//! was upserted during the websocket handshake. It serves the control
//! plane (`Listen`) and the data plane (`RecordInvocation`) until either
//! endpoint closes, then drains its queue. Nothing here is shared across
//! sessions except the store.

use crate::queue::SessionQueue;
use crate::store::Store;
use async_trait::async_trait;
use intel_common::mux::MuxSession;
use intel_common::proto::{
    system_response, Empty, ListenRequest, RecordInvocationRequest, ReportPathRequest,
    SystemResponse, TrackExecutables,
};
use intel_common::rpc::{self, IntelService, RpcError, SystemStream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Default interval between store flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub machine_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub flush_interval: Duration,
    pub queue_limit: usize,
}

/// Serve one agent connection to completion.
pub async fn run(store: Arc<dyn Store>, opts: SessionOptions, transport: MuxSession) {
    let scope = CancellationToken::new();
    let queue = Arc::new(SessionQueue::start(
        store.clone(),
        opts.machine_id,
        opts.user_id,
        opts.flush_interval,
        opts.queue_limit,
        scope.clone(),
    ));
    let service = Arc::new(SessionService {
        store,
        queue: queue.clone(),
        scope: scope.clone(),
        opts: opts.clone(),
    });

    rpc::serve(&transport, service).await;

    // Transport is gone; stop the flush loop and wait for it to drain.
    scope.cancel();
    queue.join().await;
    info!(machine_id = %opts.machine_id, "intel session closed");
}

struct SessionService {
    store: Arc<dyn Store>,
    queue: Arc<SessionQueue>,
    scope: CancellationToken,
    opts: SessionOptions,
}

impl SessionService {
    /// The union of tracked executables across every cohort this machine
    /// matches: the complete desired state for the host.
    async fn tracked_executables(&self) -> Result<Vec<String>, RpcError> {
        let matches = self
            .store
            .get_intel_cohorts_matched_by_machine_ids(&[self.opts.machine_id])
            .await
            .map_err(|err| RpcError::Remote(err.to_string()))?;
        let mut names: Vec<String> = matches
            .into_iter()
            .filter(|m| m.machine_id == self.opts.machine_id)
            .flat_map(|m| m.cohort.tracked_executables)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[async_trait]
impl IntelService for SessionService {
    async fn listen(&self, req: ListenRequest, mut stream: SystemStream) -> Result<(), RpcError> {
        debug!(
            machine_id = %self.opts.machine_id,
            git_config_email = %req.git_config_email,
            git_config_name = %req.git_config_name,
            "agent listening",
        );
        let binary_name = self.tracked_executables().await?;
        stream
            .send(&SystemResponse {
                msg: Some(system_response::Msg::TrackExecutables(TrackExecutables {
                    binary_name,
                })),
            })
            .await?;
        // TODO: push updated sets here when cohort membership changes.
        self.scope.cancelled().await;
        Ok(())
    }

    async fn record_invocation(&self, req: RecordInvocationRequest) -> Result<Empty, RpcError> {
        // Backpressure is expressed by the queue dropping, never by
        // failing the agent's upload.
        self.queue.enqueue(req.invocations);
        Ok(Empty {})
    }

    async fn report_path(&self, _req: ReportPathRequest) -> Result<Empty, RpcError> {
        Ok(Empty {})
    }
}

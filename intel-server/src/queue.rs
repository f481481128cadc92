//! Session-scoped invocation queue flushing to the store.
//!
//! Invocations are statistics, not ledgers: a store outage drops the batch
//! with a warning rather than blocking the session or failing the agent's
//! upload, and the agent's own retry-on-reconnect keeps the end-to-end
//! semantics at-least-once.

use crate::store::{InsertIntelInvocationsParams, Store};
use intel_common::proto::Invocation;
use intel_common::queue::{BatchQueue, FlushLoopError};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SessionQueue {
    batch: Arc<BatchQueue<Invocation>>,
    flush_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionQueue {
    /// Start the queue and its flush loop, bound to one machine's session.
    pub fn start(
        store: Arc<dyn Store>,
        machine_id: Uuid,
        user_id: Uuid,
        flush_interval: Duration,
        limit: usize,
        scope: CancellationToken,
    ) -> Self {
        let batch = Arc::new(BatchQueue::new(flush_interval, limit));
        let flush_task = tokio::spawn(flush_loop(
            batch.clone(),
            store,
            machine_id,
            user_id,
            scope,
        ));
        Self {
            batch,
            flush_task: std::sync::Mutex::new(Some(flush_task)),
        }
    }

    pub fn enqueue(&self, invocations: Vec<Invocation>) {
        self.batch.enqueue(invocations);
    }

    pub fn batch(&self) -> &BatchQueue<Invocation> {
        &self.batch
    }

    /// Wait for the flush loop to drain and exit. Call after canceling the
    /// session scope.
    pub async fn join(&self) {
        let task = self.flush_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn flush_loop(
    batch: Arc<BatchQueue<Invocation>>,
    store: Arc<dyn Store>,
    machine_id: Uuid,
    user_id: Uuid,
    scope: CancellationToken,
) {
    let result = batch
        .run_flush_loop::<std::convert::Infallible, _, _>(scope, |invocations| {
            let store = store.clone();
            async move {
                let count = invocations.len();
                let params = columnar_batch(machine_id, user_id, invocations);
                match store.insert_intel_invocations(params).await {
                    Ok(()) => info!(count, "invocations flushed"),
                    // Dropping beats queueing without bound; see module docs.
                    Err(err) => warn!(error = %err, count, "write invocations failed, dropping batch"),
                }
                Ok(())
            }
        })
        .await;
    match result {
        Err(FlushLoopError::Canceled) | Ok(()) => {
            debug!(machine_id = %machine_id, "session flush loop exited")
        }
        Err(FlushLoopError::Flush(_)) => unreachable!("consumer never fails"),
    }
}

fn columnar_batch(
    machine_id: Uuid,
    user_id: Uuid,
    invocations: Vec<Invocation>,
) -> InsertIntelInvocationsParams {
    let mut params = InsertIntelInvocationsParams {
        created_at: Utc::now(),
        machine_id,
        user_id,
        ..Default::default()
    };
    for invocation in invocations {
        let executable = invocation.executable.unwrap_or_default();
        params.ids.push(Uuid::new_v4());
        params.binary_name.push(
            Path::new(&executable.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        params.binary_hash.push(executable.hash);
        params.binary_path.push(executable.path);
        params.binary_args.push(invocation.arguments);
        params.binary_version.push(executable.version);
        params.working_directory.push(invocation.working_directory);
        params.git_remote_url.push(invocation.git_remote_url);
        params.exit_code.push(invocation.exit_code);
        params.duration_ms.push(invocation.duration_ms);
    }
    params
}

//! Bounded, condition-variable-driven batching queue.
//!
//! Producers enqueue records from any task; a single consumer drains them in
//! batches triggered by time or an explicit flush request. Past the size
//! bound, incoming records are dropped: the pipeline prefers fresh data over
//! complete data, and a stalled consumer must not grow memory without bound.
//!
//! The agent wraps this with its metadata caches; the collector wraps it
//! with the bulk store writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default bound on buffered records.
pub const DEFAULT_QUEUE_LIMIT: usize = 1000;

/// Why the flush loop returned.
#[derive(Debug, Error)]
pub enum FlushLoopError<E> {
    /// The owning scope was canceled; expected on shutdown.
    #[error("flush loop canceled")]
    Canceled,
    /// The consumer failed; the unflushed batch stays queued.
    #[error("flush failed: {0}")]
    Flush(E),
}

struct State<T> {
    buffer: Vec<T>,
    flush_requested: bool,
    last_flush: Option<Instant>,
}

pub struct BatchQueue<T> {
    flush_interval: Duration,
    limit: usize,
    state: Mutex<State<T>>,
    notify: Arc<Notify>,
    dropped: AtomicU64,
}

impl<T: Clone + Send + 'static> BatchQueue<T> {
    pub fn new(flush_interval: Duration, limit: usize) -> Self {
        Self {
            flush_interval,
            limit,
            state: Mutex::new(State {
                buffer: Vec::new(),
                flush_requested: false,
                last_flush: None,
            }),
            notify: Arc::new(Notify::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Records dropped to the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue records, dropping any past the bound. Returns how many were
    /// accepted.
    pub fn enqueue(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut dropped = 0usize;
        let accepted;
        {
            let mut state = self.state.lock().unwrap();
            let before = state.buffer.len();
            for item in items {
                if state.buffer.len() >= self.limit {
                    dropped += 1;
                } else {
                    state.buffer.push(item);
                }
            }
            accepted = state.buffer.len() - before;
            let total = state.buffer.len();
            if total > 0 && total % 10 == 0 {
                info!(count = total, "invocation queue length");
            }
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(dropped, limit = self.limit, "invocation queue is full, dropping records");
        }
        if accepted > 0 {
            self.notify.notify_waiters();
        }
        accepted
    }

    /// Ask the consumer to flush on its next wakeup regardless of timing.
    pub fn request_flush(&self) {
        self.state.lock().unwrap().flush_requested = true;
        self.notify.notify_waiters();
    }

    fn has_pending_work(&self, state: &State<T>) -> bool {
        if state.buffer.is_empty() {
            return false;
        }
        if state.flush_requested {
            return true;
        }
        match state.last_flush {
            None => true,
            Some(at) => at.elapsed() > self.flush_interval,
        }
    }

    /// Run the consumer loop until the scope cancels or the consumer fails.
    ///
    /// Batches preserve enqueue order. The buffer is snapshotted outside the
    /// consumer call, so producers keep enqueueing while a flush is in
    /// flight; the consumed prefix is trimmed afterwards.
    pub async fn run_flush_loop<E, F, Fut>(
        &self,
        scope: CancellationToken,
        mut flush: F,
    ) -> Result<(), FlushLoopError<E>>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        // Wake the wait below four times per interval so time-based flushes
        // and cancellation are noticed promptly.
        let ticker = tokio::spawn({
            let notify = self.notify.clone();
            let scope = scope.clone();
            let period = self.flush_interval / 4;
            async move {
                let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => {
                            notify.notify_waiters();
                            return;
                        }
                        _ = interval.tick() => notify.notify_waiters(),
                    }
                }
            }
        });

        let result = loop {
            // Register interest before checking state so a broadcast between
            // the check and the await is not lost.
            let notified = self.notify.notified();
            let batch = {
                let mut state = self.state.lock().unwrap();
                if scope.is_cancelled() {
                    break Err(FlushLoopError::Canceled);
                }
                if self.has_pending_work(&state) {
                    state.flush_requested = false;
                    Some(state.buffer.clone())
                } else {
                    None
                }
            };
            let Some(batch) = batch else {
                notified.await;
                continue;
            };

            let count = batch.len();
            if let Err(err) = flush(batch).await {
                break Err(FlushLoopError::Flush(err));
            }
            let mut state = self.state.lock().unwrap();
            state.buffer.drain(..count);
            state.last_flush = Some(Instant::now());
        };

        ticker.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let queue = Arc::new(BatchQueue::new(Duration::from_millis(10), 100));
        for i in 0..5 {
            queue.enqueue([i]);
        }
        let scope = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let loop_queue = queue.clone();
        let loop_scope = scope.clone();
        let task = tokio::spawn(async move {
            loop_queue
                .run_flush_loop::<std::convert::Infallible, _, _>(loop_scope, move |batch| {
                    let tx = tx.clone();
                    async move {
                        tx.send(batch).unwrap();
                        Ok(())
                    }
                })
                .await
        });
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3, 4]);
        scope.cancel();
        assert!(matches!(
            task.await.unwrap(),
            Err(FlushLoopError::Canceled)
        ));
    }

    #[tokio::test]
    async fn drops_past_limit() {
        let queue: BatchQueue<u32> = BatchQueue::new(Duration::from_secs(10), 10);
        for i in 0..15 {
            queue.enqueue([i]);
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.dropped(), 5);
    }

    #[tokio::test]
    async fn single_enqueue_flushes_within_two_intervals() {
        let interval = Duration::from_millis(50);
        let queue = Arc::new(BatchQueue::new(interval, 100));
        let scope = CancellationToken::new();
        let flushed = Arc::new(AtomicUsize::new(0));

        let loop_queue = queue.clone();
        let loop_scope = scope.clone();
        let loop_flushed = flushed.clone();
        tokio::spawn(async move {
            let _ = loop_queue
                .run_flush_loop::<std::convert::Infallible, _, _>(loop_scope, move |batch| {
                    let flushed = loop_flushed.clone();
                    async move {
                        flushed.fetch_add(batch.len(), Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        });

        queue.enqueue([1u32]);
        tokio::time::sleep(interval * 2).await;
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        scope.cancel();
    }

    #[tokio::test]
    async fn cancel_returns_within_quarter_interval() {
        let interval = Duration::from_millis(200);
        let queue: Arc<BatchQueue<u32>> = Arc::new(BatchQueue::new(interval, 100));
        let scope = CancellationToken::new();

        let loop_queue = queue.clone();
        let loop_scope = scope.clone();
        let task = tokio::spawn(async move {
            loop_queue
                .run_flush_loop::<std::convert::Infallible, _, _>(loop_scope, |_batch| async {
                    Ok(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        scope.cancel();
        let result = tokio::time::timeout(interval / 4 + Duration::from_millis(20), task)
            .await
            .expect("loop should notice cancellation within a quarter interval")
            .unwrap();
        assert!(matches!(result, Err(FlushLoopError::Canceled)));
        assert!(started.elapsed() <= interval / 4 + Duration::from_millis(20));
    }

    #[tokio::test]
    async fn consumer_error_leaves_batch_queued() {
        let queue: Arc<BatchQueue<u32>> = Arc::new(BatchQueue::new(Duration::from_millis(5), 100));
        queue.enqueue([1, 2, 3]);
        let scope = CancellationToken::new();
        let result = queue
            .run_flush_loop::<&str, _, _>(scope, |_batch| async { Err("store down") })
            .await;
        assert!(matches!(result, Err(FlushLoopError::Flush("store down"))));
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn request_flush_overrides_timer() {
        let queue: Arc<BatchQueue<u32>> = Arc::new(BatchQueue::new(Duration::from_secs(3600), 100));
        let scope = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let loop_queue = queue.clone();
        let loop_scope = scope.clone();
        tokio::spawn(async move {
            let _ = loop_queue
                .run_flush_loop::<std::convert::Infallible, _, _>(loop_scope, move |batch| {
                    let tx = tx.clone();
                    async move {
                        tx.send(batch).unwrap();
                        Ok(())
                    }
                })
                .await;
        });

        queue.enqueue([7u32]);
        // First flush happens immediately (nothing flushed yet). Enqueue
        // again and force the second one, which would otherwise wait an hour.
        let first = rx.recv().await.unwrap();
        assert_eq!(first, vec![7]);
        queue.enqueue([8u32]);
        queue.request_flush();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("flush request should trigger promptly")
            .unwrap();
        assert_eq!(second, vec![8]);
        scope.cancel();
    }
}

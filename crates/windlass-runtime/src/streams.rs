//! Flushable writable stream handles
//!
//! A [`WritableStream`] is the producer side of a durable stream. Its done
//! signal resolves when the producer explicitly closes (or errors) the
//! stream, or when the producer lock is free with no writes in flight.
//! The locking primitive exposes no release event, so lock release is
//! detected by probing at a fixed cadence.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;

use windlass_core::{RunId, StreamRef};
use windlass_storage::{StreamError, Streamer};

/// Streamer-side tuning.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Cadence of the lock-release probe behind [`WritableStream::done`].
    pub done_poll_interval: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            done_poll_interval: Duration::from_millis(100),
        }
    }
}

impl StreamerConfig {
    pub fn with_done_poll_interval(mut self, interval: Duration) -> Self {
        self.done_poll_interval = interval;
        self
    }
}

struct FlushState {
    /// Writes issued but not yet acknowledged by the sink.
    pending_ops: AtomicUsize,

    /// Underlying stream terminated (closed or errored).
    stream_ended: AtomicBool,

    /// Idempotent done latch.
    done_tx: watch::Sender<bool>,

    /// The producer's exclusive lock; held while actively producing.
    lock: tokio::sync::Mutex<()>,

    poll_interval: Duration,
}

/// Write-only handle to a durable stream.
///
/// Cloned handles share one flush state; writes are serialized in issue
/// order by the sink and do not complete until it acknowledges storage.
#[derive(Clone)]
pub struct WritableStream {
    run_id: RunId,
    name: String,
    streamer: Arc<dyn Streamer>,
    state: Arc<FlushState>,
}

/// Guard for exclusive production; dropping it releases the stream, which
/// the done probe observes within one poll interval.
pub struct ProducerLock<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl WritableStream {
    pub(crate) fn new(
        run_id: RunId,
        name: String,
        streamer: Arc<dyn Streamer>,
        config: &StreamerConfig,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            run_id,
            name,
            streamer,
            state: Arc::new(FlushState {
                pending_ops: AtomicUsize::new(0),
                stream_ended: AtomicBool::new(false),
                done_tx,
                lock: tokio::sync::Mutex::new(()),
                poll_interval: config.done_poll_interval,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The reference value to embed in a step output.
    pub fn stream_ref(&self) -> StreamRef {
        StreamRef::new(self.name.clone())
    }

    /// Hold the stream for exclusive production.
    pub async fn acquire(&self) -> ProducerLock<'_> {
        ProducerLock {
            _guard: self.state.lock.lock().await,
        }
    }

    /// Append one chunk; resolves once the sink acknowledges storage.
    pub async fn write(&self, chunk: Bytes) -> Result<(), StreamError> {
        self.state.pending_ops.fetch_add(1, Ordering::SeqCst);
        let result = self
            .streamer
            .write_to_stream(&self.run_id, &self.name, chunk)
            .await;
        self.state.pending_ops.fetch_sub(1, Ordering::SeqCst);

        if result.is_err() {
            // Errored streams resolve done through the error path.
            self.state.stream_ended.store(true, Ordering::SeqCst);
            let _ = self.state.done_tx.send(true);
        }
        result.map(|_| ())
    }

    /// Explicitly close the stream; readers terminate after the tail.
    pub async fn close(&self) -> Result<(), StreamError> {
        let result = self.streamer.close_stream(&self.run_id, &self.name).await;
        self.state.stream_ended.store(true, Ordering::SeqCst);
        let _ = self.state.done_tx.send(true);
        result
    }

    /// Resolve when the stream is definitively done: explicitly closed or
    /// errored, or producer lock free with zero in-flight writes.
    pub async fn done(&self) {
        let mut done_rx = self.state.done_tx.subscribe();
        loop {
            if *done_rx.borrow() {
                return;
            }

            tokio::select! {
                changed = done_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.state.poll_interval) => {
                    if self.state.stream_ended.load(Ordering::SeqCst) {
                        // Close/error path owns the latch.
                        continue;
                    }
                    // Probe: acquisition success means unlocked and not
                    // closed; zero pending writes then resolves done.
                    if let Ok(_guard) = self.state.lock.try_lock() {
                        if self.state.pending_ops.load(Ordering::SeqCst) == 0 {
                            let _ = self.state.done_tx.send(true);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drain in-flight writes and close, unless already terminated.
    ///
    /// The step runtime runs this before appending `step_completed`, so a
    /// step producing a stream always closes it first.
    pub(crate) async fn seal(&self) -> Result<(), StreamError> {
        if self.state.stream_ended.load(Ordering::SeqCst) {
            return Ok(());
        }
        while self.state.pending_ops.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        debug!(stream = %self.name, "sealing stream before step completion");
        self.close().await
    }
}

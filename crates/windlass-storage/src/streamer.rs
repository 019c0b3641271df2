//! Durable named byte-stream store
//!
//! Streams are keyed by `(run, stream name)`: append-only chunk sequences
//! with a done flag. Writers are paced by sink acknowledgment; readers
//! observe chunks in write order and terminate once the done flag is set
//! and the tail is drained.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use windlass_core::RunId;

/// Error type for stream operations
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Stream not found
    #[error("stream not found: {stream_name} (run {run_id})")]
    StreamNotFound { run_id: RunId, stream_name: String },

    /// Write or close on a stream whose done flag is already set
    #[error("stream already closed: {stream_name} (run {run_id})")]
    StreamClosed { run_id: RunId, stream_name: String },

    /// Backend error
    #[error("stream backend error: {0}")]
    Backend(String),
}

/// One stored chunk, tagged with its append index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub index: u64,
    pub data: Bytes,
}

/// Summary of a stream attached to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub run_id: RunId,
    pub stream_name: String,
    pub chunk_count: u64,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

/// Lazy chunk sequence returned by [`Streamer::read_from_stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// The streamer contract the runtime consumes.
#[async_trait]
pub trait Streamer: Send + Sync + 'static {
    /// Append one chunk, creating the stream on first write.
    ///
    /// Returns the chunk's append index. The future resolves only once the
    /// sink has stored the chunk; a fast producer is paced by the sink.
    async fn write_to_stream(
        &self,
        run_id: &RunId,
        stream_name: &str,
        chunk: Bytes,
    ) -> Result<u64, StreamError>;

    /// Set the done flag. Readers drain the tail and then terminate.
    async fn close_stream(&self, run_id: &RunId, stream_name: &str) -> Result<(), StreamError>;

    /// Read chunks starting at `start_index`, following the live tail until
    /// the stream is done.
    async fn read_from_stream(
        &self,
        run_id: &RunId,
        stream_name: &str,
        start_index: u64,
    ) -> Result<ChunkStream, StreamError>;

    /// Enumerate the streams attached to a run.
    async fn list_streams_by_run_id(&self, run_id: &RunId) -> Result<Vec<StreamInfo>, StreamError>;

    /// Whether the stream's done flag is set.
    async fn is_done(&self, run_id: &RunId, stream_name: &str) -> Result<bool, StreamError>;
}

struct StreamState {
    chunks: Vec<Bytes>,
    done: bool,
    created_at: DateTime<Utc>,
    notify: Arc<tokio::sync::Notify>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            chunks: vec![],
            done: false,
            created_at: Utc::now(),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }
}

/// In-memory [`Streamer`] implementation.
pub struct InMemoryStreamer {
    streams: Arc<Mutex<HashMap<(RunId, String), StreamState>>>,
}

impl InMemoryStreamer {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Streamer for InMemoryStreamer {
    async fn write_to_stream(
        &self,
        run_id: &RunId,
        stream_name: &str,
        chunk: Bytes,
    ) -> Result<u64, StreamError> {
        let mut streams = self.streams.lock();
        let state = streams
            .entry((run_id.clone(), stream_name.to_string()))
            .or_insert_with(StreamState::new);

        if state.done {
            return Err(StreamError::StreamClosed {
                run_id: run_id.clone(),
                stream_name: stream_name.to_string(),
            });
        }

        state.chunks.push(chunk);
        let index = state.chunks.len() as u64 - 1;
        state.notify.notify_waiters();
        Ok(index)
    }

    async fn close_stream(&self, run_id: &RunId, stream_name: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let state = streams
            .entry((run_id.clone(), stream_name.to_string()))
            .or_insert_with(StreamState::new);

        if !state.done {
            debug!(%run_id, stream_name, chunks = state.chunks.len(), "closing stream");
            state.done = true;
            state.notify.notify_waiters();
        }
        Ok(())
    }

    async fn read_from_stream(
        &self,
        run_id: &RunId,
        stream_name: &str,
        start_index: u64,
    ) -> Result<ChunkStream, StreamError> {
        let streams = Arc::clone(&self.streams);
        let key = (run_id.clone(), stream_name.to_string());
        let (tx, rx) = mpsc::channel::<StreamChunk>(16);

        tokio::spawn(async move {
            let mut position = start_index as usize;
            loop {
                // Register for the wakeup before inspecting state, so a
                // write landing in between cannot be missed.
                let (next, done, notify) = {
                    let guard = streams.lock();
                    let Some(state) = guard.get(&key) else {
                        // Not created yet: wait for the first write.
                        drop(guard);
                        if tx.is_closed() {
                            return;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        continue;
                    };
                    let notify = Arc::clone(&state.notify);
                    let notified_needed = position >= state.chunks.len();
                    let next = if notified_needed {
                        None
                    } else {
                        Some(StreamChunk {
                            index: position as u64,
                            data: state.chunks[position].clone(),
                        })
                    };
                    (next, state.done, notify)
                };

                match next {
                    Some(chunk) => {
                        position += 1;
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    None if done => return,
                    None => {
                        let notified = notify.notified();
                        // Re-check under the lock: a write or close may have
                        // landed after the snapshot above.
                        let settled = {
                            let guard = streams.lock();
                            guard
                                .get(&key)
                                .map(|state| position < state.chunks.len() || state.done)
                                .unwrap_or(false)
                        };
                        if !settled {
                            notified.await;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_streams_by_run_id(&self, run_id: &RunId) -> Result<Vec<StreamInfo>, StreamError> {
        let streams = self.streams.lock();
        let mut infos: Vec<StreamInfo> = streams
            .iter()
            .filter(|((id, _), _)| id == run_id)
            .map(|((id, name), state)| StreamInfo {
                run_id: id.clone(),
                stream_name: name.clone(),
                chunk_count: state.chunks.len() as u64,
                done: state.done,
                created_at: state.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.stream_name.cmp(&b.stream_name));
        Ok(infos)
    }

    async fn is_done(&self, run_id: &RunId, stream_name: &str) -> Result<bool, StreamError> {
        let streams = self.streams.lock();
        streams
            .get(&(run_id.clone(), stream_name.to_string()))
            .map(|state| state.done)
            .ok_or_else(|| StreamError::StreamNotFound {
                run_id: run_id.clone(),
                stream_name: stream_name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_write_read_in_order() {
        let streamer = InMemoryStreamer::new();
        let run_id = RunId::generate();

        for data in [b"a".as_slice(), b"b", b"c"] {
            streamer
                .write_to_stream(&run_id, "out", Bytes::copy_from_slice(data))
                .await
                .unwrap();
        }
        streamer.close_stream(&run_id, "out").await.unwrap();

        let chunks: Vec<StreamChunk> = streamer
            .read_from_stream(&run_id, "out", 0)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            chunks.iter().map(|c| c.data.clone()).collect::<Vec<_>>(),
            vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
        );
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_read_from_offset() {
        let streamer = InMemoryStreamer::new();
        let run_id = RunId::generate();

        for data in [b"a".as_slice(), b"b", b"c"] {
            streamer
                .write_to_stream(&run_id, "out", Bytes::copy_from_slice(data))
                .await
                .unwrap();
        }
        streamer.close_stream(&run_id, "out").await.unwrap();

        let chunks: Vec<StreamChunk> = streamer
            .read_from_stream(&run_id, "out", 2)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, Bytes::from("c"));
    }

    #[tokio::test]
    async fn test_concurrent_reader_follows_live_writes() {
        let streamer = Arc::new(InMemoryStreamer::new());
        let run_id = RunId::generate();

        // Reader attaches before the first write.
        let reader = streamer.read_from_stream(&run_id, "live", 0).await.unwrap();
        let collector = tokio::spawn(reader.collect::<Vec<StreamChunk>>());

        for data in [b"a".as_slice(), b"b", b"c"] {
            streamer
                .write_to_stream(&run_id, "live", Bytes::copy_from_slice(data))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        streamer.close_stream(&run_id, "live").await.unwrap();

        let chunks = collector.await.unwrap();
        assert_eq!(
            chunks.into_iter().map(|c| c.data).collect::<Vec<_>>(),
            vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
        );
    }

    #[tokio::test]
    async fn test_write_after_close_rejected() {
        let streamer = InMemoryStreamer::new();
        let run_id = RunId::generate();

        streamer
            .write_to_stream(&run_id, "out", Bytes::from("a"))
            .await
            .unwrap();
        streamer.close_stream(&run_id, "out").await.unwrap();

        let result = streamer
            .write_to_stream(&run_id, "out", Bytes::from("b"))
            .await;
        assert!(matches!(result, Err(StreamError::StreamClosed { .. })));
    }

    #[tokio::test]
    async fn test_list_streams_by_run() {
        let streamer = InMemoryStreamer::new();
        let run_id = RunId::generate();
        let other = RunId::generate();

        streamer
            .write_to_stream(&run_id, "alpha", Bytes::from("1"))
            .await
            .unwrap();
        streamer
            .write_to_stream(&run_id, "beta", Bytes::from("2"))
            .await
            .unwrap();
        streamer
            .write_to_stream(&other, "gamma", Bytes::from("3"))
            .await
            .unwrap();
        streamer.close_stream(&run_id, "alpha").await.unwrap();

        let infos = streamer.list_streams_by_run_id(&run_id).await.unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].stream_name, "alpha");
        assert!(infos[0].done);
        assert!(!infos[1].done);
    }
}

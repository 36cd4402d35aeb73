//! The download controller: drains the queue through a bounded worker
//! pool, fetching each file in ranged chunks from the best available
//! peers.

pub mod queue;

pub use queue::{DownloadHandle, DownloadQueue, QueuedDownload};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::http::client;
use crate::protocol::constants::FS2_PROTOCOL_VERSION;
use crate::resilience::bandwidth::TokenBucket;

use super::communicator::{DownloadSource, IndexnodeCommunicator};
use super::peerstats::PeerStats;

/// How long the producer naps when the queue has nothing dispatchable.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// One chunk's span within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    start: u64,
    len: u64,
}

/// Split a file into fixed-size chunks.
fn chunks_for(size: u64, chunk_size: u64) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < size {
        let len = chunk_size.min(size - start);
        out.push(Chunk { start, len });
        start += len;
    }
    out
}

enum ChunkError {
    /// Every candidate source failed to yield this chunk.
    SourcesExhausted,
    Io(String),
}

pub(crate) struct DownloadController {
    pub queue: Arc<DownloadQueue>,
    pub communicator: Arc<IndexnodeCommunicator>,
    pub peerstats: Arc<PeerStats>,
    pub net_bucket: Arc<TokenBucket>,
    pub our_alias: String,
    pub our_port: u16,
    pub chunk_size: u64,
    pub chunks_per_file: usize,
    pub max_active: usize,
    pub running: Arc<tokio::sync::RwLock<bool>>,
}

impl DownloadController {
    fn peer_headers(&self) -> Vec<(String, String)> {
        vec![
            ("fs2-version".to_string(), FS2_PROTOCOL_VERSION.to_string()),
            ("fs2-alias".to_string(), self.our_alias.clone()),
            ("fs2-port".to_string(), self.our_port.to_string()),
        ]
    }

    /// The producer loop: hand inactive queue entries to workers, never
    /// exceeding the active-download cap.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let limiter = Arc::new(Semaphore::new(self.max_active.max(1)));
            loop {
                if !*self.running.read().await {
                    break;
                }
                let permit = limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("limiter closed");
                match self.queue.next_inactive() {
                    None => {
                        drop(permit);
                        tokio::time::sleep(IDLE_POLL).await;
                    }
                    Some(handle) => {
                        let controller = self.clone();
                        tokio::spawn(async move {
                            controller.download_file(handle).await;
                            drop(permit);
                        });
                    }
                }
            }
            debug!("download producer stopped");
        })
    }

    /// Fetch one file: resolve sources, pull chunks concurrently, then
    /// move the finished download into place.
    pub(crate) async fn download_file(&self, handle: DownloadHandle) {
        // "No sources" is only a verdict when someone answered the
        // question; with no indexnode connected it is just a retry.
        if !self.communicator.has_registered_nodes() {
            self.queue.mark_failed(&handle);
            return;
        }
        let sources = self.communicator.sources_for(&handle.hash).await;
        if sources.is_empty() {
            info!(file = %handle.save_as, dispatch = handle.dispatch_id, "no sources");
            self.queue.mark_no_sources(&handle);
            return;
        }
        let candidates = Arc::new(Mutex::new(sources));
        let queued_marks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        match self.fetch_all_chunks(&handle, &candidates, &queued_marks).await {
            Ok(()) => {
                let target = handle.target_file();
                match tokio::fs::rename(handle.incomplete_file(), &target).await {
                    Ok(()) => {
                        info!(file = %target.display(), size = handle.size, "download complete");
                        self.queue.mark_complete(&handle);
                    }
                    Err(e) => {
                        warn!(file = %target.display(), error = %e, "could not move download into place");
                        self.queue.mark_failed(&handle);
                    }
                }
            }
            Err(ChunkError::SourcesExhausted) => {
                info!(file = %handle.save_as, dispatch = handle.dispatch_id,
                      "every source failed, deferring batch");
                self.queue.mark_no_sources(&handle);
            }
            Err(ChunkError::Io(e)) => {
                warn!(file = %handle.save_as, error = %e, "download failed");
                self.queue.mark_failed(&handle);
            }
        }

        // Whatever happened, our remote queue markers are now stale.
        for alias in queued_marks.lock().unwrap().drain(..) {
            self.peerstats.remote_queue_left(&alias);
        }
    }

    async fn fetch_all_chunks(
        &self,
        handle: &DownloadHandle,
        candidates: &Arc<Mutex<HashMap<String, DownloadSource>>>,
        queued_marks: &Arc<Mutex<Vec<String>>>,
    ) -> Result<(), ChunkError> {
        tokio::fs::create_dir_all(handle.target_dir())
            .await
            .map_err(|e| ChunkError::Io(e.to_string()))?;
        let incomplete = handle.incomplete_file();
        {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&incomplete)
                .await
                .map_err(|e| ChunkError::Io(e.to_string()))?;
            file.set_len(handle.size)
                .await
                .map_err(|e| ChunkError::Io(e.to_string()))?;
        }

        let chunks = chunks_for(handle.size, self.chunk_size);
        let mut pending = chunks.into_iter();
        let mut join: JoinSet<Result<(), ChunkError>> = JoinSet::new();
        let mut result = Ok(());

        loop {
            while join.len() < self.chunks_per_file.max(1) {
                let Some(chunk) = pending.next() else { break };
                let task = ChunkTask {
                    incomplete: incomplete.clone(),
                    chunk,
                    file_size: handle.size,
                    candidates: candidates.clone(),
                    queued_marks: queued_marks.clone(),
                    peerstats: self.peerstats.clone(),
                    net_bucket: self.net_bucket.clone(),
                    headers: self.peer_headers(),
                };
                join.spawn(task.run());
            }
            match join.join_next().await {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    result = Err(e);
                    break;
                }
                Some(Err(e)) => {
                    result = Err(ChunkError::Io(format!("chunk task died: {}", e)));
                    break;
                }
            }
        }
        join.abort_all();
        result
    }
}

/// Everything one chunk fetch needs.
struct ChunkTask {
    incomplete: std::path::PathBuf,
    chunk: Chunk,
    file_size: u64,
    candidates: Arc<Mutex<HashMap<String, DownloadSource>>>,
    queued_marks: Arc<Mutex<Vec<String>>>,
    peerstats: Arc<PeerStats>,
    net_bucket: Arc<TokenBucket>,
    headers: Vec<(String, String)>,
}

impl ChunkTask {
    /// Try sources best-first until the chunk lands or nobody is left.
    async fn run(self) -> Result<(), ChunkError> {
        loop {
            let alias = {
                let candidates = self.candidates.lock().unwrap();
                let aliases: Vec<String> = candidates.keys().cloned().collect();
                drop(candidates);
                self.peerstats.best_source(&aliases)
            };
            let Some(alias) = alias else {
                return Err(ChunkError::SourcesExhausted);
            };
            let Some(source) = self.candidates.lock().unwrap().get(&alias).cloned() else {
                continue;
            };

            match self.fetch_from(&source).await {
                Ok(data) => {
                    self.net_bucket.acquire(data.len() as u64).await;
                    self.write_at(&data).await?;
                    self.peerstats.received_bytes(&alias, data.len() as u64);
                    return Ok(());
                }
                Err(FetchFailure::RemotelyQueued) => {
                    debug!(peer = %alias, "remotely queued, trying another source");
                    self.peerstats.remotely_queued(&alias);
                    self.queued_marks.lock().unwrap().push(alias.clone());
                    self.candidates.lock().unwrap().remove(&alias);
                }
                Err(FetchFailure::Failed(reason)) => {
                    debug!(peer = %alias, reason, "chunk fetch failed, dropping source");
                    self.candidates.lock().unwrap().remove(&alias);
                }
            }
        }
    }

    async fn fetch_from(&self, source: &DownloadSource) -> Result<Vec<u8>, FetchFailure> {
        self.peerstats.download_started(&source.alias);
        let end = self.chunk.start + self.chunk.len - 1;
        let response = client::get_range(
            &source.url,
            self.chunk.start,
            end,
            &self.headers,
            Duration::from_secs(120),
        )
        .await;
        self.peerstats.download_finished(&source.alias);

        let response = response.map_err(|e| FetchFailure::Failed(e.to_string()))?;
        match response.status {
            206 => {
                if response.body.len() as u64 == self.chunk.len {
                    Ok(response.body)
                } else {
                    Err(FetchFailure::Failed("partial body length mismatch".to_string()))
                }
            }
            // A peer that ignores Range sends the whole file; carve out
            // our span.
            200 => {
                if response.body.len() as u64 == self.file_size {
                    let start = self.chunk.start as usize;
                    let end = start + self.chunk.len as usize;
                    Ok(response.body[start..end].to_vec())
                } else {
                    Err(FetchFailure::Failed("full body length mismatch".to_string()))
                }
            }
            503 => Err(FetchFailure::RemotelyQueued),
            status => Err(FetchFailure::Failed(format!("status {}", status))),
        }
    }

    async fn write_at(&self, data: &[u8]) -> Result<(), ChunkError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.incomplete)
            .await
            .map_err(|e| ChunkError::Io(e.to_string()))?;
        file.seek(std::io::SeekFrom::Start(self.chunk.start))
            .await
            .map_err(|e| ChunkError::Io(e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| ChunkError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| ChunkError::Io(e.to_string()))?;
        Ok(())
    }
}

enum FetchFailure {
    RemotelyQueued,
    Failed(String),
}

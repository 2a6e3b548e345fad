//! Persistence contracts: the chunk store and the download sink.
//!
//! Both are external collaborators. The chunk store is a durable key→bytes
//! map keyed by `(spaceId, fileId, chunkIndex)` with an ordered range scan —
//! the shape of the original IndexedDB `[spaceId+id+index]` compound index.
//! The download sink is wherever finalized bytes go (a save dialog stream, a
//! file, an HTTP response); the engine guarantees `close()` is called exactly
//! once per finalized transfer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

/// Durable chunk storage keyed by `(spaceId, fileId, chunkIndex)`.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Point lookup. `Ok(None)` means the chunk was never persisted.
    async fn get(&self, space_id: Uuid, file_id: Uuid, index: u32) -> Result<Option<Bytes>>;

    /// Persist one chunk. Re-putting an existing index overwrites it.
    async fn put(&self, space_id: Uuid, file_id: Uuid, index: u32, chunk: Bytes) -> Result<()>;

    /// All persisted chunks of a file, in ascending index order.
    fn scan(&self, space_id: Uuid, file_id: Uuid) -> BoxStream<'static, Result<(u32, Bytes)>>;
}

/// A scoped byte sink for one finalized download.
#[async_trait]
pub trait DownloadSink: Send {
    async fn append(&mut self, bytes: Bytes) -> Result<()>;

    /// Finish the download. Consumes the sink; called exactly once.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Creates one [`DownloadSink`] per finalized transfer.
#[async_trait]
pub trait SinkFactory: Send + Sync + 'static {
    async fn create(&self, name: &str, size: u64) -> Result<Box<dyn DownloadSink>>;
}

/// In-memory chunk store over a sorted map.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<BTreeMap<(Uuid, Uuid, u32), Bytes>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `data` into `chunk_size` pieces and persist them all; handy for
    /// seeding a serving endpoint.
    pub fn put_file(&self, space_id: Uuid, file_id: Uuid, data: &[u8], chunk_size: usize) {
        let mut chunks = self.chunks.write().expect("chunk store lock poisoned");
        for (index, piece) in data.chunks(chunk_size).enumerate() {
            chunks.insert(
                (space_id, file_id, index as u32),
                Bytes::copy_from_slice(piece),
            );
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn get(&self, space_id: Uuid, file_id: Uuid, index: u32) -> Result<Option<Bytes>> {
        Ok(self
            .chunks
            .read()
            .expect("chunk store lock poisoned")
            .get(&(space_id, file_id, index))
            .cloned())
    }

    async fn put(&self, space_id: Uuid, file_id: Uuid, index: u32, chunk: Bytes) -> Result<()> {
        self.chunks
            .write()
            .expect("chunk store lock poisoned")
            .insert((space_id, file_id, index), chunk);
        Ok(())
    }

    fn scan(&self, space_id: Uuid, file_id: Uuid) -> BoxStream<'static, Result<(u32, Bytes)>> {
        let rows: Vec<(u32, Bytes)> = self
            .chunks
            .read()
            .expect("chunk store lock poisoned")
            .range((space_id, file_id, 0)..=(space_id, file_id, u32::MAX))
            .map(|((_, _, index), chunk)| (*index, chunk.clone()))
            .collect();
        futures::stream::iter(rows.into_iter().map(Ok)).boxed()
    }
}

/// Collects finalized downloads in memory, keyed by file name.
///
/// Stands in for the original's service-worker download stream in tests and
/// headless hosts.
#[derive(Default)]
pub struct MemorySinkFactory {
    finished: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of a finished download, if its sink has been closed.
    pub fn finished(&self, name: &str) -> Option<Vec<u8>> {
        self.finished
            .lock()
            .expect("sink lock poisoned")
            .get(name)
            .cloned()
    }
}

struct MemorySink {
    name: String,
    buffer: Vec<u8>,
    finished: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl DownloadSink for MemorySink {
    async fn append(&mut self, bytes: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&bytes);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.finished
            .lock()
            .expect("sink lock poisoned")
            .insert(self.name, self.buffer);
        Ok(())
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn create(&self, name: &str, _size: u64) -> Result<Box<dyn DownloadSink>> {
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            buffer: Vec::new(),
            finished: self.finished.clone(),
        }))
    }
}

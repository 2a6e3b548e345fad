//! Finalization: stream persisted chunks into the download sink.
//!
//! Single-entry transfers stream straight from the chunk store. Multi-entry
//! transfers are wrapped in a zip container with stored (uncompressed)
//! entries, each fed in range-scan order — the archive is produced
//! streaming, never materialized in memory.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use bytes::Bytes;
use futures::{AsyncWriteExt as _, StreamExt};
use tokio::io::AsyncReadExt;

use crate::config::ARCHIVE_NAME;
use crate::storage::{ChunkStore, SinkFactory};

use super::record::FileEntry;

/// Stream one fully-persisted entry to its own sink.
pub(crate) async fn stream_entry(
    store: &Arc<dyn ChunkStore>,
    sinks: &Arc<dyn SinkFactory>,
    entry: &FileEntry,
) -> Result<()> {
    let mut sink = sinks.create(&entry.name, entry.size).await?;
    let mut chunks = store.scan(entry.space_id, entry.id);
    while let Some(row) = chunks.next().await {
        let (_, chunk) = row?;
        sink.append(chunk).await?;
    }
    sink.close().await
}

/// Stream several fully-persisted entries into one zip archive on the sink.
///
/// Entry names are their space paths relative to the transfer's base path.
pub(crate) async fn stream_archive(
    store: &Arc<dyn ChunkStore>,
    sinks: &Arc<dyn SinkFactory>,
    base_path: &str,
    entries: &[FileEntry],
) -> Result<()> {
    let total: u64 = entries.iter().map(|entry| entry.size).sum();
    let mut sink = sinks.create(ARCHIVE_NAME, total).await?;

    // The zip writer needs an AsyncWrite; a duplex pipe bridges it to the
    // append/close sink contract.
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let pump = tokio::spawn(async move {
        let mut buffer = vec![0u8; 32 * 1024];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            sink.append(Bytes::copy_from_slice(&buffer[..n])).await?;
        }
        sink.close().await
    });

    let mut zip = ZipFileWriter::with_tokio(writer);
    for entry in entries {
        let path = format!("{}{}", entry.path.replacen(base_path, "", 1), entry.name);
        let builder = ZipEntryBuilder::new(path.into(), Compression::Stored);
        let mut entry_writer = zip.write_entry_stream(builder).await?;

        let mut chunks = store.scan(entry.space_id, entry.id);
        while let Some(row) = chunks.next().await {
            let (_, chunk) = row?;
            entry_writer.write_all(&chunk).await?;
        }
        entry_writer.close().await?;
    }
    zip.close().await?;

    pump.await.context("archive pump task failed")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryChunkStore, MemorySinkFactory};
    use uuid::Uuid;

    fn entry(space_id: Uuid, name: &str, path: &str, size: u64) -> FileEntry {
        FileEntry {
            space_id,
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            size,
            origin: "peer".into(),
        }
    }

    #[tokio::test]
    async fn single_entry_streams_chunks_in_order() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let sinks = Arc::new(MemorySinkFactory::new());
        let space = Uuid::new_v4();
        let file = entry(space, "report.bin", "/docs/", 6);

        store.put(space, file.id, 1, Bytes::from_static(b"def")).await.unwrap();
        store.put(space, file.id, 0, Bytes::from_static(b"abc")).await.unwrap();

        let factory: Arc<dyn SinkFactory> = sinks.clone();
        stream_entry(&store, &factory, &file).await.unwrap();
        assert_eq!(sinks.finished("report.bin").unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn multi_entry_archive_is_a_zip_with_all_bytes() {
        let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let sinks = Arc::new(MemorySinkFactory::new());
        let space = Uuid::new_v4();

        let a = entry(space, "a.txt", "/docs/", 5);
        let b = entry(space, "b.txt", "/docs/sub/", 3);
        store.put(space, a.id, 0, Bytes::from_static(b"hello")).await.unwrap();
        store.put(space, b.id, 0, Bytes::from_static(b"two")).await.unwrap();

        let factory: Arc<dyn SinkFactory> = sinks.clone();
        stream_archive(&store, &factory, "/docs/", &[a, b]).await.unwrap();

        let archive = sinks.finished(ARCHIVE_NAME).unwrap();
        assert_eq!(&archive[..4], b"PK\x03\x04", "zip local header signature");
        // Stored entries keep the raw bytes visible in the stream.
        let haystack = archive.as_slice();
        assert!(haystack.windows(5).any(|w| w == b"hello"));
        assert!(haystack.windows(3).any(|w| w == b"two"));
        // Entry paths are relative to the base path.
        assert!(haystack.windows(9).any(|w| w == b"sub/b.txt"));
    }
}

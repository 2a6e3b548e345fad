//! Transfer bookkeeping: entries, recorded chunk indexes, completion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CHUNK_SIZE;

/// Metadata of one file entry inside a space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub space_id: Uuid,
    /// File id; also the chunk-store key component.
    pub id: Uuid,
    pub name: String,
    /// Directory path inside the space, e.g. `/docs/reports/`.
    pub path: String,
    pub size: u64,
    /// Endpoint id of the peer that holds the bytes.
    pub origin: String,
}

/// Per-entry transfer progress.
///
/// `existing_indexes` is kept sorted and duplicate-free; membership checks
/// are binary searches and re-recording a present index is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEntry {
    pub entry: FileEntry,
    pub bytes_transferred: u64,
    pub existing_indexes: Vec<u32>,
}

impl TransferEntry {
    pub fn new(entry: FileEntry) -> Self {
        Self {
            entry,
            bytes_transferred: 0,
            existing_indexes: Vec::new(),
        }
    }

    pub fn with_existing(entry: FileEntry, existing_indexes: Vec<u32>, bytes_transferred: u64) -> Self {
        let mut item = Self {
            entry,
            bytes_transferred,
            existing_indexes,
        };
        item.normalize();
        item
    }

    /// Restore the sorted/unique invariant, e.g. after deserializing a
    /// remote-announced list.
    pub fn normalize(&mut self) {
        self.existing_indexes.sort_unstable();
        self.existing_indexes.dedup();
    }

    /// Expected chunk count: `ceil(size / CHUNK_SIZE)`; zero for empty files.
    pub fn total_chunks(&self) -> u64 {
        self.entry.size.div_ceil(CHUNK_SIZE as u64)
    }

    pub fn chunks_done(&self) -> u64 {
        self.existing_indexes.len() as u64
    }

    pub fn has_index(&self, index: u32) -> bool {
        self.existing_indexes.binary_search(&index).is_ok()
    }

    /// Record a chunk. Returns `false` (and changes nothing, including the
    /// byte counter) when the index was already present.
    pub fn mark_present(&mut self, index: u32, len: u64) -> bool {
        match self.existing_indexes.binary_search(&index) {
            Ok(_) => false,
            Err(position) => {
                self.existing_indexes.insert(position, index);
                self.bytes_transferred += len;
                true
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_done() >= self.total_chunks()
    }
}

/// One transfer, in either role.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: Uuid,
    pub name: String,
    pub base_path: String,
    /// Participating peers: every origin peer for a requesting record, the
    /// announcing peer for a serving record.
    pub peers: Vec<String>,
    pub list: HashMap<Uuid, TransferEntry>,
    pub running: bool,
    /// Set when serving hit a fatal consistency fault (an advertised chunk
    /// was missing from the store).
    pub failed: bool,
}

impl TransferRecord {
    pub fn new(id: Uuid, name: String, base_path: String) -> Self {
        Self {
            id,
            name,
            base_path,
            peers: Vec::new(),
            list: HashMap::new(),
            running: false,
            failed: false,
        }
    }

    /// Build the serving-side record for a remote announcement.
    pub fn announced(
        id: Uuid,
        name: String,
        base_path: String,
        peer: String,
        mut list: HashMap<Uuid, TransferEntry>,
    ) -> Self {
        for item in list.values_mut() {
            item.normalize();
        }
        Self {
            id,
            name,
            base_path,
            peers: vec![peer],
            list,
            running: true,
            failed: false,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.list.values().map(TransferEntry::total_chunks).sum()
    }

    pub fn chunks_done(&self) -> u64 {
        self.list.values().map(TransferEntry::chunks_done).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.list.values().map(|item| item.entry.size).sum()
    }

    /// The completion predicate: cardinality only, storage order irrelevant.
    pub fn is_done(&self) -> bool {
        self.chunks_done() >= self.total_chunks()
    }
}

//! The transfer engine: both protocol roles plus the streaming loop.
//!
//! The engine consumes the link-event stream produced by the multiplexer and
//! keeps two independent record populations: `requesting` (this endpoint is
//! the destination of the bytes) and `serving` (this endpoint is the
//! source). Requester operations gate every state flip on the remote
//! acknowledgements; the serving side is driven by a single background loop
//! that re-filters runnable records each pass, sends one chunk per
//! unfinished entry, and yields between chunks so concurrent transfers
//! interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::try_join_all;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CHUNK_SIZE;
use crate::connection::{LinkEvent, PeerNetwork};
use crate::storage::{ChunkStore, SinkFactory};

use super::archive;
use super::record::{FileEntry, TransferEntry, TransferRecord};
use super::wire::{decode_chunk_frame, encode_chunk_frame};
use super::TransferEvent;

/// Which acknowledgement a waiter is parked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    NewTransfer,
    Pause,
    Resume,
    Delete,
    Done,
}

/// Pending acknowledgement waiters, keyed per peer and transfer.
#[derive(Default)]
struct AckRegistry {
    pending: StdMutex<HashMap<(String, AckKind, Uuid), Vec<oneshot::Sender<()>>>>,
}

impl AckRegistry {
    fn register(&self, peer: &str, kind: AckKind, transfer_id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("ack lock poisoned")
            .entry((peer.to_string(), kind, transfer_id))
            .or_default()
            .push(tx);
        rx
    }

    fn resolve(&self, peer: &str, kind: AckKind, transfer_id: Uuid) {
        let waiters = self
            .pending
            .lock()
            .expect("ack lock poisoned")
            .remove(&(peer.to_string(), kind, transfer_id));
        let Some(waiters) = waiters else {
            debug!(event = "unmatched_ack", peer = %peer, transfer = %transfer_id, ?kind);
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

/// Everything shared between the engine handle, the dispatcher, and the
/// streaming loop.
struct EngineShared {
    network: Arc<dyn PeerNetwork>,
    store: Arc<dyn ChunkStore>,
    sinks: Arc<dyn SinkFactory>,
    /// Transfers this endpoint is receiving (requester role).
    requesting: RwLock<HashMap<Uuid, TransferRecord>>,
    /// Transfers this endpoint is streaming out (server role).
    serving: RwLock<HashMap<Uuid, TransferRecord>>,
    acks: AckRegistry,
    /// Wakes the streaming loop when serving work appears.
    work: Notify,
}

/// One chunk-source snapshot the streaming loop works from.
struct ServeWork {
    transfer_id: Uuid,
    peer: String,
    entries: Vec<ServeEntry>,
}

struct ServeEntry {
    entry_id: Uuid,
    space_id: Uuid,
}

/// The transfer engine handle. Dropping (or [`TransferEngine::close`])
/// stops the dispatcher and the streaming loop.
pub struct TransferEngine {
    shared: Arc<EngineShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransferEngine {
    /// Start the engine over a link layer and its event stream.
    pub fn spawn(
        network: Arc<dyn PeerNetwork>,
        store: Arc<dyn ChunkStore>,
        sinks: Arc<dyn SinkFactory>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            network,
            store,
            sinks,
            requesting: RwLock::new(HashMap::new()),
            serving: RwLock::new(HashMap::new()),
            acks: AckRegistry::default(),
            work: Notify::new(),
        });

        let dispatch = shared.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Event { peer, event } => dispatch.handle_event(peer, event).await,
                    LinkEvent::Bytes { peer, data } => dispatch.handle_chunk(peer, data).await,
                    LinkEvent::Open { .. } => {}
                }
            }
        });

        let streaming = shared.clone();
        let streamer = tokio::spawn(async move {
            streaming.streaming_loop().await;
        });

        Self {
            shared,
            tasks: vec![dispatcher, streamer],
        }
    }

    /// Request `entries` under one transfer. Entries already fully persisted
    /// locally bypass the network; the rest are announced to their origin
    /// peers, and this call returns once every announcement is acknowledged.
    pub async fn start_transfer(
        &self,
        name: &str,
        base_path: &str,
        entries: Vec<FileEntry>,
    ) -> Result<Uuid> {
        self.shared.clone().start_transfer(name, base_path, entries).await
    }

    /// Pause a requesting transfer. Settles only after every participating
    /// peer acknowledged the pause.
    pub async fn pause_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.shared.set_running(transfer_id, false).await
    }

    /// Resume a paused requesting transfer, acknowledgement-gated like pause.
    pub async fn resume_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.shared.set_running(transfer_id, true).await
    }

    /// Delete a requesting transfer: acknowledged by every peer, tunnels
    /// released, record removed.
    pub async fn delete_transfer(&self, transfer_id: Uuid) -> Result<()> {
        self.shared.delete_transfer(transfer_id).await
    }

    pub async fn requesting(&self) -> Vec<TransferRecord> {
        self.shared.requesting.read().await.values().cloned().collect()
    }

    pub async fn serving(&self) -> Vec<TransferRecord> {
        self.shared.serving.read().await.values().cloned().collect()
    }

    pub async fn requesting_record(&self, transfer_id: Uuid) -> Option<TransferRecord> {
        self.shared.requesting.read().await.get(&transfer_id).cloned()
    }

    pub async fn serving_record(&self, transfer_id: Uuid) -> Option<TransferRecord> {
        self.shared.serving.read().await.get(&transfer_id).cloned()
    }

    /// Stop the dispatcher and streaming loop.
    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl EngineShared {
    // ── Requester role ───────────────────────────────────────────────────

    async fn start_transfer(
        self: Arc<Self>,
        name: &str,
        base_path: &str,
        entries: Vec<FileEntry>,
    ) -> Result<Uuid> {
        let transfer_id = Uuid::new_v4();
        let mut record =
            TransferRecord::new(transfer_id, name.to_string(), base_path.to_string());
        let mut remote: HashMap<String, HashMap<Uuid, TransferEntry>> = HashMap::new();

        for entry in entries {
            let mut existing_indexes = Vec::new();
            let mut bytes_transferred = 0u64;
            let mut chunks = self.store.scan(entry.space_id, entry.id);
            while let Some(row) = chunks.next().await {
                let (index, chunk) = row?;
                existing_indexes.push(index);
                bytes_transferred += chunk.len() as u64;
            }

            let item = TransferEntry::with_existing(entry, existing_indexes, bytes_transferred);
            // Anything short of fully resident is requested from its origin.
            if (item.existing_indexes.len() as u64) * (CHUNK_SIZE as u64) < item.entry.size {
                remote
                    .entry(item.entry.origin.clone())
                    .or_default()
                    .insert(item.entry.id, item.clone());
            }
            record.list.insert(item.entry.id, item);
        }

        if remote.is_empty() {
            // Fully resident: no record, no network round trips.
            let entries: Vec<FileEntry> =
                record.list.values().map(|item| item.entry.clone()).collect();
            info!(event = "transfer_resident", transfer = %transfer_id, entries = entries.len());
            self.finalize(&record.base_path, &entries).await?;
            return Ok(transfer_id);
        }

        record.peers = remote.keys().cloned().collect();
        record.running = true;
        let name = record.name.clone();
        let base_path = record.base_path.clone();
        self.requesting.write().await.insert(transfer_id, record);
        info!(event = "transfer_started", transfer = %transfer_id, peers = remote.len());

        try_join_all(remote.into_iter().map(|(peer, list)| {
            let shared = self.clone();
            let name = name.clone();
            let base_path = base_path.clone();
            async move {
                shared.network.connect(&peer).await?;
                shared.network.request_tunnels(&peer).await?;

                let acked = shared.acks.register(&peer, AckKind::NewTransfer, transfer_id);
                shared
                    .network
                    .send_event(
                        &peer,
                        TransferEvent::NewTransfer {
                            id: transfer_id,
                            name,
                            base_path,
                            list,
                        },
                    )
                    .await?;
                acked.await.context("announce ack waiter dropped")?;
                debug!(event = "announce_acked", transfer = %transfer_id, peer = %peer);
                anyhow::Ok(())
            }
        }))
        .await?;

        Ok(transfer_id)
    }

    /// Pause/resume: the flag flips only after every peer acknowledged.
    async fn set_running(&self, transfer_id: Uuid, running: bool) -> Result<()> {
        let peers = self.requesting_peers(transfer_id).await?;
        let kind = if running { AckKind::Resume } else { AckKind::Pause };

        try_join_all(peers.iter().map(|peer| async move {
            let acked = self.acks.register(peer, kind, transfer_id);
            let event = if running {
                TransferEvent::TransferResume { transfer_id }
            } else {
                TransferEvent::TransferPause { transfer_id }
            };
            self.network.send_event(peer, event).await?;
            acked.await.context("ack waiter dropped")?;
            anyhow::Ok(())
        }))
        .await?;

        if let Some(record) = self.requesting.write().await.get_mut(&transfer_id) {
            record.running = running;
        }
        info!(event = "transfer_running_changed", transfer = %transfer_id, running);
        Ok(())
    }

    async fn delete_transfer(&self, transfer_id: Uuid) -> Result<()> {
        let peers = self.requesting_peers(transfer_id).await?;

        try_join_all(peers.iter().map(|peer| async move {
            let acked = self.acks.register(peer, AckKind::Delete, transfer_id);
            self.network
                .send_event(peer, TransferEvent::TransferDelete { transfer_id })
                .await?;
            acked.await.context("ack waiter dropped")?;
            self.network.release_tunnels(peer).await?;
            anyhow::Ok(())
        }))
        .await?;

        self.requesting.write().await.remove(&transfer_id);
        info!(event = "transfer_deleted", transfer = %transfer_id);
        Ok(())
    }

    async fn requesting_peers(&self, transfer_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .requesting
            .read()
            .await
            .get(&transfer_id)
            .with_context(|| format!("no requesting transfer {transfer_id}"))?
            .peers
            .clone())
    }

    /// A chunk frame arrived on a tunnel.
    async fn handle_chunk(self: &Arc<Self>, peer: String, data: Bytes) {
        let frame = match decode_chunk_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "malformed_chunk_frame", peer = %peer, %e);
                return;
            }
        };

        let coordinates = {
            let requesting = self.requesting.read().await;
            requesting
                .get(&frame.transfer_id)
                .and_then(|record| record.list.get(&frame.entry_id))
                .map(|item| (item.entry.space_id, item.entry.id))
        };
        let Some((space_id, file_id)) = coordinates else {
            warn!(
                event = "chunk_for_unknown_transfer",
                peer = %peer,
                transfer = %frame.transfer_id,
            );
            return;
        };

        if let Err(e) = self
            .store
            .put(space_id, file_id, frame.index, frame.payload.clone())
            .await
        {
            error!(
                event = "chunk_persist_failure",
                transfer = %frame.transfer_id,
                index = frame.index,
                %e,
            );
            return;
        }

        let completed = {
            let mut requesting = self.requesting.write().await;
            let Some(record) = requesting.get_mut(&frame.transfer_id) else {
                return;
            };
            let was_done = record.is_done();
            if let Some(item) = record.list.get_mut(&frame.entry_id) {
                item.mark_present(frame.index, frame.payload.len() as u64);
            }
            !was_done && record.is_done()
        };

        if completed {
            // The completion protocol awaits acks that arrive through this
            // same dispatcher, so it must run on its own task.
            let shared = self.clone();
            let transfer_id = frame.transfer_id;
            tokio::spawn(async move {
                if let Err(e) = shared.complete_transfer(transfer_id).await {
                    error!(event = "completion_failure", transfer = %transfer_id, %e);
                }
            });
        }
    }

    /// Completion: notify peers, await their acks, release tunnels, finalize
    /// to the sink, mark not-running. The record stays until deleted.
    async fn complete_transfer(self: &Arc<Self>, transfer_id: Uuid) -> Result<()> {
        let (peers, base_path, entries) = {
            let requesting = self.requesting.read().await;
            let record = requesting
                .get(&transfer_id)
                .context("record vanished before completion")?;
            (
                record.peers.clone(),
                record.base_path.clone(),
                record
                    .list
                    .values()
                    .map(|item| item.entry.clone())
                    .collect::<Vec<_>>(),
            )
        };

        try_join_all(peers.iter().map(|peer| async move {
            let acked = self.acks.register(peer, AckKind::Done, transfer_id);
            self.network
                .send_event(peer, TransferEvent::TransferDone { transfer_id })
                .await?;
            acked.await.context("done ack waiter dropped")?;
            self.network.release_tunnels(peer).await?;
            anyhow::Ok(())
        }))
        .await?;

        self.finalize(&base_path, &entries).await?;

        if let Some(record) = self.requesting.write().await.get_mut(&transfer_id) {
            record.running = false;
        }
        info!(event = "transfer_complete", transfer = %transfer_id);
        Ok(())
    }

    /// The shared tail of both completion paths; closes the sink exactly once.
    async fn finalize(&self, base_path: &str, entries: &[FileEntry]) -> Result<()> {
        if entries.len() == 1 {
            archive::stream_entry(&self.store, &self.sinks, &entries[0]).await
        } else {
            archive::stream_archive(&self.store, &self.sinks, base_path, entries).await
        }
    }

    // ── Server role ──────────────────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, peer: String, event: TransferEvent) {
        match event {
            TransferEvent::NewTransfer {
                id,
                name,
                base_path,
                list,
            } => {
                info!(
                    event = "transfer_announced",
                    transfer = %id,
                    peer = %peer,
                    entries = list.len(),
                );
                let record = TransferRecord::announced(id, name, base_path, peer.clone(), list);
                self.serving.write().await.insert(id, record);
                self.ack(&peer, TransferEvent::NewTransferAck { transfer_id: id })
                    .await;
                self.work.notify_one();
            }
            TransferEvent::TransferPause { transfer_id } => {
                self.set_serving_running(transfer_id, false).await;
                self.ack(&peer, TransferEvent::TransferPauseAck { transfer_id })
                    .await;
            }
            TransferEvent::TransferResume { transfer_id } => {
                self.set_serving_running(transfer_id, true).await;
                self.ack(&peer, TransferEvent::TransferResumeAck { transfer_id })
                    .await;
                self.work.notify_one();
            }
            TransferEvent::TransferDelete { transfer_id } => {
                if self.serving.write().await.remove(&transfer_id).is_some() {
                    if let Err(e) = self.network.release_tunnels(&peer).await {
                        warn!(event = "tunnel_release_failure", peer = %peer, %e);
                    }
                } else {
                    warn!(event = "delete_for_unknown_transfer", transfer = %transfer_id);
                }
                self.ack(&peer, TransferEvent::TransferDeleteAck { transfer_id })
                    .await;
            }
            TransferEvent::TransferDone { transfer_id } => {
                self.set_serving_running(transfer_id, false).await;
                if let Err(e) = self.network.release_tunnels(&peer).await {
                    warn!(event = "tunnel_release_failure", peer = %peer, %e);
                }
                self.ack(&peer, TransferEvent::TransferDoneAck { transfer_id })
                    .await;
                info!(event = "transfer_served", transfer = %transfer_id, peer = %peer);
            }
            TransferEvent::NewTransferAck { transfer_id } => {
                self.acks.resolve(&peer, AckKind::NewTransfer, transfer_id);
            }
            TransferEvent::TransferPauseAck { transfer_id } => {
                self.acks.resolve(&peer, AckKind::Pause, transfer_id);
            }
            TransferEvent::TransferResumeAck { transfer_id } => {
                self.acks.resolve(&peer, AckKind::Resume, transfer_id);
            }
            TransferEvent::TransferDeleteAck { transfer_id } => {
                self.acks.resolve(&peer, AckKind::Delete, transfer_id);
            }
            TransferEvent::TransferDoneAck { transfer_id } => {
                self.acks.resolve(&peer, AckKind::Done, transfer_id);
            }
        }
    }

    async fn set_serving_running(&self, transfer_id: Uuid, running: bool) {
        if let Some(record) = self.serving.write().await.get_mut(&transfer_id) {
            record.running = running;
        } else {
            warn!(event = "control_for_unknown_transfer", transfer = %transfer_id);
        }
    }

    async fn ack(&self, peer: &str, event: TransferEvent) {
        if let Err(e) = self.network.send_event(peer, event).await {
            warn!(event = "ack_send_failure", peer = %peer, %e);
        }
    }

    /// The background chunk source. Runs for the engine's lifetime: parks
    /// while no serving record has work, wakes on announcements and resumes.
    async fn streaming_loop(self: Arc<Self>) {
        let mut cursors: HashMap<(Uuid, Uuid), u32> = HashMap::new();
        loop {
            let batch = self.serving_snapshot().await;
            if batch.is_empty() {
                self.work.notified().await;
                continue;
            }
            for work in &batch {
                if let Err(e) = self.serve_one_pass(work, &mut cursors).await {
                    // Fatal for this transfer only; siblings keep streaming.
                    error!(event = "transfer_failed", transfer = %work.transfer_id, %e);
                    if let Some(record) =
                        self.serving.write().await.get_mut(&work.transfer_id)
                    {
                        record.running = false;
                        record.failed = true;
                    }
                }
            }
        }
    }

    /// Runnable serving records, with only their unfinished entries.
    async fn serving_snapshot(&self) -> Vec<ServeWork> {
        self.serving
            .read()
            .await
            .values()
            .filter(|record| record.running && !record.failed && !record.is_done())
            .filter_map(|record| {
                let peer = record.peers.first()?.clone();
                let entries: Vec<ServeEntry> = record
                    .list
                    .values()
                    .filter(|item| item.bytes_transferred < item.entry.size)
                    .map(|item| ServeEntry {
                        entry_id: item.entry.id,
                        space_id: item.entry.space_id,
                    })
                    .collect();
                // No unfinished entries means nothing to stream this pass.
                if entries.is_empty() {
                    return None;
                }
                Some(ServeWork {
                    transfer_id: record.id,
                    peer,
                    entries,
                })
            })
            .collect()
    }

    /// Send one chunk per unfinished entry of one transfer, yielding after
    /// each so other transfers and local work interleave.
    async fn serve_one_pass(
        &self,
        work: &ServeWork,
        cursors: &mut HashMap<(Uuid, Uuid), u32>,
    ) -> Result<()> {
        for entry in &work.entries {
            let key = (work.transfer_id, entry.entry_id);
            let mut index = cursors.get(&key).copied().unwrap_or(0);
            // Skip everything the requester already holds or we already sent.
            while self.entry_has_index(work.transfer_id, entry.entry_id, index).await {
                index += 1;
            }
            cursors.insert(key, index);

            let chunk = self
                .store
                .get(entry.space_id, entry.entry_id, index)
                .await?
                .with_context(|| {
                    format!("chunk {index} of entry {} missing from store", entry.entry_id)
                })?;

            let frame = encode_chunk_frame(work.transfer_id, entry.entry_id, index, &chunk);
            self.network.send_chunk(&work.peer, frame).await?;

            {
                let mut serving = self.serving.write().await;
                if let Some(item) = serving
                    .get_mut(&work.transfer_id)
                    .and_then(|record| record.list.get_mut(&entry.entry_id))
                {
                    item.mark_present(index, chunk.len() as u64);
                }
            }
            cursors.insert(key, index + 1);
            debug!(
                event = "chunk_sent",
                transfer = %work.transfer_id,
                entry = %entry.entry_id,
                index,
            );

            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn entry_has_index(&self, transfer_id: Uuid, entry_id: Uuid, index: u32) -> bool {
        self.serving
            .read()
            .await
            .get(&transfer_id)
            .and_then(|record| record.list.get(&entry_id))
            .map(|item| item.has_index(index))
            .unwrap_or(false)
    }
}

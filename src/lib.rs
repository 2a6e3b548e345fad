//! Peer-to-peer file transfer for shared spaces.
//!
//! Peers exchange file chunks directly over WebRTC data channels. A relay-only
//! pub/sub signaling service ([`signaling::SignalingTransport`]) coordinates the
//! handshakes; one ordered "events" channel per peer carries fragmented JSON
//! control traffic, and a pool of unordered bulk channels ("tunnels") carries
//! binary chunk frames.
//!
//! Layering, bottom up:
//!
//! - [`signaling`] — the relay transport contract plus an in-process
//!   implementation for tests and same-process peers.
//! - [`connection`] — [`connection::PeerLink`] (handshake + control channel +
//!   tunnel pool) and [`connection::LinkMultiplexer`] (one link per remote
//!   peer, connect-race resolution).
//! - [`transfer`] — [`transfer::TransferEngine`]: the acknowledgement-gated
//!   transfer state machine (announce → ack → stream → complete/pause/resume/
//!   delete) on both the serving and requesting side, with structural
//!   resumability (persisted chunk indexes are never re-sent or re-stored).
//! - [`storage`] — the chunk store and download sink contracts the engine
//!   persists through.
//! - [`context`] — [`SpaceContext`], the owned lifecycle wrapper around the
//!   transport handle and the multiplexer.

pub mod config;
pub mod connection;
pub mod context;
pub mod signaling;
pub mod storage;
pub mod transfer;

pub use connection::{LinkConfig, LinkEvent, LinkMultiplexer, PeerNetwork};
pub use context::SpaceContext;
pub use signaling::{MemorySignaling, SignalMessage, SignalingTransport};
pub use storage::{ChunkStore, DownloadSink, MemoryChunkStore, MemorySinkFactory, SinkFactory};
pub use transfer::{FileEntry, TransferEngine, TransferEvent, TransferRecord};

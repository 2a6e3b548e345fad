//! Centralized configuration constants.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in a
//! single place. Wire-format constants (header offsets, fragment field names)
//! stay with their codecs.

/// Chunk size in bytes (48 KB).
///
/// Sized to fit within the default 64 KB SCTP receive buffer used by
/// webrtc-rs, leaving room for the 80-byte chunk frame header. The receive
/// side limit is not configurable through the public API, so frames must
/// never exceed it.
pub const CHUNK_SIZE: usize = 48 * 1024;

/// Maximum length, in bytes, of one control-message fragment's `part` string.
///
/// Fragment text is re-embedded in a JSON string on the wire, and escaping
/// can nearly double it; 16 KB keeps the worst-case frame under the same
/// 64 KB SCTP receive cap that bounds [`CHUNK_SIZE`].
pub const FRAGMENT_SIZE: usize = 16 * 1024;

/// Number of bulk tunnels opened per peer on first lease.
///
/// The pool size is fixed: later leases reuse the existing tunnels unchanged.
pub const MAX_PEER_TUNNELS: usize = 6;

/// Label of the ordered control data channel.
pub const CONTROL_CHANNEL_LABEL: &str = "events";

/// Label of the unordered bulk data channels.
pub const TUNNEL_CHANNEL_LABEL: &str = "tunnel";

/// File name handed to the download sink for multi-entry downloads.
pub const ARCHIVE_NAME: &str = "download.zip";

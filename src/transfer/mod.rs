//! The resumable chunked transfer protocol.
//!
//! A transfer has two symmetric roles. The *requester* announces what it
//! wants (`NewTransfer`), persists the chunks that arrive, and decides
//! completion by cardinality: a transfer is done when the number of recorded
//! chunk indexes reaches the number of expected chunks across all entries.
//! The *server* registers the announcement and streams the missing chunks
//! from its chunk store over the peer's tunnel pool.
//!
//! Every state transition except completion itself — pause, resume, delete,
//! the announcement, and the done notification — settles locally only after
//! the remote side's acknowledgement. There are no retries and no timeouts:
//! resumability is structural (indexes already persisted are skipped on any
//! future attempt), and an unacknowledged wait stays pending.

mod archive;
mod engine;
mod record;
mod wire;

pub use engine::TransferEngine;
pub use record::{FileEntry, TransferEntry, TransferRecord};
pub use wire::{decode_chunk_frame, encode_chunk_frame, ChunkFrame, HEADER_LEN};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transfer control-plane events, exchanged as JSON over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    /// Requester → server: serve this list of entries.
    NewTransfer {
        id: Uuid,
        name: String,
        base_path: String,
        list: HashMap<Uuid, TransferEntry>,
    },
    NewTransferAck {
        transfer_id: Uuid,
    },
    TransferPause {
        transfer_id: Uuid,
    },
    TransferPauseAck {
        transfer_id: Uuid,
    },
    TransferResume {
        transfer_id: Uuid,
    },
    TransferResumeAck {
        transfer_id: Uuid,
    },
    TransferDelete {
        transfer_id: Uuid,
    },
    TransferDeleteAck {
        transfer_id: Uuid,
    },
    /// Requester → server: completion reached; stop serving.
    TransferDone {
        transfer_id: Uuid,
    },
    TransferDoneAck {
        transfer_id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transfer_wire_shape_is_camel_case() {
        let entry = FileEntry {
            space_id: Uuid::nil(),
            id: Uuid::nil(),
            name: "a.bin".into(),
            path: "/docs/".into(),
            size: 10,
            origin: "peer-a".into(),
        };
        let mut list = HashMap::new();
        list.insert(
            entry.id,
            TransferEntry::with_existing(entry, vec![2, 0], 7),
        );
        let event = TransferEvent::NewTransfer {
            id: Uuid::nil(),
            name: "docs".into(),
            base_path: "/docs/".into(),
            list,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "NewTransfer");
        assert_eq!(json["data"]["basePath"], "/docs/");
        let item = &json["data"]["list"]["00000000-0000-0000-0000-000000000000"];
        assert_eq!(item["bytesTransferred"], 7);
        assert_eq!(item["existingIndexes"], serde_json::json!([0, 2]));
        assert_eq!(item["entry"]["spaceId"], "00000000-0000-0000-0000-000000000000");

        let back: TransferEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, TransferEvent::NewTransfer { .. }));
    }

    #[test]
    fn ack_events_carry_transfer_id() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(TransferEvent::TransferPauseAck { transfer_id: id }).unwrap();
        assert_eq!(json["event"], "TransferPauseAck");
        assert_eq!(json["data"]["transferId"], id.to_string());
    }
}

//! Control-channel message fragmentation and reassembly.
//!
//! Structured payloads are serialized to JSON, split into bounded string
//! parts, and sent as `{id, final, part}` frames. The receiver buffers parts
//! per message id and dispatches only once the `final` part arrives, so two
//! interleaved messages can never be observed half-delivered.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One fragment of a control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: Uuid,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub part: String,
}

/// Split `payload` into parts of at most `max_len` bytes, on char boundaries.
///
/// An empty payload still yields one (empty) part so that a final fragment is
/// always emitted.
pub fn split_fragments(payload: &str, max_len: usize) -> Vec<String> {
    assert!(max_len > 0, "fragment size must be positive");
    if payload.is_empty() {
        return vec![String::new()];
    }

    let mut parts = Vec::with_capacity(payload.len() / max_len + 1);
    let mut rest = payload;
    while !rest.is_empty() {
        let mut end = rest.len().min(max_len);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (part, tail) = rest.split_at(end);
        parts.push(part.to_string());
        rest = tail;
    }
    parts
}

/// Per-message-id reassembly buffer.
///
/// Parts of a given id arrive in order (the control channel is ordered and
/// reliable); parts of different ids may interleave freely.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: HashMap<Uuid, Vec<String>>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the full message once its final part lands.
    pub fn push(&mut self, fragment: Fragment) -> Option<String> {
        if fragment.is_final {
            let mut parts = self.pending.remove(&fragment.id).unwrap_or_default();
            parts.push(fragment.part);
            Some(parts.concat())
        } else {
            self.pending
                .entry(fragment.id)
                .or_default()
                .push(fragment.part);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &str, max_len: usize) -> String {
        let id = Uuid::new_v4();
        let parts = split_fragments(payload, max_len);
        let last = parts.len() - 1;
        let mut assembler = MessageAssembler::new();
        let mut result = None;
        for (i, part) in parts.into_iter().enumerate() {
            let out = assembler.push(Fragment {
                id,
                is_final: i == last,
                part,
            });
            assert_eq!(out.is_some(), i == last, "dispatch only on final part");
            result = out.or(result);
        }
        result.unwrap()
    }

    #[test]
    fn fragmentation_round_trips_boundary_sizes() {
        const F: usize = 64;
        for len in [0usize, 1, F - 1, F, F + 1, 10 * F] {
            let payload: String = ('a'..='z').cycle().take(len).collect();
            assert_eq!(round_trip(&payload, F), payload, "len {len}");
        }
    }

    #[test]
    fn empty_payload_emits_one_final_fragment() {
        assert_eq!(split_fragments("", 8), vec![String::new()]);
    }

    #[test]
    fn split_respects_char_boundaries() {
        let payload = "héllo wörld → ünïcode";
        let parts = split_fragments(payload, 5);
        assert!(parts.iter().all(|p| p.len() <= 5));
        assert_eq!(parts.concat(), payload);
    }

    #[test]
    fn interleaved_ids_reassemble_independently() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut assembler = MessageAssembler::new();

        assert!(assembler
            .push(Fragment { id: a, is_final: false, part: "a1".into() })
            .is_none());
        assert!(assembler
            .push(Fragment { id: b, is_final: false, part: "b1".into() })
            .is_none());
        assert_eq!(
            assembler
                .push(Fragment { id: b, is_final: true, part: "b2".into() })
                .unwrap(),
            "b1b2"
        );
        assert_eq!(
            assembler
                .push(Fragment { id: a, is_final: true, part: "a2".into() })
                .unwrap(),
            "a1a2"
        );
    }

    #[test]
    fn fragment_wire_format_matches_protocol() {
        let fragment = Fragment {
            id: Uuid::nil(),
            is_final: true,
            part: "x".into(),
        };
        let json = serde_json::to_value(&fragment).unwrap();
        assert_eq!(json["final"], true);
        assert_eq!(json["part"], "x");
        assert_eq!(json["id"], "00000000-0000-0000-0000-000000000000");
    }
}

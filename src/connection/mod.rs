//! Peer links: WebRTC connection lifecycle, control-channel framing, and
//! tunnel pools.
//!
//! One [`PeerLink`] exists per remote peer, owned by the [`LinkMultiplexer`].
//! The link negotiates a single ordered "events" data channel over the relay
//! signaling transport, then carries all JSON control traffic on it as
//! `{id, final, part}` fragments. Bulk binary traffic never touches the
//! control channel: it rides a pool of unordered tunnel channels, each
//! negotiated through `Tunnel*` events multiplexed over the control channel
//! itself, so tunnel signaling needs no extra relay round trips.
//!
//! Every signaling protocol layer has its own tagged enum — the relay events
//! ([`BootstrapSignal`], [`ConnectionSignal`]), the tunnel sub-protocol
//! ([`TunnelSignal`]), and the transfer control plane
//! ([`crate::transfer::TransferEvent`]) — so dispatch is exhaustive at
//! compile time rather than string-matched at runtime.

mod framing;
mod gate;
mod link;
mod multiplexer;
mod tunnel;

pub use framing::{split_fragments, Fragment, MessageAssembler};
pub use gate::ReadyGate;
pub use link::PeerLink;
pub use multiplexer::LinkMultiplexer;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::transfer::TransferEvent;

/// Connection-bootstrap events exchanged on each endpoint's well-known
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum BootstrapSignal {
    /// "I want a link to you" — published to the remote peer's channel.
    NewConnectionInit { peer_id: String },
    /// "Link created on my side; you are the offerer" — reply to an init.
    NewConnectionAck { peer_id: String },
}

/// Connection-level handshake events exchanged on the `"{to}#{from}"` pair
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ConnectionSignal {
    Offer { offer: RTCSessionDescription },
    Answer { answer: RTCSessionDescription },
    IceCandidate { candidate: RTCIceCandidateInit },
}

/// Tunnel handshake events, multiplexed over the control channel.
///
/// Each tunnel negotiates its own peer connection; the `tunnel_id` addresses
/// it inside the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum TunnelSignal {
    TunnelOffer {
        tunnel_id: Uuid,
        offer: RTCSessionDescription,
    },
    TunnelAnswer {
        tunnel_id: Uuid,
        answer: RTCSessionDescription,
    },
    TunnelIceCandidate {
        tunnel_id: Uuid,
        candidate: RTCIceCandidateInit,
    },
}

/// Everything that can arrive as reassembled JSON on the control channel.
///
/// Untagged: serde resolves the layer from the embedded `event` tag, trying
/// the tunnel sub-protocol first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlEvent {
    Tunnel(TunnelSignal),
    Transfer(TransferEvent),
}

/// What a link surfaces to the rest of the endpoint.
#[derive(Debug)]
pub enum LinkEvent {
    /// The control channel to `peer` reached the open state.
    Open { peer: String },
    /// A fully reassembled transfer control-plane event.
    Event { peer: String, event: TransferEvent },
    /// A raw binary frame from a tunnel (or, in principle, the control
    /// channel); the payload header identifies the chunk.
    Bytes { peer: String, data: Bytes },
}

/// ICE and loopback configuration shared by every link of an endpoint.
///
/// Control connections and tunnels can use different ICE server sets (the
/// deployment this design comes from routed them through different TURN
/// providers).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub control_ice_servers: Vec<RTCIceServer>,
    pub tunnel_ice_servers: Vec<RTCIceServer>,
    /// Include loopback ICE candidates; needed for same-machine peers
    /// (tests), off for real deployments.
    pub allow_loopback: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let stun = vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            ..Default::default()
        }];
        Self {
            control_ice_servers: stun.clone(),
            tunnel_ice_servers: stun,
            allow_loopback: false,
        }
    }
}

/// The link layer as the transfer engine sees it.
///
/// [`LinkMultiplexer`] is the production implementation; tests substitute
/// their own.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Ensure an open link to `peer` exists (no-op when one already does).
    async fn connect(&self, peer: &str) -> Result<()>;

    /// Send a transfer control-plane event over the peer's control channel.
    async fn send_event(&self, peer: &str, event: TransferEvent) -> Result<()>;

    /// Send one binary chunk frame over the peer's tunnel pool.
    async fn send_chunk(&self, peer: &str, frame: Bytes) -> Result<()>;

    /// Lease the peer's tunnel pool, creating it on first lease.
    async fn request_tunnels(&self, peer: &str) -> Result<()>;

    /// Release one tunnel lease; the pool closes at zero.
    async fn release_tunnels(&self, peer: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_event_routes_by_embedded_tag() {
        let json = r#"{"event":"TunnelIceCandidate","data":{"tunnelId":"6d9427b6-7e8c-4b4e-97e0-7925e8a62b7d","candidate":{"candidate":"candidate:1 1 udp 1 127.0.0.1 4444 typ host"}}}"#;
        match serde_json::from_str::<ControlEvent>(json).unwrap() {
            ControlEvent::Tunnel(TunnelSignal::TunnelIceCandidate { tunnel_id, .. }) => {
                assert_eq!(
                    tunnel_id.to_string(),
                    "6d9427b6-7e8c-4b4e-97e0-7925e8a62b7d"
                );
            }
            other => panic!("wrong route: {other:?}"),
        }

        let json = r#"{"event":"TransferPause","data":{"transferId":"6d9427b6-7e8c-4b4e-97e0-7925e8a62b7d"}}"#;
        assert!(matches!(
            serde_json::from_str::<ControlEvent>(json).unwrap(),
            ControlEvent::Transfer(TransferEvent::TransferPause { .. })
        ));
    }

    #[test]
    fn bootstrap_signal_round_trips_through_signal_message() {
        let signal = BootstrapSignal::NewConnectionInit {
            peer_id: "alice".into(),
        };
        let message = crate::signaling::to_message(&signal).unwrap();
        assert_eq!(message.name, "NewConnectionInit");
        assert_eq!(message.data["peerId"], "alice");
        let parsed: BootstrapSignal = crate::signaling::from_message(&message).unwrap();
        assert!(matches!(
            parsed,
            BootstrapSignal::NewConnectionInit { peer_id } if peer_id == "alice"
        ));
    }
}

//! Bulk tunnels: pooled unordered data channels for binary chunk frames.
//!
//! Tunnels exist only while leased. The first lease opens a fixed pool of
//! [`crate::config::MAX_PEER_TUNNELS`] channels, each negotiated on its own
//! peer connection through `Tunnel*` events carried over the control channel;
//! the last release tears them all down. Chunk sends race every tunnel's
//! readiness gate and take whichever opens first — the gate reset before the
//! send keeps exactly one chunk in flight per tunnel, which is the protocol's
//! only flow-control mechanism. The race has no fairness guarantee: a
//! consistently low-RTT tunnel can starve the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::future::{select_all, try_join_all};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{MAX_PEER_TUNNELS, TUNNEL_CHANNEL_LABEL};

use super::gate::ReadyGate;
use super::link::build_api;
use super::{LinkConfig, LinkEvent, TunnelSignal};

/// One bulk channel: its own peer connection, data channel, early-candidate
/// queue, and readiness gate.
pub(crate) struct Tunnel {
    id: Uuid,
    pc: Arc<RTCPeerConnection>,
    dc: RwLock<Option<Arc<RTCDataChannel>>>,
    pending_candidates: Mutex<Vec<webrtc::ice_transport::ice_candidate::RTCIceCandidateInit>>,
    gate: ReadyGate,
}

impl Tunnel {
    /// Apply candidates buffered before the remote description was known.
    async fn flush_candidates(&self) -> Result<()> {
        for candidate in self.pending_candidates.lock().await.drain(..) {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

/// The per-peer tunnel pool, owned by that peer's link.
pub(crate) struct TunnelPool {
    peer_id: String,
    config: LinkConfig,
    tunnels: RwLock<HashMap<Uuid, Arc<Tunnel>>>,
    leases: StdMutex<usize>,
    /// Serializes pool creation across concurrent first leases.
    create_lock: Mutex<()>,
    /// Serializes the pick-first-ready race so two senders cannot win the
    /// same tunnel before one of them resets its gate.
    picker: Mutex<()>,
    /// Outbound tunnel handshake events, drained onto the control channel by
    /// the owning link.
    signal_tx: mpsc::UnboundedSender<TunnelSignal>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl TunnelPool {
    pub(crate) fn new(
        peer_id: String,
        config: LinkConfig,
        signal_tx: mpsc::UnboundedSender<TunnelSignal>,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            peer_id,
            config,
            tunnels: RwLock::new(HashMap::new()),
            leases: StdMutex::new(0),
            create_lock: Mutex::new(()),
            picker: Mutex::new(()),
            signal_tx,
            events_tx,
        }
    }

    /// Take one lease. The first lease creates the pool and waits until every
    /// tunnel's channel is open; later leases return the pool unchanged.
    pub(crate) async fn lease(&self) -> Result<()> {
        {
            let mut leases = self.leases.lock().expect("lease lock poisoned");
            *leases += 1;
        }

        let _creating = self.create_lock.lock().await;
        if !self.tunnels.read().await.is_empty() {
            return Ok(());
        }

        let created =
            try_join_all((0..MAX_PEER_TUNNELS).map(|_| self.create_tunnel())).await?;
        for tunnel in &created {
            tunnel.gate.ready().await;
        }
        debug!(
            event = "tunnel_pool_open",
            peer = %self.peer_id,
            tunnels = created.len(),
        );
        Ok(())
    }

    /// Drop one lease; at zero the whole pool is torn down.
    pub(crate) async fn release(&self) {
        let drained = {
            let mut leases = self.leases.lock().expect("lease lock poisoned");
            *leases = leases.saturating_sub(1);
            *leases == 0
        };
        if drained {
            self.close_all().await;
        }
    }

    /// Send one binary frame over whichever tunnel becomes ready first.
    pub(crate) async fn send(&self, frame: Bytes) -> Result<()> {
        let tunnel = {
            let _picking = self.picker.lock().await;
            let tunnels: Vec<Arc<Tunnel>> =
                self.tunnels.read().await.values().cloned().collect();
            if tunnels.is_empty() {
                bail!("no tunnels open for peer {}", self.peer_id);
            }
            let gates: Vec<_> = tunnels.iter().map(|t| Box::pin(t.gate.ready())).collect();
            let (_, winner, _) = select_all(gates).await;
            let tunnel = tunnels[winner].clone();
            // Not ready again until this send drains.
            tunnel.gate.reset();
            tunnel
        };

        let dc = tunnel
            .dc
            .read()
            .await
            .clone()
            .with_context(|| format!("tunnel {} has no channel", tunnel.id))?;
        dc.send(&frame)
            .await
            .with_context(|| format!("send on tunnel {} failed", tunnel.id))?;
        Ok(())
    }

    /// Drive one inbound tunnel handshake event.
    pub(crate) async fn handle_signal(&self, signal: TunnelSignal) -> Result<()> {
        match signal {
            TunnelSignal::TunnelOffer { tunnel_id, offer } => {
                debug!(event = "tunnel_offer_received", tunnel = %tunnel_id, peer = %self.peer_id);
                let tunnel = self.init_tunnel(tunnel_id).await?;

                // The offerer created the channel; it shows up here once the
                // connection comes up.
                let inbound = tunnel.clone();
                let events_tx = self.events_tx.clone();
                let peer_id = self.peer_id.clone();
                tunnel.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let inbound = inbound.clone();
                    let events_tx = events_tx.clone();
                    let peer_id = peer_id.clone();
                    Box::pin(async move {
                        attach_channel(&inbound, &dc, events_tx, peer_id).await;
                        *inbound.dc.write().await = Some(dc.clone());
                        // The channel may have opened before the handler was
                        // in place; re-check so the gate cannot be missed.
                        if dc.ready_state() == RTCDataChannelState::Open {
                            inbound.gate.set_ready();
                        }
                    })
                }));

                tunnel.pc.set_remote_description(offer).await?;
                tunnel.flush_candidates().await?;

                let answer = tunnel.pc.create_answer(None).await?;
                tunnel.pc.set_local_description(answer.clone()).await?;
                self.send_signal(TunnelSignal::TunnelAnswer { tunnel_id, answer });
            }
            TunnelSignal::TunnelAnswer { tunnel_id, answer } => {
                debug!(event = "tunnel_answer_received", tunnel = %tunnel_id, peer = %self.peer_id);
                let tunnel = self.tunnel(tunnel_id).await?;
                tunnel.pc.set_remote_description(answer).await?;
                tunnel.flush_candidates().await?;
            }
            TunnelSignal::TunnelIceCandidate {
                tunnel_id,
                candidate,
            } => {
                let tunnel = self.tunnel(tunnel_id).await?;
                if tunnel.pc.remote_description().await.is_some() {
                    tunnel.pc.add_ice_candidate(candidate).await?;
                } else {
                    tunnel.pending_candidates.lock().await.push(candidate);
                }
            }
        }
        Ok(())
    }

    /// Close and forget every tunnel.
    pub(crate) async fn close_all(&self) {
        let tunnels: Vec<Arc<Tunnel>> =
            self.tunnels.write().await.drain().map(|(_, t)| t).collect();
        for tunnel in tunnels {
            if let Err(e) = tunnel.pc.close().await {
                warn!(event = "tunnel_close_failure", tunnel = %tunnel.id, %e);
            }
            debug!(event = "tunnel_closed", tunnel = %tunnel.id, peer = %self.peer_id);
        }
    }

    async fn tunnel(&self, id: Uuid) -> Result<Arc<Tunnel>> {
        self.tunnels
            .read()
            .await
            .get(&id)
            .cloned()
            .with_context(|| format!("unknown tunnel {id} for peer {}", self.peer_id))
    }

    /// Offerer path: open a new tunnel, create its channel, and send the
    /// offer over the control channel.
    async fn create_tunnel(&self) -> Result<Arc<Tunnel>> {
        let tunnel_id = Uuid::new_v4();
        let tunnel = self.init_tunnel(tunnel_id).await?;

        let dc = tunnel
            .pc
            .create_data_channel(
                TUNNEL_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    ..Default::default()
                }),
            )
            .await?;
        attach_channel(&tunnel, &dc, self.events_tx.clone(), self.peer_id.clone()).await;
        *tunnel.dc.write().await = Some(dc);

        let offer = tunnel.pc.create_offer(None).await?;
        tunnel.pc.set_local_description(offer.clone()).await?;
        debug!(event = "tunnel_offer_sent", tunnel = %tunnel_id, peer = %self.peer_id);
        self.send_signal(TunnelSignal::TunnelOffer { tunnel_id, offer });

        Ok(tunnel)
    }

    /// Common construction for both negotiation directions: peer connection,
    /// candidate trickling, registration in the pool.
    async fn init_tunnel(&self, tunnel_id: Uuid) -> Result<Arc<Tunnel>> {
        let api = build_api(self.config.allow_loopback);
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.config.tunnel_ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let tunnel = Arc::new(Tunnel {
            id: tunnel_id,
            pc: pc.clone(),
            dc: RwLock::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            gate: ReadyGate::new(false),
        });

        let signal_tx = self.signal_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signal_tx = signal_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(candidate) => {
                        let _ = signal_tx.send(TunnelSignal::TunnelIceCandidate {
                            tunnel_id,
                            candidate,
                        });
                    }
                    Err(e) => warn!(event = "tunnel_candidate_encode_failure", %e),
                }
            })
        }));

        self.tunnels.write().await.insert(tunnel_id, tunnel.clone());
        Ok(tunnel)
    }

    fn send_signal(&self, signal: TunnelSignal) {
        // The receiver lives in the owning link; failure means the link is
        // already tearing down.
        let _ = self.signal_tx.send(signal);
    }
}

/// Wire up a tunnel data channel: drain-gated readiness and inbound routing.
async fn attach_channel(
    tunnel: &Arc<Tunnel>,
    dc: &Arc<RTCDataChannel>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    peer_id: String,
) {
    dc.set_buffered_amount_low_threshold(0).await;

    let drained = tunnel.clone();
    dc.on_buffered_amount_low(Box::new(move || {
        let drained = drained.clone();
        Box::pin(async move {
            drained.gate.set_ready();
        })
    }))
    .await;

    let opened = tunnel.clone();
    let open_peer = peer_id.clone();
    dc.on_open(Box::new(move || {
        debug!(event = "tunnel_channel_open", tunnel = %opened.id, peer = %open_peer);
        opened.gate.set_ready();
        Box::pin(async move {})
    }));

    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let events_tx = events_tx.clone();
        let peer = peer_id.clone();
        Box::pin(async move {
            if message.is_string {
                warn!(event = "tunnel_string_frame_dropped", peer = %peer);
                return;
            }
            let _ = events_tx.send(LinkEvent::Bytes {
                peer,
                data: message.data,
            });
        })
    }));
}

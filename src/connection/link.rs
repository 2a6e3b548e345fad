//! One peer link: signaling handshake, control channel, tunnel pool.
//!
//! The link is created in one of two stances. The *offerer* (the side that
//! observed a `NewConnectionAck`) calls [`PeerLink::start`], creates the
//! "events" channel, and publishes the offer; the *answerer* waits for the
//! offer and receives the channel through `on_data_channel`. Either way the
//! link afterwards owns all control-channel traffic to that peer and the
//! peer's tunnel pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{CONTROL_CHANNEL_LABEL, FRAGMENT_SIZE};
use crate::signaling::{self, pair_channel, SignalingTransport};
use crate::transfer::TransferEvent;

use super::framing::{split_fragments, Fragment, MessageAssembler};
use super::tunnel::TunnelPool;
use super::{ConnectionSignal, ControlEvent, LinkConfig, LinkEvent, TunnelSignal};

/// Build the WebRTC API object shared by links and tunnels.
pub(crate) fn build_api(allow_loopback: bool) -> API {
    let mut se = SettingEngine::default();
    se.set_include_loopback_candidate(allow_loopback);
    APIBuilder::new().with_setting_engine(se).build()
}

/// The full connection state for one remote peer.
pub struct PeerLink {
    local_id: String,
    peer_id: String,
    transport: Arc<dyn SignalingTransport>,
    pc: Arc<RTCPeerConnection>,
    control: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    /// ICE candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    open: Arc<watch::Sender<bool>>,
    /// Buffered-amount-low pulses from the control channel.
    drain: Arc<Notify>,
    /// Serializes fragmented sends; one fragment in flight at a time.
    send_lock: Mutex<()>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Inbound tunnel handshake events, drained by the pool task.
    tunnel_tx: mpsc::UnboundedSender<TunnelSignal>,
    tunnels: Arc<TunnelPool>,
    offered: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl PeerLink {
    pub(crate) async fn new(
        local_id: &str,
        peer_id: &str,
        transport: Arc<dyn SignalingTransport>,
        config: &LinkConfig,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<Self>> {
        let api = build_api(config.allow_loopback);
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: config.control_ice_servers.clone(),
                ..Default::default()
            })
            .await?,
        );

        let (tunnel_out_tx, mut tunnel_out_rx) = mpsc::unbounded_channel::<TunnelSignal>();
        let (tunnel_in_tx, mut tunnel_in_rx) = mpsc::unbounded_channel::<TunnelSignal>();
        let tunnels = Arc::new(TunnelPool::new(
            peer_id.to_string(),
            config.clone(),
            tunnel_out_tx,
            events_tx.clone(),
        ));

        let control: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));
        let open = Arc::new(watch::channel(false).0);
        let drain = Arc::new(Notify::new());

        // Trickle local candidates to the peer's pair channel as they gather.
        {
            let transport = transport.clone();
            let local = local_id.to_string();
            let peer = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let transport = transport.clone();
                let local = local.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(event = "candidate_encode_failure", %e);
                            return;
                        }
                    };
                    let Ok(message) =
                        signaling::to_message(&ConnectionSignal::IceCandidate { candidate: init })
                    else {
                        return;
                    };
                    debug!(event = "candidate_sent", peer = %peer);
                    if let Err(e) = transport.publish(&pair_channel(&peer, &local), message).await {
                        warn!(event = "signal_publish_failure", peer = %peer, %e);
                    }
                })
            }));
        }

        // Answerer stance: the offerer creates the control channel, it shows
        // up here once the connection comes up.
        {
            let control = control.clone();
            let open = open.clone();
            let drain = drain.clone();
            let events_tx = events_tx.clone();
            let tunnel_in_tx = tunnel_in_tx.clone();
            let peer = peer_id.to_string();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let control = control.clone();
                let open = open.clone();
                let drain = drain.clone();
                let events_tx = events_tx.clone();
                let tunnel_in_tx = tunnel_in_tx.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    if dc.label() != CONTROL_CHANNEL_LABEL {
                        warn!(event = "unexpected_channel", peer = %peer, label = %dc.label());
                        return;
                    }
                    attach_control(
                        &dc,
                        peer.clone(),
                        drain,
                        open.clone(),
                        events_tx.clone(),
                        tunnel_in_tx,
                    )
                    .await;
                    *control.write().await = Some(dc.clone());
                    // The channel may have opened before the handler was in
                    // place; re-check so the open gate cannot be missed.
                    if dc.ready_state() == RTCDataChannelState::Open && !*open.borrow() {
                        info!(event = "control_channel_open", peer = %peer);
                        open.send_replace(true);
                        let _ = events_tx.send(LinkEvent::Open { peer });
                    }
                })
            }));
        }

        let link = Arc::new(Self {
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            transport: transport.clone(),
            pc,
            control,
            pending_candidates: Mutex::new(Vec::new()),
            open,
            drain,
            send_lock: Mutex::new(()),
            events_tx,
            tunnel_tx: tunnel_in_tx,
            tunnels: tunnels.clone(),
            offered: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        // Handshake events from the relay, in arrival order.
        let mut signals = transport.subscribe(&pair_channel(local_id, peer_id));
        let signal_link = link.clone();
        let signal_task = tokio::spawn(async move {
            while let Some(message) = signals.recv().await {
                match signaling::from_message::<ConnectionSignal>(&message) {
                    Ok(signal) => {
                        if let Err(e) = signal_link.handle_signal(signal).await {
                            warn!(event = "handshake_failure", peer = %signal_link.peer_id, %e);
                        }
                    }
                    Err(e) => warn!(event = "unknown_connection_event", %e),
                }
            }
        });

        // Tunnel handshake events reassembled off the control channel.
        let pool = tunnels.clone();
        let pool_peer = peer_id.to_string();
        let tunnel_task = tokio::spawn(async move {
            while let Some(signal) = tunnel_in_rx.recv().await {
                if let Err(e) = pool.handle_signal(signal).await {
                    warn!(event = "tunnel_handshake_failure", peer = %pool_peer, %e);
                }
            }
        });

        // Outbound tunnel handshake events ride the control channel.
        let out_link = link.clone();
        let outbound_task = tokio::spawn(async move {
            while let Some(signal) = tunnel_out_rx.recv().await {
                if let Err(e) = out_link.send_control(&ControlEvent::Tunnel(signal)).await {
                    warn!(event = "tunnel_signal_send_failure", peer = %out_link.peer_id, %e);
                }
            }
        });

        link.tasks
            .lock()
            .expect("task lock poisoned")
            .extend([signal_task, tunnel_task, outbound_task]);
        Ok(link)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Whether this side ran the offerer path.
    pub fn is_offerer(&self) -> bool {
        self.offered.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the control channel reaches the open state.
    pub async fn wait_open(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Offerer path: create the control channel and publish the offer.
    pub(crate) async fn start(&self) -> Result<()> {
        self.offered.store(true, Ordering::SeqCst);
        let dc = self
            .pc
            .create_data_channel(
                CONTROL_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        attach_control(
            &dc,
            self.peer_id.clone(),
            self.drain.clone(),
            self.open.clone(),
            self.events_tx.clone(),
            self.tunnel_tx.clone(),
        )
        .await;
        *self.control.write().await = Some(dc);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.publish(ConnectionSignal::Offer { offer }).await?;
        info!(event = "offer_sent", peer = %self.peer_id);
        Ok(())
    }

    /// Drive one inbound handshake event.
    async fn handle_signal(&self, signal: ConnectionSignal) -> Result<()> {
        match signal {
            ConnectionSignal::Offer { offer } => {
                debug!(event = "offer_received", peer = %self.peer_id);
                self.pc.set_remote_description(offer).await?;
                self.flush_candidates().await?;
                let answer = self.pc.create_answer(None).await?;
                self.pc.set_local_description(answer.clone()).await?;
                self.publish(ConnectionSignal::Answer { answer }).await?;
                debug!(event = "answer_sent", peer = %self.peer_id);
            }
            ConnectionSignal::Answer { answer } => {
                debug!(event = "answer_received", peer = %self.peer_id);
                self.pc.set_remote_description(answer).await?;
                self.flush_candidates().await?;
            }
            ConnectionSignal::IceCandidate { candidate } => {
                debug!(event = "candidate_received", peer = %self.peer_id);
                if self.pc.remote_description().await.is_some() {
                    self.pc.add_ice_candidate(candidate).await?;
                } else {
                    self.pending_candidates.lock().await.push(candidate);
                }
            }
        }
        Ok(())
    }

    /// Send a transfer control-plane event over the control channel.
    pub(crate) async fn send_event(&self, event: TransferEvent) -> Result<()> {
        self.send_control(&ControlEvent::Transfer(event)).await
    }

    /// Send a binary chunk frame over the tunnel pool.
    pub(crate) async fn send_chunk(&self, frame: Bytes) -> Result<()> {
        self.tunnels.send(frame).await
    }

    pub(crate) async fn lease_tunnels(&self) -> Result<()> {
        self.tunnels.lease().await
    }

    pub(crate) async fn release_tunnels(&self) {
        self.tunnels.release().await
    }

    /// Serialize, fragment, and send one control event, waiting for the
    /// channel to drain between fragments. Memory stays bounded no matter
    /// how large the payload is.
    async fn send_control(&self, event: &ControlEvent) -> Result<()> {
        let _sending = self.send_lock.lock().await;
        let dc = self
            .control
            .read()
            .await
            .clone()
            .with_context(|| format!("control channel to {} not open", self.peer_id))?;

        let payload = serde_json::to_string(event)?;
        let id = Uuid::new_v4();
        let parts = split_fragments(&payload, FRAGMENT_SIZE);
        let last = parts.len() - 1;
        for (i, part) in parts.into_iter().enumerate() {
            let frame = serde_json::to_string(&Fragment {
                id,
                is_final: i == last,
                part,
            })?;
            // Register for the drain pulse before sending so a fast callback
            // cannot be missed.
            let drained = self.drain.notified();
            dc.send_text(frame)
                .await
                .with_context(|| format!("control send to {} failed", self.peer_id))?;
            drained.await;
        }
        Ok(())
    }

    async fn publish(&self, signal: ConnectionSignal) -> Result<()> {
        let message = signaling::to_message(&signal)?;
        self.transport
            .publish(&pair_channel(&self.peer_id, &self.local_id), message)
            .await
    }

    async fn flush_candidates(&self) -> Result<()> {
        for candidate in self.pending_candidates.lock().await.drain(..) {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Tear the link down: stop the signal tasks, close every tunnel, close
    /// the connection.
    pub(crate) async fn destroy(&self) {
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        self.tunnels.close_all().await;
        if let Err(e) = self.pc.close().await {
            warn!(event = "connection_close_failure", peer = %self.peer_id, %e);
        }
        self.open.send_replace(false);
        info!(event = "link_closed", peer = %self.peer_id);
    }
}

/// Wire up the control channel: drain pulses, open gate, inbound routing.
async fn attach_control(
    dc: &Arc<RTCDataChannel>,
    peer_id: String,
    drain: Arc<Notify>,
    open: Arc<watch::Sender<bool>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    tunnel_tx: mpsc::UnboundedSender<TunnelSignal>,
) {
    dc.set_buffered_amount_low_threshold(0).await;

    {
        let drain = drain.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            drain.notify_one();
            Box::pin(async {})
        }))
        .await;
    }

    {
        let open = open.clone();
        let events_tx = events_tx.clone();
        let peer = peer_id.clone();
        dc.on_open(Box::new(move || {
            info!(event = "control_channel_open", peer = %peer);
            open.send_replace(true);
            let _ = events_tx.send(LinkEvent::Open { peer: peer.clone() });
            Box::pin(async {})
        }));
    }

    let assembler = Arc::new(StdMutex::new(MessageAssembler::new()));
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let assembler = assembler.clone();
        let events_tx = events_tx.clone();
        let tunnel_tx = tunnel_tx.clone();
        let peer = peer_id.clone();
        Box::pin(async move {
            route_message(message, &assembler, &events_tx, &tunnel_tx, peer);
        })
    }));
}

/// Route one inbound control-channel message: fragments reassemble into
/// either tunnel handshake events or transfer events; binary passes through.
fn route_message(
    message: DataChannelMessage,
    assembler: &StdMutex<MessageAssembler>,
    events_tx: &mpsc::UnboundedSender<LinkEvent>,
    tunnel_tx: &mpsc::UnboundedSender<TunnelSignal>,
    peer: String,
) {
    if !message.is_string {
        let _ = events_tx.send(LinkEvent::Bytes {
            peer,
            data: message.data,
        });
        return;
    }

    let fragment: Fragment = match serde_json::from_slice(&message.data) {
        Ok(fragment) => fragment,
        Err(e) => {
            warn!(event = "malformed_fragment", peer = %peer, %e);
            return;
        }
    };

    let Some(payload) = assembler
        .lock()
        .expect("assembler lock poisoned")
        .push(fragment)
    else {
        return;
    };

    match serde_json::from_str::<ControlEvent>(&payload) {
        Ok(ControlEvent::Tunnel(signal)) => {
            let _ = tunnel_tx.send(signal);
        }
        Ok(ControlEvent::Transfer(event)) => {
            let _ = events_tx.send(LinkEvent::Event { peer, event });
        }
        Err(e) => warn!(event = "unknown_control_event", peer = %peer, %e),
    }
}

//! The link multiplexer: one peer link per remote endpoint.
//!
//! Owns the id→link map and the endpoint's well-known signaling channel.
//! Connection bootstrap is asymmetric on purpose: the initiator publishes
//! `NewConnectionInit` and waits; the other side creates its link (answerer
//! stance) and replies `NewConnectionAck`; whichever side observes the ack
//! runs the offerer path. When two `connect` calls overlap, the side whose
//! init arrives at a peer that already created a link gets no ack — exactly
//! one ack is ever produced per pair, so exactly one offerer results. If the
//! two inits cross in flight before either side created its inbound link,
//! neither acks and both `connect` calls stay pending — the same indefinite
//! wait this protocol accepts for any lost acknowledgement (it has no
//! timeouts).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::signaling::{self, SignalingTransport};
use crate::transfer::TransferEvent;

use super::link::PeerLink;
use super::{BootstrapSignal, LinkConfig, LinkEvent, PeerNetwork};

/// Owns every peer link of the local endpoint.
pub struct LinkMultiplexer {
    local_id: String,
    transport: Arc<dyn SignalingTransport>,
    config: LinkConfig,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    bootstrap: StdMutex<Option<JoinHandle<()>>>,
}

impl LinkMultiplexer {
    /// Create the multiplexer and start listening on the endpoint's
    /// well-known channel. The returned receiver carries every link's
    /// events (channel opens, transfer events, binary frames).
    pub fn new(
        local_id: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
        config: LinkConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let local_id = local_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mux = Arc::new(Self {
            local_id: local_id.clone(),
            transport,
            config,
            links: RwLock::new(HashMap::new()),
            events_tx,
            bootstrap: StdMutex::new(None),
        });

        let mut inbound = mux.transport.subscribe(&local_id);
        let task_mux = mux.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match signaling::from_message::<BootstrapSignal>(&message) {
                    Ok(BootstrapSignal::NewConnectionInit { peer_id }) => {
                        task_mux.handle_connection_init(peer_id).await;
                    }
                    Ok(BootstrapSignal::NewConnectionAck { peer_id }) => {
                        task_mux.handle_connection_ack(peer_id).await;
                    }
                    Err(e) => warn!(event = "unknown_bootstrap_event", %e),
                }
            }
        });
        *mux.bootstrap.lock().expect("bootstrap lock poisoned") = Some(task);

        (mux, events_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Ensure an open link to `peer`. A second connect to an already-open
    /// peer is a no-op; a connect racing an inbound init joins the existing
    /// link instead of creating a second one.
    pub async fn connect(&self, peer: &str) -> Result<()> {
        let link = {
            let mut links = self.links.write().await;
            if let Some(link) = links.get(peer) {
                link.clone()
            } else {
                let link = PeerLink::new(
                    &self.local_id,
                    peer,
                    self.transport.clone(),
                    &self.config,
                    self.events_tx.clone(),
                )
                .await?;
                links.insert(peer.to_string(), link.clone());
                let message = signaling::to_message(&BootstrapSignal::NewConnectionInit {
                    peer_id: self.local_id.clone(),
                })?;
                self.transport.publish(peer, message).await?;
                info!(event = "connection_init_sent", peer = %peer);
                link
            }
        };
        link.wait_open().await;
        Ok(())
    }

    /// Tear down and forget the link to `peer`.
    pub async fn disconnect(&self, peer: &str) -> Result<()> {
        let link = self
            .links
            .write()
            .await
            .remove(peer)
            .with_context(|| format!("no link for peer {peer}"))?;
        link.destroy().await;
        Ok(())
    }

    /// Peers with a registered link (open or still handshaking).
    pub async fn peers(&self) -> Vec<String> {
        self.links.read().await.keys().cloned().collect()
    }

    /// The link for `peer`, if one is registered.
    pub async fn link_for(&self, peer: &str) -> Option<Arc<PeerLink>> {
        self.links.read().await.get(peer).cloned()
    }

    /// Tear down every link and stop the bootstrap listener.
    pub async fn destroy(&self) {
        if let Some(task) = self
            .bootstrap
            .lock()
            .expect("bootstrap lock poisoned")
            .take()
        {
            task.abort();
        }
        let links: Vec<_> = self.links.write().await.drain().collect();
        for (_, link) in links {
            link.destroy().await;
        }
        info!(event = "multiplexer_closed", endpoint = %self.local_id);
    }

    async fn handle_connection_init(&self, peer: String) {
        {
            let mut links = self.links.write().await;
            if links.contains_key(&peer) {
                // Crossed with a local connect for the same peer; no ack, so
                // the remote side stays the prospective offerer.
                debug!(event = "connection_init_ignored", peer = %peer);
                return;
            }
            match PeerLink::new(
                &self.local_id,
                &peer,
                self.transport.clone(),
                &self.config,
                self.events_tx.clone(),
            )
            .await
            {
                Ok(link) => {
                    links.insert(peer.clone(), link);
                }
                Err(e) => {
                    warn!(event = "link_create_failure", peer = %peer, %e);
                    return;
                }
            }
        }
        info!(event = "connection_init_received", peer = %peer);

        let ack = BootstrapSignal::NewConnectionAck {
            peer_id: self.local_id.clone(),
        };
        match signaling::to_message(&ack) {
            Ok(message) => {
                if let Err(e) = self.transport.publish(&peer, message).await {
                    warn!(event = "connection_ack_failure", peer = %peer, %e);
                }
            }
            Err(e) => warn!(event = "connection_ack_failure", peer = %peer, %e),
        }
    }

    async fn handle_connection_ack(&self, peer: String) {
        let Some(link) = self.links.read().await.get(&peer).cloned() else {
            warn!(event = "connection_ack_without_link", peer = %peer);
            return;
        };
        // The ack observer is the offerer.
        if let Err(e) = link.start().await {
            warn!(event = "offer_failure", peer = %peer, %e);
        }
    }

    async fn link(&self, peer: &str) -> Result<Arc<PeerLink>> {
        self.links
            .read()
            .await
            .get(peer)
            .cloned()
            .with_context(|| format!("no link for peer {peer}"))
    }
}

#[async_trait]
impl PeerNetwork for LinkMultiplexer {
    async fn connect(&self, peer: &str) -> Result<()> {
        LinkMultiplexer::connect(self, peer).await
    }

    async fn send_event(&self, peer: &str, event: TransferEvent) -> Result<()> {
        self.link(peer).await?.send_event(event).await
    }

    async fn send_chunk(&self, peer: &str, frame: Bytes) -> Result<()> {
        self.link(peer).await?.send_chunk(frame).await
    }

    async fn request_tunnels(&self, peer: &str) -> Result<()> {
        self.link(peer).await?.lease_tunnels().await
    }

    async fn release_tunnels(&self, peer: &str) -> Result<()> {
        self.link(peer).await?.release_tunnels().await;
        Ok(())
    }
}

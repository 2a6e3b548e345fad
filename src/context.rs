//! The space context: an owned lifecycle around the signaling transport and
//! the link multiplexer.
//!
//! Hosts open one context per endpoint, hand its link layer (and the event
//! stream) to a [`crate::transfer::TransferEngine`], and close it when the
//! endpoint leaves the space. Nothing in this crate is a process-wide
//! global.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::{LinkConfig, LinkEvent, LinkMultiplexer};
use crate::signaling::SignalingTransport;

/// One endpoint's connection to a space: the relay transport handle and the
/// peer-link multiplexer built on it.
pub struct SpaceContext {
    transport: Arc<dyn SignalingTransport>,
    links: Arc<LinkMultiplexer>,
}

impl SpaceContext {
    /// Open the context: start listening for inbound connections on the
    /// endpoint's well-known channel. The returned receiver is the event
    /// stream a transfer engine consumes.
    pub fn open(
        local_id: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
        config: LinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (links, events) = LinkMultiplexer::new(local_id, transport.clone(), config);
        (Self { transport, links }, events)
    }

    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    pub fn links(&self) -> Arc<LinkMultiplexer> {
        self.links.clone()
    }

    /// Tear down every peer link and stop listening.
    pub async fn close(&self) {
        self.links.destroy().await;
    }
}

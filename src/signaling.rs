//! Relay signaling transport contract and helpers.
//!
//! The signaling service is external to this crate: anything that offers named
//! pub/sub channels with ordered, reliable delivery of small JSON events
//! satisfies [`SignalingTransport`]. Connection bootstrap listens on each
//! endpoint's *well-known channel* (its bare endpoint id); a pair of peers
//! exchanges handshake events on directional *pair channels* named
//! `"{to}#{from}"`.
//!
//! [`MemorySignaling`] is the in-process implementation used by tests and by
//! peers living in the same process.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One published signaling event: an event name plus its JSON payload.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub name: String,
    pub data: Value,
}

/// Named pub/sub channels with ordered, reliable per-channel delivery.
///
/// The crate only ever calls these two operations; everything else about the
/// relay (auth, presence, history) is the host application's business.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Publish an event to a channel. Delivery to current subscribers is
    /// ordered with respect to other publishes on the same channel.
    async fn publish(&self, channel: &str, message: SignalMessage) -> Result<()>;

    /// Subscribe to every event on a channel. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<SignalMessage>;
}

/// Name of the directional pair channel `to` listens on for events from
/// `from`.
pub fn pair_channel(to: &str, from: &str) -> String {
    format!("{to}#{from}")
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    event: String,
    data: Value,
}

/// Serialize a tagged signal enum into an `(event, data)` message.
///
/// Works for any enum using `#[serde(tag = "event", content = "data")]`.
pub fn to_message<T: Serialize>(value: &T) -> Result<SignalMessage> {
    let envelope: Envelope =
        serde_json::from_value(serde_json::to_value(value)?).context("signal has no event tag")?;
    Ok(SignalMessage {
        name: envelope.event,
        data: envelope.data,
    })
}

/// Parse an `(event, data)` message back into a tagged signal enum.
///
/// Fails when the event name or payload does not belong to `T`; callers
/// decide whether that is an error or an event meant for another layer.
pub fn from_message<T: DeserializeOwned>(message: &SignalMessage) -> Result<T> {
    let value = serde_json::to_value(Envelope {
        event: message.name.clone(),
        data: message.data.clone(),
    })?;
    serde_json::from_value(value).with_context(|| format!("unexpected event {:?}", message.name))
}

/// In-process signaling: a map of channel name to live subscribers.
///
/// Publishes are fanned out under a lock, so per-channel ordering holds for
/// every subscriber. Closed subscribers are pruned on the next publish.
#[derive(Default)]
pub struct MemorySignaling {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SignalMessage>>>>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn publish(&self, channel: &str, message: SignalMessage) -> Result<()> {
        let mut channels = self.channels.lock().expect("signaling lock poisoned");
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<SignalMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .expect("signaling lock poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let io = MemorySignaling::new();
        let mut a = io.subscribe("ch");
        let mut b = io.subscribe("ch");

        for i in 0..3 {
            io.publish(
                "ch",
                SignalMessage {
                    name: format!("ev{i}"),
                    data: Value::Null,
                },
            )
            .await
            .unwrap();
        }

        for rx in [&mut a, &mut b] {
            for i in 0..3 {
                assert_eq!(rx.recv().await.unwrap().name, format!("ev{i}"));
            }
        }
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let io = MemorySignaling::new();
        let mut a = io.subscribe("a");
        io.publish(
            "b",
            SignalMessage {
                name: "ev".into(),
                data: Value::Null,
            },
        )
        .await
        .unwrap();
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let io = MemorySignaling::new();
        let rx = io.subscribe("ch");
        drop(rx);
        io.publish(
            "ch",
            SignalMessage {
                name: "ev".into(),
                data: Value::Null,
            },
        )
        .await
        .unwrap();
        assert!(io.channels.lock().unwrap().get("ch").unwrap().is_empty());
    }
}

//! Channel readiness gate.
//!
//! Replaces the ad hoc one-shot promises the protocol models readiness with:
//! a tunnel (or the control channel) is *ready* when its channel is open and
//! drained, *not ready* from the moment a send is issued until the transport
//! signals buffered-amount-low again. Resetting before the send is what
//! enforces the one-chunk-in-flight-per-tunnel invariant.

use tokio::sync::watch;

/// An async ready/not-ready flag with edge-triggered waiting.
///
/// Any number of tasks may await [`ReadyGate::ready`]; they all wake when the
/// gate becomes ready. The gate starts not-ready and is flipped by the
/// channel's open and drain callbacks.
#[derive(Debug)]
pub struct ReadyGate {
    state: watch::Sender<bool>,
}

impl ReadyGate {
    pub fn new(ready: bool) -> Self {
        Self {
            state: watch::channel(ready).0,
        }
    }

    /// Mark ready and wake every waiter.
    pub fn set_ready(&self) {
        self.state.send_replace(true);
    }

    /// Mark not-ready. Call immediately before issuing a send so no other
    /// sender can pick this channel until it drains.
    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the gate is ready. Returns immediately when it already is.
    pub async fn ready(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so wait_for cannot fail while we borrow it.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn ready_resolves_immediately_when_already_ready() {
        let gate = ReadyGate::new(true);
        timeout(Duration::from_millis(100), gate.ready())
            .await
            .expect("should not block");
    }

    #[tokio::test]
    async fn second_send_waits_for_first_drain() {
        // Two queued sends on one tunnel: the second must not dispatch until
        // the first send's drain signal fires.
        let gate = Arc::new(ReadyGate::new(true));

        // First send: picks the tunnel, resets the gate.
        gate.ready().await;
        gate.reset();

        // Second send is now blocked.
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.ready().await })
        };
        assert!(
            timeout(Duration::from_millis(50), gate.ready()).await.is_err(),
            "gate must stay closed until the drain callback"
        );

        // Drain callback fires; the queued send proceeds.
        gate.set_ready();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain must release the waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn all_waiters_wake_on_ready() {
        let gate = Arc::new(ReadyGate::new(false));
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.ready().await })
            })
            .collect();
        gate.set_ready();
        for task in tasks {
            timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        }
    }
}

//! Request Channel (spec.md §4.9): owns the Router socket and the
//! pending-correlation map.
//!
//! `(correlation -> (connectionIdentity, timeout timer))`. A duplicate
//! correlation from the *same* identity replaces the timer (the agent is
//! allowed to re-send while waiting); from a *different* identity it is
//! rejected outright, since a response may only ever be delivered to the
//! identity that originated its correlation (spec.md §8 invariant 4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use carapace_transport::{ConnectionIdentity, Router, TransportError};
use carapace_types::Envelope;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum RequestChannelError {
    #[error("correlation '{0}' is already pending from a different connection")]
    IdentityMismatch(String),
    #[error("no pending request for correlation '{0}'")]
    NotPending(String),
    #[error("response envelope for '{0}' has no correlation")]
    MissingCorrelation(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

struct Pending {
    identity: ConnectionIdentity,
    timer: JoinHandle<()>,
}

/// Invoked when a pending correlation's timeout fires before a response is
/// sent. The correlation becomes permanently unresponsive; no late response
/// follows (spec.md §4.9).
pub type TimeoutHandler = Arc<dyn Fn(String, ConnectionIdentity) + Send + Sync>;

pub struct RequestChannel {
    router: Arc<dyn Router>,
    pending: Arc<RwLock<HashMap<String, Pending>>>,
    timeout: Duration,
    on_timeout: TimeoutHandler,
}

impl RequestChannel {
    pub fn new(router: Arc<dyn Router>, timeout: Duration, on_timeout: TimeoutHandler) -> Self {
        Self {
            router,
            pending: Arc::new(RwLock::new(HashMap::new())),
            timeout,
            on_timeout,
        }
    }

    /// Receive the next inbound frame from the Router. Callers parse it into
    /// a [`carapace_types::WireMessage`] and register the pending
    /// correlation before running the pipeline.
    pub async fn recv(&self) -> Option<(ConnectionIdentity, Vec<u8>)> {
        self.router.recv().await
    }

    /// Register `correlation` as pending on `identity`, starting its
    /// timeout. Replaces an existing timer if the same identity re-sends the
    /// same correlation; rejects a different identity outright.
    pub async fn register_pending(
        &self,
        correlation: &str,
        identity: ConnectionIdentity,
    ) -> Result<(), RequestChannelError> {
        let mut pending = self.pending.write().await;
        if let Some(existing) = pending.get(correlation) {
            if existing.identity != identity {
                return Err(RequestChannelError::IdentityMismatch(correlation.to_string()));
            }
            existing.timer.abort();
        }
        let timer = self.spawn_timeout(correlation.to_string(), identity.clone());
        pending.insert(correlation.to_string(), Pending { identity, timer });
        Ok(())
    }

    fn spawn_timeout(&self, correlation: String, identity: ConnectionIdentity) -> JoinHandle<()> {
        let pending = self.pending.clone();
        let duration = self.timeout;
        let on_timeout = self.on_timeout.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut pending = pending.write().await;
            if pending.remove(&correlation).is_some() {
                on_timeout(correlation, identity);
            }
        })
    }

    /// Send `envelope` back to `identity`, verifying it is the identity that
    /// originated `envelope.correlation` and canceling its timer. Raises if
    /// the correlation is unknown or belongs to a different identity.
    pub async fn send_response(
        &self,
        identity: &ConnectionIdentity,
        envelope: &Envelope,
    ) -> Result<(), RequestChannelError> {
        let correlation = envelope
            .correlation
            .clone()
            .ok_or_else(|| RequestChannelError::MissingCorrelation(envelope.id.to_string()))?;

        let mut pending = self.pending.write().await;
        match pending.get(&correlation) {
            Some(entry) if &entry.identity == identity => {
                let entry = pending.remove(&correlation).expect("checked above");
                entry.timer.abort();
            }
            Some(_) => return Err(RequestChannelError::IdentityMismatch(correlation)),
            None => return Err(RequestChannelError::NotPending(correlation)),
        }
        drop(pending);

        let payload = serde_json::to_vec(envelope).expect("envelope always serializes");
        self.router.send_to(identity, payload).await?;
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Cancel every pending timer and close the Router. Idempotent.
    pub async fn close(&self) -> Result<(), RequestChannelError> {
        let mut pending = self.pending.write().await;
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
        drop(pending);
        self.router.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carapace_transport::{Dealer, FakeHub};
    use std::sync::Mutex as StdMutex;

    fn no_op_handler() -> TimeoutHandler {
        Arc::new(|_correlation, _identity| {})
    }

    fn sample_envelope(correlation: &str) -> Envelope {
        Envelope::new_response_ok(
            &Envelope::new_request(
                &carapace_types::WireMessage {
                    topic: "tool.invoke.echo".to_string(),
                    correlation: correlation.to_string(),
                    arguments: serde_json::Map::new(),
                },
                "container-1",
                "demo",
            ),
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn send_response_happy_path_routes_to_originating_identity() {
        let hub = FakeHub::new();
        let router = Arc::new(hub.router());
        let dealer = hub.dealer();
        let channel = RequestChannel::new(router, Duration::from_secs(30), no_op_handler());

        channel
            .register_pending("c1", dealer.identity().clone())
            .await
            .unwrap();
        channel
            .send_response(dealer.identity(), &sample_envelope("c1"))
            .await
            .unwrap();

        let reply = dealer.recv().await.unwrap();
        let envelope: Envelope = serde_json::from_slice(&reply).unwrap();
        assert_eq!(envelope.correlation.as_deref(), Some("c1"));
        assert_eq!(channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn send_response_to_wrong_identity_is_rejected() {
        let hub = FakeHub::new();
        let router = Arc::new(hub.router());
        let dealer_a = hub.dealer();
        let dealer_b = hub.dealer();
        let channel = RequestChannel::new(router, Duration::from_secs(30), no_op_handler());

        channel
            .register_pending("c1", dealer_a.identity().clone())
            .await
            .unwrap();
        let err = channel
            .send_response(dealer_b.identity(), &sample_envelope("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestChannelError::IdentityMismatch(_)));
    }

    #[tokio::test]
    async fn duplicate_correlation_same_identity_replaces_timer() {
        let hub = FakeHub::new();
        let router = Arc::new(hub.router());
        let dealer = hub.dealer();
        let channel = RequestChannel::new(router, Duration::from_secs(30), no_op_handler());

        channel
            .register_pending("c1", dealer.identity().clone())
            .await
            .unwrap();
        channel
            .register_pending("c1", dealer.identity().clone())
            .await
            .unwrap();
        assert_eq!(channel.pending_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_correlation_different_identity_is_rejected() {
        let hub = FakeHub::new();
        let router = Arc::new(hub.router());
        let dealer_a = hub.dealer();
        let dealer_b = hub.dealer();
        let channel = RequestChannel::new(router, Duration::from_secs(30), no_op_handler());

        channel
            .register_pending("c1", dealer_a.identity().clone())
            .await
            .unwrap();
        let err = channel
            .register_pending("c1", dealer_b.identity().clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RequestChannelError::IdentityMismatch(_)));
    }

    #[tokio::test]
    async fn timeout_fires_and_clears_pending_entry() {
        let hub = FakeHub::new();
        let router = Arc::new(hub.router());
        let dealer = hub.dealer();
        let fired: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let fired_clone = fired.clone();
        let handler: TimeoutHandler = Arc::new(move |correlation, _identity| {
            *fired_clone.lock().unwrap() = Some(correlation);
        });
        let channel = RequestChannel::new(router, Duration::from_millis(5), handler);

        channel
            .register_pending("c1", dealer.identity().clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(channel.pending_count().await, 0);
        assert_eq!(fired.lock().unwrap().as_deref(), Some("c1"));

        let err = channel
            .send_response(dealer.identity(), &sample_envelope("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestChannelError::NotPending(_)));
    }
}

//! In-memory fake transport satisfying the [`crate::traits`] contracts.
//!
//! Routes synchronously within the process via bounded `tokio::mpsc`
//! channels, mirroring the bounded-channel ownership style of
//! `clawft-core/src/bus.rs`. Used by every test in this workspace instead
//! of binding a real Unix socket or TCP listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::traits::{
    ConnectionIdentity, Dealer, Publisher, Router, Subscriber, TransportError, TransportResult,
};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

// ── Pub/Sub ──────────────────────────────────────────────────────────────

struct SubscriberSlot {
    prefixes: Vec<String>,
    tx: mpsc::Sender<(String, Vec<u8>)>,
}

/// Shared broker state for one pub/sub address. Create one with
/// [`FakeBus::new`] and hand out [`FakePublisher`]/[`FakeSubscriber`]
/// handles via [`FakeBus::publisher`]/[`FakeBus::subscriber`].
pub struct FakeBus {
    subscribers: Mutex<Vec<SubscriberSlot>>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn publisher(self: &Arc<Self>) -> FakePublisher {
        FakePublisher { bus: self.clone() }
    }

    pub async fn subscriber(self: &Arc<Self>) -> FakeSubscriber {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let mut subs = self.subscribers.lock().await;
        subs.push(SubscriberSlot {
            prefixes: Vec::new(),
            tx: tx.clone(),
        });
        let index = subs.len() - 1;
        FakeSubscriber {
            bus: self.clone(),
            index,
            rx: Mutex::new(rx),
        }
    }
}

pub struct FakePublisher {
    bus: Arc<FakeBus>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        let subs = self.bus.subscribers.lock().await;
        let mut delivered = 0;
        for slot in subs.iter() {
            if slot.prefixes.iter().any(|p| topic.starts_with(p.as_str()))
                && slot.tx.send((topic.to_string(), payload.clone())).await.is_ok()
            {
                delivered += 1;
            }
        }
        debug!(topic, delivered, "fake publish");
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

pub struct FakeSubscriber {
    bus: Arc<FakeBus>,
    index: usize,
    rx: Mutex<mpsc::Receiver<(String, Vec<u8>)>>,
}

#[async_trait]
impl Subscriber for FakeSubscriber {
    async fn subscribe(&self, topic_prefix: &str) -> TransportResult<()> {
        let mut subs = self.bus.subscribers.lock().await;
        if let Some(slot) = subs.get_mut(self.index) {
            slot.prefixes.push(topic_prefix.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic_prefix: &str) -> TransportResult<()> {
        let mut subs = self.bus.subscribers.lock().await;
        if let Some(slot) = subs.get_mut(self.index) {
            slot.prefixes.retain(|p| p != topic_prefix);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<(String, Vec<u8>)> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) -> TransportResult<()> {
        let mut subs = self.bus.subscribers.lock().await;
        if let Some(slot) = subs.get_mut(self.index) {
            slot.prefixes.clear();
        }
        Ok(())
    }
}

// ── Router/Dealer ────────────────────────────────────────────────────────

/// Shared hub state for one router/dealer address.
pub struct FakeHub {
    inbound_tx: mpsc::Sender<(ConnectionIdentity, Vec<u8>)>,
    inbound_rx: Mutex<mpsc::Receiver<(ConnectionIdentity, Vec<u8>)>>,
    dealers: DashMap<ConnectionIdentity, mpsc::Sender<Vec<u8>>>,
    next_identity: AtomicU64,
}

impl FakeHub {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Arc::new(Self {
            inbound_tx: tx,
            inbound_rx: Mutex::new(rx),
            dealers: DashMap::new(),
            next_identity: AtomicU64::new(1),
        })
    }

    pub fn router(self: &Arc<Self>) -> FakeRouter {
        FakeRouter { hub: self.clone() }
    }

    /// Connect a new dealer, minting a fresh connection identity the way a
    /// real Router/Dealer transport assigns one per connection.
    pub fn dealer(self: &Arc<Self>) -> FakeDealer {
        let id = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let identity = id.to_be_bytes().to_vec();
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        self.dealers.insert(identity.clone(), tx);
        FakeDealer {
            hub: self.clone(),
            identity,
            rx: Mutex::new(rx),
        }
    }
}

pub struct FakeRouter {
    hub: Arc<FakeHub>,
}

#[async_trait]
impl Router for FakeRouter {
    async fn recv(&self) -> Option<(ConnectionIdentity, Vec<u8>)> {
        self.hub.inbound_rx.lock().await.recv().await
    }

    async fn send_to(&self, identity: &ConnectionIdentity, payload: Vec<u8>) -> TransportResult<()> {
        let tx = self
            .hub
            .dealers
            .get(identity)
            .ok_or(TransportError::UnknownIdentity)?
            .clone();
        tx.send(payload)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        Ok(())
    }
}

pub struct FakeDealer {
    hub: Arc<FakeHub>,
    identity: ConnectionIdentity,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl FakeDealer {
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }
}

#[async_trait]
impl Dealer for FakeDealer {
    async fn send(&self, payload: Vec<u8>) -> TransportResult<()> {
        self.hub
            .inbound_tx
            .send((self.identity.clone(), payload))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.hub.dealers.remove(&self.identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pubsub_prefix_match_delivers() {
        let bus = FakeBus::new();
        let publisher = bus.publisher();
        let subscriber = bus.subscriber().await;
        subscriber.subscribe("tool.invoke").await.unwrap();

        publisher
            .publish("tool.invoke.echo", b"hello".to_vec())
            .await
            .unwrap();
        let (topic, payload) = subscriber.recv().await.unwrap();
        assert_eq!(topic, "tool.invoke.echo");
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn pubsub_non_matching_prefix_not_delivered() {
        let bus = FakeBus::new();
        let publisher = bus.publisher();
        let subscriber = bus.subscriber().await;
        subscriber.subscribe("message.inbound").await.unwrap();

        publisher
            .publish("tool.invoke.echo", b"hello".to_vec())
            .await
            .unwrap();

        // Give the channel a moment; there should be nothing queued.
        tokio::select! {
            _ = subscriber.recv() => panic!("should not have received a non-matching message"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
    }

    #[tokio::test]
    async fn router_dealer_round_trip() {
        let hub = FakeHub::new();
        let router = hub.router();
        let dealer = hub.dealer();

        dealer.send(b"ping".to_vec()).await.unwrap();
        let (identity, payload) = router.recv().await.unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(&identity, dealer.identity());

        router.send_to(&identity, b"pong".to_vec()).await.unwrap();
        let reply = dealer.recv().await.unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn router_send_to_unknown_identity_fails() {
        let hub = FakeHub::new();
        let router = hub.router();
        let bogus = vec![9, 9, 9];
        let err = router.send_to(&bogus, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownIdentity));
    }
}

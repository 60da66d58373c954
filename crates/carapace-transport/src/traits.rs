//! Transport capability traits (spec.md §4.1).
//!
//! Two capability sets:
//! - **Pub/Sub:** a [`Publisher`] sends two-frame `(topic, payload)`
//!   messages; a [`Subscriber`] registers *prefix* subscriptions and
//!   receives the same frames.
//! - **Router/Dealer:** a [`Router`] receives and sends three-frame
//!   `(connection_identity, delimiter, payload)` messages; a [`Dealer`]
//!   exchanges single-frame payloads, with the transport prepending its
//!   identity on the way up.
//!
//! The core depends only on these contracts -- never on a concrete
//! transport -- so the in-memory [`fake`](crate::fake) can satisfy tests
//! without binding a real socket.

use async_trait::async_trait;

/// Opaque bytes assigned by a Router/Dealer transport that uniquely tag one
/// connected dealer for the lifetime of its connection.
pub type ConnectionIdentity = Vec<u8>;

/// Transport-level error. Concrete transports (Unix socket, TCP, in-memory
/// fake) each map their own failures onto this.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("no such connection identity")]
    UnknownIdentity,
    #[error("bind failed: {0}")]
    BindFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A publisher binds to an address and sends two-frame `(topic, payload)`
/// messages to every subscriber whose prefix matches `topic`.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;
    async fn close(&self) -> TransportResult<()>;
}

/// A subscriber connects and registers prefix subscriptions; matching is
/// string-prefix on the topic frame (subscribing to `tool.invoke` delivers
/// all `tool.invoke.X`).
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Register a new prefix to match incoming topics against.
    async fn subscribe(&self, topic_prefix: &str) -> TransportResult<()>;
    /// Remove a previously registered prefix.
    async fn unsubscribe(&self, topic_prefix: &str) -> TransportResult<()>;
    /// Receive the next matching frame, or `None` once the subscriber is closed.
    async fn recv(&self) -> Option<(String, Vec<u8>)>;
    async fn close(&self) -> TransportResult<()>;
}

/// A router binds and receives three-frame messages, and can route a
/// response back to the connection identity that sent the original frame.
#[async_trait]
pub trait Router: Send + Sync {
    /// Receive the next inbound frame, or `None` once the router is closed.
    async fn recv(&self) -> Option<(ConnectionIdentity, Vec<u8>)>;
    /// Send a frame back to a specific connection identity.
    async fn send_to(&self, identity: &ConnectionIdentity, payload: Vec<u8>) -> TransportResult<()>;
    async fn close(&self) -> TransportResult<()>;
}

/// A dealer connects to a router and exchanges single-frame payloads; the
/// transport prepends its identity on the way up.
#[async_trait]
pub trait Dealer: Send + Sync {
    async fn send(&self, payload: Vec<u8>) -> TransportResult<()>;
    async fn recv(&self) -> Option<Vec<u8>>;
    async fn close(&self) -> TransportResult<()>;
}

//! # carapace-transport
//!
//! Pub/Sub and Router/Dealer transport traits (spec.md §4.1) plus an
//! in-memory fake implementation used throughout this workspace's tests.
//! Real Unix-socket/TCP transports are an external concern (spec.md §1);
//! the core never depends on anything but these traits.

pub mod fake;
pub mod traits;

pub use fake::{FakeBus, FakeDealer, FakeHub, FakePublisher, FakeRouter, FakeSubscriber};
pub use traits::{
    ConnectionIdentity, Dealer, Publisher, Router, Subscriber, TransportError, TransportResult,
};

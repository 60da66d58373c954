//! Event Bus (spec.md §4.10): publish/subscribe over
//! [`carapace_transport::Publisher`]/[`carapace_transport::Subscriber`],
//! string-prefix topic matching, JSON-encoded envelopes on the wire.

use std::sync::Arc;

use carapace_transport::{Subscriber, TransportError};
use carapace_types::Envelope;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct EventBus {
    publisher: Arc<dyn carapace_transport::Publisher>,
}

impl EventBus {
    pub fn new(publisher: Arc<dyn carapace_transport::Publisher>) -> Self {
        Self { publisher }
    }

    /// Serialize `envelope` and publish it under its own topic.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), EventBusError> {
        let payload = serde_json::to_vec(envelope)?;
        self.publisher.publish(&envelope.topic, payload).await?;
        Ok(())
    }

    /// Close the publisher. Subscriptions are closed independently via
    /// [`Subscription::unsubscribe`].
    pub async fn close(&self) -> Result<(), EventBusError> {
        self.publisher.close().await?;
        Ok(())
    }

    /// Subscribe to every `topics` prefix and spawn a background task that
    /// invokes `on_message` for each delivered frame until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub async fn subscribe<F>(
        &self,
        subscriber: Arc<dyn Subscriber>,
        topics: &[&str],
        on_message: F,
    ) -> Result<Subscription, EventBusError>
    where
        F: Fn(String, Vec<u8>) + Send + Sync + 'static,
    {
        for topic in topics {
            subscriber.subscribe(topic).await?;
        }

        let loop_subscriber = subscriber.clone();
        let task = tokio::spawn(async move {
            while let Some((topic, payload)) = loop_subscriber.recv().await {
                on_message(topic, payload);
            }
        });

        Ok(Subscription { subscriber, task })
    }
}

/// A live subscription. Dropping this without calling [`Self::unsubscribe`]
/// leaves the background task running; always unsubscribe explicitly.
pub struct Subscription {
    subscriber: Arc<dyn Subscriber>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn unsubscribe(self) {
        self.task.abort();
        if let Err(err) = self.subscriber.close().await {
            warn!(?err, "error closing subscriber during unsubscribe");
        }
    }
}

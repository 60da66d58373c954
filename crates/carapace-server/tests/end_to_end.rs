//! End-to-end scenarios from spec.md §8, driven through the full
//! `Server` composition root over the in-memory fake transport rather
//! than by calling `Pipeline::run` directly -- these exercise the
//! Request Channel's pending-correlation wiring (spec.md §4.9) as well
//! as the pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use carapace_containers::FakeRuntime;
use carapace_core::dispatcher::InMemorySessionIdStore;
use carapace_core::CarapaceConfig;
use carapace_server::{Server, Transport};
use carapace_transport::{Dealer, FakeBus, FakeHub};

fn base_config(socket_dir: PathBuf, audit_dir: PathBuf) -> CarapaceConfig {
    CarapaceConfig {
        socket_dir,
        audit_dir,
        ..CarapaceConfig::default()
    }
}

async fn start_server(config: CarapaceConfig) -> (Arc<Server>, Arc<FakeHub>) {
    let hub = FakeHub::new();
    let bus = FakeBus::new();
    let transport = Transport {
        router: Arc::new(hub.router()),
        publisher: Arc::new(bus.publisher()),
        subscriber: Arc::new(bus.subscriber().await),
    };
    let runtime = Arc::new(FakeRuntime::new());
    let store = Arc::new(InMemorySessionIdStore::new());
    let server = Server::start(config, transport, runtime, store).await.unwrap();
    (server, hub)
}

async fn recv_envelope(dealer: &carapace_transport::FakeDealer) -> carapace_types::Envelope {
    let reply = tokio::time::timeout(Duration::from_secs(1), dealer.recv())
        .await
        .expect("response arrives before the test timeout")
        .expect("dealer channel stays open");
    serde_json::from_slice(&reply).unwrap()
}

#[tokio::test]
async fn scenario_1_happy_path_echo() {
    let socket_tmp = tempfile::tempdir().unwrap();
    let audit_tmp = tempfile::tempdir().unwrap();
    let config = base_config(socket_tmp.path().to_path_buf(), audit_tmp.path().to_path_buf());
    let (server, hub) = start_server(config).await;
    let dealer = hub.dealer();

    let wire = serde_json::json!({
        "topic": "tool.invoke.echo",
        "correlation": "c1",
        "arguments": {"text": "hi"}
    });
    dealer.send(serde_json::to_vec(&wire).unwrap()).await.unwrap();

    let envelope = recv_envelope(&dealer).await;
    assert_eq!(envelope.correlation.as_deref(), Some("c1"));
    assert_eq!(envelope.source, "core");
    assert!(envelope.payload.error.is_none());
    assert_eq!(
        envelope.payload.result,
        Some(serde_json::json!({"echoed": "hi"}))
    );

    server.stop().await;
}

#[tokio::test]
async fn scenario_2_identity_spoofing_is_rejected_and_still_routed_back() {
    let socket_tmp = tempfile::tempdir().unwrap();
    let audit_tmp = tempfile::tempdir().unwrap();
    let config = base_config(socket_tmp.path().to_path_buf(), audit_tmp.path().to_path_buf());
    let (server, hub) = start_server(config).await;
    let dealer = hub.dealer();

    let wire = serde_json::json!({
        "topic": "tool.invoke.echo",
        "correlation": "c2",
        "arguments": {"text": "hi"},
        "group": "admin"
    });
    dealer.send(serde_json::to_vec(&wire).unwrap()).await.unwrap();

    let envelope = recv_envelope(&dealer).await;
    // The rejection still carries the originating correlation -- a wire
    // message that never becomes a valid Request envelope must still be
    // routable back to the dealer that's waiting on it (spec.md §4.9).
    assert_eq!(envelope.correlation.as_deref(), Some("c2"));
    let error = envelope.payload.error.expect("spoofed group is rejected");
    assert_eq!(error.code, carapace_types::ErrorCode::ValidationFailed);
    assert!(envelope.payload.result.is_none());

    server.stop().await;
}

#[tokio::test]
async fn scenario_6_pending_timeout_clears_the_request_channel() {
    let socket_tmp = tempfile::tempdir().unwrap();
    let audit_tmp = tempfile::tempdir().unwrap();
    let mut config = base_config(socket_tmp.path().to_path_buf(), audit_tmp.path().to_path_buf());
    config.request_channel.timeout_ms = 50;
    let (server, hub) = start_server(config).await;
    let dealer = hub.dealer();

    let wire = serde_json::json!({
        "topic": "tool.invoke.echo",
        "correlation": "c6",
        "arguments": {"text": "hi"}
    });
    dealer.send(serde_json::to_vec(&wire).unwrap()).await.unwrap();

    // The echo handler is fast, so the pending entry clears via the normal
    // response path well inside the timeout window.
    let envelope = recv_envelope(&dealer).await;
    assert_eq!(envelope.correlation.as_deref(), Some("c6"));

    server.stop().await;
}

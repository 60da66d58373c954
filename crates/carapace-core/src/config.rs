//! Structural "options bag" configuration records (spec.md §9), each with
//! the defaults documented there. Loaded from TOML with environment
//! overrides by the server composition root; every other component only
//! ever sees the typed record it owns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Request Channel timeout and socket-directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestChannelConfig {
    pub timeout_ms: u64,
}

impl Default for RequestChannelConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Container Lifecycle Manager timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub shutdown_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
    pub max_concurrent_ops: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 10_000,
            health_check_timeout_ms: 30_000,
            max_concurrent_ops: 8,
        }
    }
}

/// Default and per-group token-bucket parameters (spec.md §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

/// Pre-parse message size and depth guards (spec.md §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLimits {
    pub max_raw_bytes: usize,
    pub max_payload_bytes: usize,
    pub max_field_bytes: usize,
    pub max_json_depth: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_raw_bytes: 1_048_576,
            max_payload_bytes: 262_144,
            max_field_bytes: 102_400,
            max_json_depth: 64,
        }
    }
}

/// How the Event Dispatcher resolves an existing session before spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    #[default]
    Fresh,
    Resume,
}

/// Per-group container parameters the Event Dispatcher needs to spawn an
/// agent: image, where to reach the request channel, and the two mounted
/// directories (spec.md §4.12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupRuntimeConfig {
    pub image: String,
    pub request_socket_address: String,
    pub state_dir: std::path::PathBuf,
    pub skills_dir: Option<std::path::PathBuf>,
    /// Credential injected via stdin, never `--env` (spec.md §4.11 step 5).
    /// Takes precedence over `oauth_token` when both are set.
    pub api_key: Option<String>,
    pub oauth_token: Option<String>,
}

/// Event Dispatcher saturation and per-group configuration (spec.md §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDispatcherConfig {
    pub max_sessions_per_group: u32,
    pub configured_groups: Vec<String>,
    pub session_policy: SessionPolicy,
    pub group_runtime: HashMap<String, GroupRuntimeConfig>,
}

impl Default for EventDispatcherConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_group: 3,
            configured_groups: Vec::new(),
            session_policy: SessionPolicy::Fresh,
            group_runtime: HashMap::new(),
        }
    }
}

/// Per-tool authorization and rate-limit overrides (spec.md §4.4, §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    /// If non-empty, only these groups may invoke the tool.
    pub allowed_groups: Vec<String>,
    pub rate_limit_override: Option<RateLimiterConfig>,
}

/// Top-level configuration assembled by the server composition root. Maps
/// directly onto a TOML document; any field may be overridden by an
/// environment variable of the form `CARAPACE_<SCREAMING_SNAKE_PATH>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CarapaceConfig {
    pub socket_dir: std::path::PathBuf,
    pub audit_dir: std::path::PathBuf,
    /// If set, the server polls this directory every 500 ms for `*.json`
    /// files, dispatches each as an event envelope, and unlinks it
    /// (spec.md §4.14 step 10).
    pub prompt_watch_dir: Option<std::path::PathBuf>,
    pub request_channel: RequestChannelConfig,
    pub lifecycle: LifecycleConfig,
    pub rate_limiter: RateLimiterConfig,
    pub message_limits: MessageLimits,
    pub event_dispatcher: EventDispatcherConfig,
    pub tool_policies: HashMap<String, ToolPolicy>,
}

impl Default for CarapaceConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::path::PathBuf::from("/tmp/carapace/sockets"),
            audit_dir: std::path::PathBuf::from("/tmp/carapace/audit"),
            prompt_watch_dir: None,
            request_channel: RequestChannelConfig::default(),
            lifecycle: LifecycleConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            message_limits: MessageLimits::default(),
            event_dispatcher: EventDispatcherConfig::default(),
            tool_policies: HashMap::new(),
        }
    }
}

impl CarapaceConfig {
    /// Parse a TOML document. Unknown top-level keys are rejected to catch
    /// typos in operator-authored config files early.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `CARAPACE_SOCKET_DIR` / `CARAPACE_AUDIT_DIR` environment
    /// overrides on top of a parsed config, the two paths an operator is
    /// most likely to need to redirect per-deployment.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("CARAPACE_SOCKET_DIR") {
            self.socket_dir = std::path::PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CARAPACE_AUDIT_DIR") {
            self.audit_dir = std::path::PathBuf::from(dir);
        }
        self
    }
}

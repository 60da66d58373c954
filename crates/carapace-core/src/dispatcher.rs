//! Event Dispatcher (spec.md §4.11): turns inbound `message.inbound` /
//! `task.triggered` events into spawned or resumed agent containers.
//!
//! Decision table, in order:
//! 1. Unknown topic -> dropped.
//! 2. `group` not in the configured group list -> rejected.
//! 3. Payload fails the topic's schema -> rejected.
//! 4. Group already at `maxSessionsPerGroup` -> dropped ("saturated").
//! 5. Otherwise spawn (fresh policy, or resume policy with no live session)
//!    or reuse the group's existing running session (resume policy with one
//!    already live).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use carapace_containers::{ContainerLifecycleManager, SpawnRequest};
use carapace_types::Envelope;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{EventDispatcherConfig, SessionPolicy};
use crate::pipeline::schema;
use crate::session::SessionManager;

const TOPIC_MESSAGE_INBOUND: &str = "message.inbound";
const TOPIC_TASK_TRIGGERED: &str = "task.triggered";

fn message_inbound_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "channel": {"type": "string"},
            "sender": {"type": "string"},
            "content_type": {"type": "string"},
            "body": {"type": "string"},
            "metadata": {"type": "object"}
        },
        "required": ["channel", "sender", "content_type", "body"],
        "additionalProperties": false
    })
}

fn task_triggered_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "string"},
            "trigger": {"type": "string"},
            "payload": {"type": "object"}
        },
        "required": ["task_id", "trigger"],
        "additionalProperties": false
    })
}

/// External, out-of-scope session-id persistence interface (spec.md §1):
/// the dispatcher reads/writes through this but never owns storage.
#[async_trait]
pub trait SessionIdStore: Send + Sync {
    async fn save(&self, group: &str, session_id: &str);
    async fn get_latest(&self, group: &str) -> Option<String>;
}

/// In-memory [`SessionIdStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct InMemorySessionIdStore {
    latest: RwLock<HashMap<String, String>>,
}

impl InMemorySessionIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionIdStore for InMemorySessionIdStore {
    async fn save(&self, group: &str, session_id: &str) {
        self.latest
            .write()
            .await
            .insert(group.to_string(), session_id.to_string());
    }

    async fn get_latest(&self, group: &str) -> Option<String> {
        self.latest.read().await.get(group).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Spawned { group: String, session_id: String },
    Reused { group: String, session_id: String },
    Dropped { reason: String },
    Rejected { reason: String },
    Error { reason: String },
}

pub struct EventDispatcher {
    config: EventDispatcherConfig,
    lifecycle: Arc<ContainerLifecycleManager>,
    sessions: Arc<SessionManager>,
    session_store: Arc<dyn SessionIdStore>,
}

impl EventDispatcher {
    pub fn new(
        config: EventDispatcherConfig,
        lifecycle: Arc<ContainerLifecycleManager>,
        sessions: Arc<SessionManager>,
        session_store: Arc<dyn SessionIdStore>,
    ) -> Self {
        Self {
            config,
            lifecycle,
            sessions,
            session_store,
        }
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let schema = match envelope.topic.as_str() {
            TOPIC_MESSAGE_INBOUND => message_inbound_schema(),
            TOPIC_TASK_TRIGGERED => task_triggered_schema(),
            other => {
                return DispatchOutcome::Dropped {
                    reason: format!("unknown topic '{other}'"),
                }
            }
        };

        let group = &envelope.group;
        if !self.config.configured_groups.iter().any(|g| g == group) {
            return DispatchOutcome::Rejected {
                reason: format!("group '{group}' is not configured"),
            };
        }

        let arguments = envelope
            .payload
            .arguments
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Object(Default::default()));
        if let Err(violation) = schema::validate(&schema, &arguments) {
            return DispatchOutcome::Rejected {
                reason: format!("schema violation at {}: {}", violation.field_path, violation.reason),
            };
        }

        if self.sessions.count_for_group(group).await >= self.config.max_sessions_per_group as usize {
            return DispatchOutcome::Dropped {
                reason: "saturated".to_string(),
            };
        }

        if self.config.session_policy == SessionPolicy::Resume {
            if let Some(existing) = self.sessions.first_for_group(group).await {
                info!(group, session_id = %existing.session_id, "reusing existing session");
                return DispatchOutcome::Reused {
                    group: group.clone(),
                    session_id: existing.session_id,
                };
            }
        }

        self.spawn_for_group(group).await
    }

    async fn spawn_for_group(&self, group: &str) -> DispatchOutcome {
        let Some(runtime) = self.config.group_runtime.get(group) else {
            return DispatchOutcome::Error {
                reason: format!("no runtime configuration for group '{group}'"),
            };
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut env = HashMap::new();
        if self.config.session_policy == SessionPolicy::Resume {
            if let Some(resume_id) = self.session_store.get_latest(group).await {
                env.insert("RESUME_SESSION".to_string(), resume_id);
            }
        }

        let request = SpawnRequest {
            group: group.to_string(),
            image: runtime.image.clone(),
            request_socket_address: runtime.request_socket_address.clone(),
            state_dir: runtime.state_dir.clone(),
            skills_dir: runtime.skills_dir.clone(),
            stdin_data: credential_stdin(runtime),
            env,
            security: Default::default(),
            api_mode: None,
        };

        match self.lifecycle.spawn(session_id.clone(), request).await {
            Ok(outcome) => {
                self.sessions
                    .register(
                        outcome.session_id.clone(),
                        outcome.session_id.clone(),
                        group.to_string(),
                        outcome.connection_identity,
                    )
                    .await;
                self.session_store.save(group, &outcome.session_id).await;
                DispatchOutcome::Spawned {
                    group: group.to_string(),
                    session_id: outcome.session_id,
                }
            }
            Err(err) => {
                warn!(group, error = %err, "spawn failed during dispatch");
                DispatchOutcome::Error {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Assemble the `KEY=VALUE` pairs injected into the container's stdin
/// (spec.md §4.11 step 5, never as `--env` arguments that would leak into
/// `inspect` output). An API key takes precedence over an OAuth token when
/// a group configures both (DESIGN.md open question #2).
fn credential_stdin(runtime: &crate::config::GroupRuntimeConfig) -> HashMap<String, String> {
    let mut stdin_data = HashMap::new();
    if let Some(api_key) = &runtime.api_key {
        stdin_data.insert("API_KEY".to_string(), api_key.clone());
    } else if let Some(oauth_token) = &runtime.oauth_token {
        stdin_data.insert("OAUTH_TOKEN".to_string(), oauth_token.clone());
    }
    stdin_data
}

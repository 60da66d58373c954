//! Session Manager (spec.md §4.3).
//!
//! Maintains three reverse indexes onto a single [`SessionRecord`], keeping
//! the session the sole holder of the `connectionIdentity -> group` binding.
//! Writes are rare (startup, container lifecycle events); reads are the
//! Request Channel's hot path, so this uses a single `RwLock` over all three
//! maps rather than splitting locks per index.

use std::collections::HashMap;

use carapace_types::{ConnectionIdentity, SessionRecord};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no such session: {0}")]
    NotFound(String),
}

struct Indexes {
    by_session_id: HashMap<String, SessionRecord>,
    by_container_id: HashMap<String, String>,
    by_connection_identity: HashMap<ConnectionIdentity, String>,
}

/// Owns every session record in the process. `group` is immutable once a
/// session is created: nothing in this crate ever mutates it in place.
pub struct SessionManager {
    indexes: RwLock<Indexes>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes {
                by_session_id: HashMap::new(),
                by_container_id: HashMap::new(),
                by_connection_identity: HashMap::new(),
            }),
        }
    }

    /// Assign a fresh session id, insert into all three indexes atomically,
    /// and return the new record.
    pub async fn create(
        &self,
        container_id: String,
        group: String,
        connection_identity: ConnectionIdentity,
    ) -> SessionRecord {
        self.register(Uuid::new_v4().to_string(), container_id, group, connection_identity)
            .await
    }

    /// Like [`Self::create`], but with a session id chosen by the caller --
    /// used when the id must match one already minted elsewhere (the
    /// Container Lifecycle Manager's spawn outcome).
    pub async fn register(
        &self,
        session_id: String,
        container_id: String,
        group: String,
        connection_identity: ConnectionIdentity,
    ) -> SessionRecord {
        let record = SessionRecord {
            session_id: session_id.clone(),
            container_id: container_id.clone(),
            group,
            connection_identity: connection_identity.clone(),
            started_at: Utc::now(),
        };

        let mut indexes = self.indexes.write().await;
        indexes.by_container_id.insert(container_id, session_id.clone());
        indexes
            .by_connection_identity
            .insert(connection_identity, session_id.clone());
        indexes.by_session_id.insert(session_id, record.clone());
        record
    }

    /// Any session currently belonging to `group`, used by the Event
    /// Dispatcher's "resume" policy to avoid spawning a duplicate container.
    pub async fn first_for_group(&self, group: &str) -> Option<SessionRecord> {
        self.indexes
            .read()
            .await
            .by_session_id
            .values()
            .find(|r| r.group == group)
            .cloned()
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> Option<SessionRecord> {
        self.indexes.read().await.by_session_id.get(session_id).cloned()
    }

    pub async fn get_by_container_id(&self, container_id: &str) -> Option<SessionRecord> {
        let indexes = self.indexes.read().await;
        let session_id = indexes.by_container_id.get(container_id)?;
        indexes.by_session_id.get(session_id).cloned()
    }

    /// Hot-path lookup from the Request Channel: resolve a wire message's
    /// origin connection identity back to its session (and hence its
    /// trusted `group`/`containerId`).
    pub async fn get_by_connection_identity(
        &self,
        identity: &ConnectionIdentity,
    ) -> Option<SessionRecord> {
        let indexes = self.indexes.read().await;
        let session_id = indexes.by_connection_identity.get(identity)?;
        indexes.by_session_id.get(session_id).cloned()
    }

    /// Remove a session from all three indexes.
    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let mut indexes = self.indexes.write().await;
        let record = indexes
            .by_session_id
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        indexes.by_container_id.remove(&record.container_id);
        indexes
            .by_connection_identity
            .remove(&record.connection_identity);
        Ok(())
    }

    pub async fn count_for_group(&self, group: &str) -> usize {
        self.indexes
            .read()
            .await
            .by_session_id
            .values()
            .filter(|r| r.group == group)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.indexes.read().await.by_session_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

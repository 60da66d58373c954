//! Socket Provisioner (spec.md §4.2).
//!
//! Issues `<dir>/<sessionId>-request.sock` and `<dir>/<sessionId>-events.sock`
//! paths under a private (`0700`) directory, validates session IDs, and
//! cleans up stale socket files left behind by a previous process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

const MAX_SESSION_ID_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("session id already provisioned: {0}")]
    AlreadyTracked(String),
    #[error("socket file already exists: {}", .0.display())]
    FileExists(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate a session identifier: `^[A-Za-z0-9][A-Za-z0-9._-]*$`, no path
/// separators, reasonable length. Rejects the values a path-traversal or
/// directory-escape attempt would need.
pub fn validate_session_id(id: &str) -> Result<(), ProvisionerError> {
    let mut chars = id.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN || !first_ok || !rest_ok {
        return Err(ProvisionerError::InvalidSessionId(id.to_string()));
    }
    if id.contains("..") {
        return Err(ProvisionerError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// The pair of socket paths allocated to one session.
#[derive(Debug, Clone)]
pub struct SessionSockets {
    pub request_path: PathBuf,
    pub events_path: PathBuf,
}

/// Allocates and releases per-session socket paths under one private
/// directory. `tracked` holds every session id this process has
/// provisioned; it is the live set `cleanupStale` compares the directory
/// listing against.
pub struct SocketProvisioner {
    dir: PathBuf,
    tracked: Mutex<HashSet<String>>,
}

impl SocketProvisioner {
    /// Create a provisioner rooted at `dir`, creating it with mode `0700`
    /// if it does not already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ProvisionerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        set_private_mode(&dir)?;
        Ok(Self {
            dir,
            tracked: Mutex::new(HashSet::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths_for(&self, session_id: &str) -> SessionSockets {
        SessionSockets {
            request_path: self.dir.join(format!("{session_id}-request.sock")),
            events_path: self.dir.join(format!("{session_id}-events.sock")),
        }
    }

    /// Allocate socket paths for `session_id`. Fails if the id is malformed,
    /// already tracked, or either path already exists on disk.
    pub fn provision(&self, session_id: &str) -> Result<SessionSockets, ProvisionerError> {
        validate_session_id(session_id)?;

        let mut tracked = self.tracked.lock().unwrap();
        if tracked.contains(session_id) {
            return Err(ProvisionerError::AlreadyTracked(session_id.to_string()));
        }

        let sockets = self.paths_for(session_id);
        if sockets.request_path.exists() {
            return Err(ProvisionerError::FileExists(sockets.request_path));
        }
        if sockets.events_path.exists() {
            return Err(ProvisionerError::FileExists(sockets.events_path));
        }

        tracked.insert(session_id.to_string());
        debug!(session_id, "provisioned sockets");
        Ok(sockets)
    }

    /// Best-effort unlink of both socket files, and forget the session.
    pub fn release(&self, session_id: &str) {
        let sockets = self.paths_for(session_id);
        let _ = std::fs::remove_file(&sockets.request_path);
        let _ = std::fs::remove_file(&sockets.events_path);
        self.tracked.lock().unwrap().remove(session_id);
    }

    /// Scan the directory and remove any `*-request.sock` / `*-events.sock`
    /// file whose session id is in neither `active` nor the live tracking
    /// map. Idempotent: a second call with the same `active` set removes
    /// nothing further.
    pub fn cleanup_stale(&self, active: &HashSet<String>) -> Result<usize, ProvisionerError> {
        let tracked = self.tracked.lock().unwrap();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(session_id) = extract_session_id(&name) else {
                continue;
            };
            if active.contains(session_id) || tracked.contains(session_id) {
                continue;
            }
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
                warn!(session_id, "removed stale socket file");
            }
        }
        Ok(removed)
    }

    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.tracked.lock().unwrap().contains(session_id)
    }
}

fn extract_session_id(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix("-request.sock")
        .or_else(|| file_name.strip_suffix("-events.sock"))
}

#[cfg(unix)]
fn set_private_mode(dir: &Path) -> Result<(), ProvisionerError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o700);
    std::fs::set_permissions(dir, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private_mode(_dir: &Path) -> Result<(), ProvisionerError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_session_ids() {
        assert!(validate_session_id("abc123").is_ok());
        assert!(validate_session_id("a.b_c-d").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id(".hidden").is_err());
    }

    #[test]
    fn provision_then_release_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = SocketProvisioner::new(tmp.path()).unwrap();
        let sockets = provisioner.provision("sess-1").unwrap();
        assert!(sockets.request_path.ends_with("sess-1-request.sock"));
        assert!(provisioner.is_tracked("sess-1"));
        provisioner.release("sess-1");
        assert!(!provisioner.is_tracked("sess-1"));
    }

    #[test]
    fn provision_rejects_duplicate_tracked_id() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = SocketProvisioner::new(tmp.path()).unwrap();
        provisioner.provision("sess-1").unwrap();
        assert!(matches!(
            provisioner.provision("sess-1"),
            Err(ProvisionerError::AlreadyTracked(_))
        ));
    }

    #[test]
    fn provision_rejects_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = SocketProvisioner::new(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("sess-1-request.sock"), b"").unwrap();
        assert!(matches!(
            provisioner.provision("sess-1"),
            Err(ProvisionerError::FileExists(_))
        ));
    }

    #[test]
    fn cleanup_stale_removes_untracked_files_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner = SocketProvisioner::new(tmp.path()).unwrap();
        std::fs::write(tmp.path().join("orphan-request.sock"), b"").unwrap();
        std::fs::write(tmp.path().join("orphan-events.sock"), b"").unwrap();
        provisioner.provision("kept").unwrap();

        let active = HashSet::new();
        let removed_first = provisioner.cleanup_stale(&active).unwrap();
        assert_eq!(removed_first, 2);
        let removed_second = provisioner.cleanup_stale(&active).unwrap();
        assert_eq!(removed_second, 0);
        assert!(provisioner.is_tracked("kept"));
    }
}

//! Audit Log (spec.md §4.13): one append-only JSONL file per group.
//!
//! Writes go through a per-group `Mutex<File>` so concurrent appends to the
//! same group's file never interleave lines (spec.md §5 "if a concurrency
//! model with real threads is chosen, a per-group mutex is required").
//! Queries stream the file and filter in memory -- the scale target is
//! per-group grep-ability, not an index.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use carapace_types::{AuditEntry, AuditOutcome, ErrorCode};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed audit line: {0}")]
    Malformed(String),
}

pub struct AuditLog {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{group}.jsonl"))
    }

    /// Append one entry as a newline-terminated JSON line to the group's
    /// file, opening it on first use.
    pub fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut files = self.files.lock().unwrap();
        let file = match files.get_mut(&entry.group) {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path_for(&entry.group))?;
                files.entry(entry.group.clone()).or_insert(file)
            }
        };
        let mut line = serde_json::to_string(entry).expect("audit entries always serialize");
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Emit the dual before/after-normalization entries for a handler error
    /// (spec.md §4.13): same correlation, distinct `phase`.
    pub fn append_handler_error(
        &self,
        group: &str,
        source: &str,
        topic: &str,
        correlation: &str,
        raw_code: ErrorCode,
    ) -> Result<(), AuditError> {
        let before = AuditEntry::new(group, source, topic, "dispatch", AuditOutcome::Error)
            .with_correlation(correlation)
            .with_error(raw_code)
            .with_phase("before_normalization");
        self.append(&before)?;

        let after = AuditEntry::new(group, source, topic, "dispatch", AuditOutcome::Error)
            .with_correlation(correlation)
            .with_error(ErrorCode::HandlerError)
            .with_phase("after_normalization");
        self.append(&after)
    }

    fn read_entries(&self, group: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let path = self.path_for(group);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let entry: AuditEntry =
                serde_json::from_str(&line).map_err(|e| AuditError::Malformed(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn by_correlation(&self, group: &str, correlation: &str) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .read_entries(group)?
            .into_iter()
            .filter(|e| e.correlation.as_deref() == Some(correlation))
            .collect())
    }

    pub fn by_time_range(
        &self,
        group: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .read_entries(group)?
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }

    pub fn by_topic(&self, group: &str, topic: &str) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .read_entries(group)?
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect())
    }

    pub fn by_outcome(&self, group: &str, outcome: AuditOutcome) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .read_entries(group)?
            .into_iter()
            .filter(|e| e.outcome == outcome)
            .collect())
    }
}

/// Marker type naming the four query shapes this module supports, kept
/// alongside [`AuditLog`] so callers have one place to discover them.
pub struct AuditQuery;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn append_then_by_correlation_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path()).unwrap();
        let entry = AuditEntry::new("demo", "core", "tool.invoke.echo", "dispatch", AuditOutcome::Routed)
            .with_correlation("c1");
        log.append(&entry).unwrap();

        let found = log.by_correlation("demo", "c1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, "tool.invoke.echo");
    }

    #[test]
    fn entries_are_scoped_per_group_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path()).unwrap();
        log.append(&AuditEntry::new("demo", "core", "t", "dispatch", AuditOutcome::Routed))
            .unwrap();
        log.append(&AuditEntry::new("other", "core", "t", "dispatch", AuditOutcome::Routed))
            .unwrap();

        assert_eq!(log.by_topic("demo", "t").unwrap().len(), 1);
        assert_eq!(log.by_topic("other", "t").unwrap().len(), 1);
        assert!(tmp.path().join("demo.jsonl").exists());
        assert!(tmp.path().join("other.jsonl").exists());
    }

    #[test]
    fn handler_error_emits_dual_entries_sharing_correlation() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path()).unwrap();
        log.append_handler_error("demo", "core", "tool.invoke.echo", "c1", ErrorCode::Unauthorized)
            .unwrap();

        let entries = log.by_correlation("demo", "c1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase.as_deref(), Some("before_normalization"));
        assert_eq!(entries[0].error, Some(ErrorCode::Unauthorized));
        assert_eq!(entries[1].phase.as_deref(), Some("after_normalization"));
        assert_eq!(entries[1].error, Some(ErrorCode::HandlerError));
    }

    #[test]
    fn by_time_range_is_inclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path()).unwrap();
        let entry = AuditEntry::new("demo", "core", "t", "dispatch", AuditOutcome::Routed);
        let stamp = entry.timestamp;
        log.append(&entry).unwrap();

        let found = log
            .by_time_range("demo", stamp - Duration::seconds(1), stamp + Duration::seconds(1))
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn missing_group_file_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::new(tmp.path()).unwrap();
        assert!(log.by_correlation("nope", "c1").unwrap().is_empty());
    }
}

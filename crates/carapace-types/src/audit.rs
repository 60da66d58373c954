//! Audit entry type (spec.md §3 "Audit entry", §4.13).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Outcome of a pipeline stage transition, recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Routed,
    Rejected,
    Sanitized,
    Error,
}

/// One line of a group's audit JSONL file. Optional fields are omitted
/// from serialization entirely, never written as `null` (spec.md §4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub source: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    pub stage: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl AuditEntry {
    pub fn new(
        group: impl Into<String>,
        source: impl Into<String>,
        topic: impl Into<String>,
        stage: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            group: group.into(),
            source: source.into(),
            topic: topic.into(),
            correlation: None,
            stage: stage.into(),
            outcome,
            reason: None,
            field_paths: None,
            error: None,
            phase: None,
        }
    }

    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_field_paths(mut self, paths: Vec<String>) -> Self {
        self.field_paths = Some(paths);
        self
    }

    pub fn with_error(mut self, code: ErrorCode) -> Self {
        self.error = Some(code);
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

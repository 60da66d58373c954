//! Error types for the Carapace broker.
//!
//! [`CarapaceError`] is the internal, non-wire error type used by Rust code
//! across the workspace. [`ErrorCode`] and [`ErrorPayload`] are the distinct,
//! wire-facing shapes that go into a Response envelope's `payload.error` --
//! kept separate from [`CarapaceError`] on purpose, so that internal
//! variants (`Io`, `Json`, ...) can never leak onto the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level internal error type for the Carapace broker.
///
/// Variants are grouped into recoverable (retry-worthy) and fatal
/// categories to guide callers on whether retrying makes sense.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CarapaceError {
    // ── Recoverable ──────────────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
    },

    /// The rate limiter denied a request.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait time in milliseconds before retrying.
        retry_after_ms: u64,
    },

    // ── Fatal ────────────────────────────────────────────────────────
    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {reason}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// A security boundary was violated (path traversal, oversized input,
    /// identity spoofing attempt, etc.)
    #[error("security violation: {reason}")]
    SecurityViolation {
        /// What policy was violated.
        reason: String,
    },

    /// A named resource (session, tool, correlation) was not found.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up and missing.
        what: String,
    },

    /// A named resource already exists where uniqueness is required.
    #[error("already exists: {what}")]
    AlreadyExists {
        /// What was being created that already exists.
        what: String,
    },

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for plugin/handler failures that don't fit other variants.
    #[error("plugin error: {0}")]
    Plugin(String),
}

/// Wire-facing error code. Reserved pipeline codes cannot be issued by
/// handlers; the pipeline rewrites any handler-raised reserved code to
/// [`ErrorCode::HandlerError`] before it reaches the wire (spec invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ── Pipeline-reserved ────────────────────────────────────────────
    UnknownTool,
    ValidationFailed,
    Unauthorized,
    RateLimited,
    ConfirmationDenied,
    ConfirmationTimeout,
    MessageTooLarge,

    // ── Handler-reported ─────────────────────────────────────────────
    HandlerError,
    PluginError,
    PluginUnavailable,

    // ── Transport-reported ───────────────────────────────────────────
    Timeout,
    Internal,
    ConfigurationError,
}

impl ErrorCode {
    /// Whether this code is retriable by default (spec.md §6).
    pub fn default_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::ConfirmationTimeout
                | ErrorCode::Timeout
                | ErrorCode::PluginUnavailable
        )
    }

    /// The set of codes a pipeline stage may emit; handlers raising one of
    /// these are rewritten to [`ErrorCode::HandlerError`] at dispatch.
    pub fn is_pipeline_reserved(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTool
                | ErrorCode::ValidationFailed
                | ErrorCode::Unauthorized
                | ErrorCode::RateLimited
                | ErrorCode::ConfirmationDenied
                | ErrorCode::ConfirmationTimeout
                | ErrorCode::MessageTooLarge
        )
    }
}

/// The error payload placed at `Response.payload.error` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ErrorPayload {
    /// Construct a payload with the code's default retriability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retriable: code.default_retriable(),
            code,
            message: message.into(),
            retry_after_ms: None,
            field: None,
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self.retriable = true;
        self
    }
}

pub type Result<T> = std::result::Result<T, CarapaceError>;

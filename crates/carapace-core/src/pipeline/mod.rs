//! Request Pipeline (spec.md §4.8): the six stages that turn an untrusted
//! [`WireMessage`] into a Response [`Envelope`]. Stages 1-5 are
//! synchronous and total; stage 6 awaits the tool handler. Each stage
//! returns a tagged sum type -- [`StageOutcome::Continue`] or
//! [`StageOutcome::Fail`] -- rather than throwing, so a caller matches on
//! the result instead of catching exceptions (spec.md §9).

pub mod confirmation;
pub mod rate_limiter;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use carapace_types::{Envelope, ErrorCode, ErrorPayload, SessionRecord, WireMessage};
use serde_json::Value;
use tracing::info;

use crate::config::{CarapaceConfig, ToolPolicy};
use crate::limits::{self, LimitViolation};
use crate::security::Sanitizer;
use crate::tools::{ToolCatalog, ToolError};
use confirmation::{ConfirmationGate, ConfirmationOutcome};
use rate_limiter::{RateLimitDecision, RateLimiter};

/// A stage's result: either the refined state to hand to the next stage,
/// or a terminal failure that short-circuits the rest of the pipeline.
pub enum StageOutcome<T> {
    Continue(T),
    Fail(ErrorPayload),
}

/// Everything the Request Pipeline needs, each piece owned elsewhere and
/// referenced here (spec.md §3: "Ownership: the Server owns ..."). Stages
/// themselves hold no state of their own.
pub struct Pipeline {
    pub catalog: Arc<ToolCatalog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub confirmation: Arc<ConfirmationGate>,
    pub sanitizer: Arc<Sanitizer>,
    pub tool_policies: std::collections::HashMap<String, ToolPolicy>,
    pub message_limits: crate::config::MessageLimits,
    pub handler_timeout: Duration,
}

impl Pipeline {
    pub fn new(config: &CarapaceConfig, catalog: Arc<ToolCatalog>) -> Self {
        Self {
            catalog,
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limiter)),
            confirmation: Arc::new(ConfirmationGate::default()),
            sanitizer: Arc::new(Sanitizer::new()),
            tool_policies: config.tool_policies.clone(),
            message_limits: config.message_limits,
            handler_timeout: Duration::from_secs(30),
        }
    }

    /// Run all six stages against one raw inbound frame. Always returns a
    /// Response envelope -- success and failure are both represented in
    /// its `payload`, never as a Rust `Err`.
    pub async fn run(&self, raw: &[u8], session: &SessionRecord) -> (Envelope, Vec<AuditStep>) {
        let mut audit = Vec::new();

        if let Err(violation) = limits::check_raw_size(raw, &self.message_limits) {
            return (
                self.limits_violation_envelope(session, raw, violation, &mut audit),
                audit,
            );
        }
        if let Err(violation) = limits::check_json_depth(raw, &self.message_limits) {
            return (
                self.limits_violation_envelope(session, raw, violation, &mut audit),
                audit,
            );
        }

        let stage1 = self.stage1_construct(raw, session);
        let envelope = match stage1 {
            StageOutcome::Continue(envelope) => {
                audit.push(AuditStep::ok("construct"));
                envelope
            }
            StageOutcome::Fail(error) => {
                audit.push(AuditStep::rejected("construct", &error));
                return (
                    self.rejected_response_without_request(session, raw, error),
                    audit,
                );
            }
        };

        if let Err(violation) =
            limits::check_payload_size(&wrap_arguments(&envelope), &self.message_limits)
                .and_then(|_| limits::check_field_sizes(&wrap_arguments(&envelope), &self.message_limits))
        {
            let error = limit_violation_to_error(violation);
            audit.push(AuditStep::rejected("construct", &error));
            return (Envelope::new_response_err(&envelope, error), audit);
        }

        let (tool_name, declaration, handler) = match self.stage2_topic(&envelope) {
            StageOutcome::Continue(v) => {
                audit.push(AuditStep::ok("topic"));
                v
            }
            StageOutcome::Fail(error) => {
                audit.push(AuditStep::rejected("topic", &error));
                return (Envelope::new_response_err(&envelope, error), audit);
            }
        };

        if let StageOutcome::Fail(error) = self.stage3_arguments(&envelope, &declaration) {
            audit.push(AuditStep::rejected("payload", &error));
            return (Envelope::new_response_err(&envelope, error), audit);
        }
        audit.push(AuditStep::ok("payload"));

        if let StageOutcome::Fail(error) =
            self.stage4_authorize_and_rate_limit(&envelope, &tool_name, &declaration)
        {
            audit.push(AuditStep::rejected("authorize", &error));
            return (Envelope::new_response_err(&envelope, error), audit);
        }
        audit.push(AuditStep::ok("authorize"));

        if let StageOutcome::Fail(error) = self.stage5_confirm(&envelope, &declaration) {
            audit.push(AuditStep::rejected("confirm", &error));
            return (Envelope::new_response_err(&envelope, error), audit);
        }
        audit.push(AuditStep::ok("confirm"));

        let (response, raw_handler_code) = self.stage6_dispatch(&envelope, handler.as_ref()).await;
        match (&response.payload.error, raw_handler_code) {
            (Some(error), Some(raw)) => audit.push(AuditStep::handler_error(error, raw)),
            (Some(error), None) => audit.push(AuditStep::dispatch_error(error)),
            (None, _) => audit.push(AuditStep::ok("dispatch")),
        }

        let (sanitized, redacted_paths) = self.sanitize_response(response);
        if !redacted_paths.is_empty() {
            if let Some(last) = audit.last_mut() {
                if last.stage == "dispatch" && last.outcome == "routed" {
                    last.outcome = "sanitized";
                    last.field_paths = Some(redacted_paths);
                }
            }
        }
        (sanitized, audit)
    }

    // ── Stage 1: Construct envelope ─────────────────────────────────────

    fn stage1_construct(&self, raw: &[u8], session: &SessionRecord) -> StageOutcome<Envelope> {
        match WireMessage::parse(raw) {
            Ok(wire) => StageOutcome::Continue(Envelope::new_request(
                &wire,
                session.container_id.clone(),
                session.group.clone(),
            )),
            Err(err) => StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::ValidationFailed, err.to_string())
                    .with_stage("construct"),
            ),
        }
    }

    // ── Stage 2: Topic resolution ────────────────────────────────────────

    fn stage2_topic(
        &self,
        envelope: &Envelope,
    ) -> StageOutcome<(String, carapace_types::ToolDeclaration, Arc<dyn crate::tools::ToolHandler>)>
    {
        let Some(name) = envelope.topic.strip_prefix("tool.invoke.") else {
            return StageOutcome::Fail(
                ErrorPayload::new(
                    ErrorCode::UnknownTool,
                    format!("malformed topic: {}", envelope.topic),
                )
                .with_stage("topic"),
            );
        };
        if name.is_empty() {
            return StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::UnknownTool, "empty tool name").with_stage("topic"),
            );
        }
        match self.catalog.get(name) {
            Some((declaration, handler)) => {
                StageOutcome::Continue((name.to_string(), declaration, handler))
            }
            None => StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::UnknownTool, format!("unknown tool: {name}"))
                    .with_stage("topic"),
            ),
        }
    }

    // ── Stage 3: Argument validation ─────────────────────────────────────

    fn stage3_arguments(
        &self,
        envelope: &Envelope,
        declaration: &carapace_types::ToolDeclaration,
    ) -> StageOutcome<()> {
        let arguments = Value::Object(envelope.payload.arguments.clone().unwrap_or_default());
        match schema::validate(&declaration.arguments_schema, &arguments) {
            Ok(()) => StageOutcome::Continue(()),
            Err(violation) => StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::ValidationFailed, violation.reason)
                    .with_stage("payload")
                    .with_field(violation.field_path),
            ),
        }
    }

    // ── Stage 4: Authorize & rate-limit ──────────────────────────────────

    fn stage4_authorize_and_rate_limit(
        &self,
        envelope: &Envelope,
        tool_name: &str,
        declaration: &carapace_types::ToolDeclaration,
    ) -> StageOutcome<()> {
        if let Some(allowed) = &declaration.allowed_groups {
            if !allowed.iter().any(|g| g == &envelope.group) {
                return StageOutcome::Fail(
                    ErrorPayload::new(
                        ErrorCode::Unauthorized,
                        format!("group '{}' is not authorized for '{tool_name}'", envelope.group),
                    )
                    .with_stage("authorize"),
                );
            }
        }

        if let Some(policy) = self.tool_policies.get(tool_name) {
            if !policy.allowed_groups.is_empty() && !policy.allowed_groups.contains(&envelope.group)
            {
                return StageOutcome::Fail(
                    ErrorPayload::new(
                        ErrorCode::Unauthorized,
                        format!("group '{}' is not authorized for '{tool_name}'", envelope.group),
                    )
                    .with_stage("authorize"),
                );
            }
            if let Some(rate_override) = policy.rate_limit_override {
                self.rate_limiter
                    .set_group_override(envelope.group.clone(), rate_override);
            }
        }

        match self.rate_limiter.check(&envelope.group, tool_name) {
            RateLimitDecision::Allow => StageOutcome::Continue(()),
            RateLimitDecision::Deny { retry_after_ms } => StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::RateLimited, "rate limit exceeded")
                    .with_stage("authorize")
                    .with_retry_after_ms(retry_after_ms),
            ),
        }
    }

    // ── Stage 5: Confirmation gate ───────────────────────────────────────

    fn stage5_confirm(
        &self,
        envelope: &Envelope,
        declaration: &carapace_types::ToolDeclaration,
    ) -> StageOutcome<()> {
        if declaration.risk_level != carapace_types::RiskLevel::High {
            return StageOutcome::Continue(());
        }
        let correlation = envelope.correlation.as_deref().unwrap_or_default();
        match self.confirmation.check(correlation) {
            ConfirmationOutcome::Approved => StageOutcome::Continue(()),
            ConfirmationOutcome::Denied => StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::ConfirmationDenied, "confirmation denied")
                    .with_stage("confirm"),
            ),
            ConfirmationOutcome::Timeout => StageOutcome::Fail(
                ErrorPayload::new(ErrorCode::ConfirmationTimeout, "confirmation timed out")
                    .with_stage("confirm"),
            ),
        }
    }

    // ── Stage 6: Dispatch ─────────────────────────────────────────────────

    /// Returns the response envelope and, for a handler-raised failure, the
    /// raw error code the handler claimed before normalization -- the Audit
    /// Log records both (spec.md §4.13).
    async fn stage6_dispatch(
        &self,
        envelope: &Envelope,
        handler: &dyn crate::tools::ToolHandler,
    ) -> (Envelope, Option<ErrorCode>) {
        let arguments = Value::Object(envelope.payload.arguments.clone().unwrap_or_default());
        let outcome = tokio::time::timeout(self.handler_timeout, handler.call(arguments)).await;

        match outcome {
            Ok(Ok(result)) => (Envelope::new_response_ok(envelope, result), None),
            Ok(Err(ToolError::Failed { message, code, retriable })) => {
                let raw = code.unwrap_or(ErrorCode::HandlerError);
                let normalized = if raw.is_pipeline_reserved() {
                    ErrorCode::HandlerError
                } else {
                    raw
                };
                let mut error = ErrorPayload::new(normalized, message).with_stage("dispatch");
                error.retriable = retriable;
                (Envelope::new_response_err(envelope, error), Some(raw))
            }
            Err(_) => (
                Envelope::new_response_err(
                    envelope,
                    ErrorPayload::new(ErrorCode::Timeout, "handler exceeded its time budget")
                        .with_stage("dispatch"),
                ),
                None,
            ),
        }
    }

    fn sanitize_response(&self, mut response: Envelope) -> (Envelope, Vec<String>) {
        let mut redacted = Vec::new();
        if let Some(result) = response.payload.result.take() {
            let (sanitized, paths) = self.sanitizer.sanitize(&result);
            if !paths.is_empty() {
                info!(paths = ?paths, "sanitized response fields");
            }
            redacted = paths;
            response.payload.result = Some(sanitized);
        }
        (response, redacted)
    }

    fn limits_violation_envelope(
        &self,
        session: &SessionRecord,
        raw: &[u8],
        violation: LimitViolation,
        audit: &mut Vec<AuditStep>,
    ) -> Envelope {
        let error = limit_violation_to_error(violation);
        audit.push(AuditStep::rejected("construct", &error));
        self.rejected_response_without_request(session, raw, error)
    }

    /// Build a Response envelope for a pre-stage1 rejection, where no
    /// Request envelope could be constructed. The correlation is still
    /// peeked out of the raw bytes on a best-effort basis (even a message
    /// rejected for carrying reserved identity fields must route back to
    /// the connection that is waiting on it -- spec.md §4.9).
    fn rejected_response_without_request(
        &self,
        session: &SessionRecord,
        raw: &[u8],
        error: ErrorPayload,
    ) -> Envelope {
        Envelope {
            id: uuid::Uuid::new_v4(),
            version: carapace_types::envelope::PROTOCOL_VERSION,
            kind: carapace_types::EnvelopeType::Response,
            topic: String::new(),
            source: "core".to_string(),
            correlation: peek_correlation(raw),
            timestamp: chrono::Utc::now(),
            group: session.group.clone(),
            payload: carapace_types::RequestResponsePayload {
                arguments: None,
                result: None,
                error: Some(error),
            },
        }
    }
}

fn wrap_arguments(envelope: &Envelope) -> Value {
    Value::Object(envelope.payload.arguments.clone().unwrap_or_default())
}

fn limit_violation_to_error(violation: LimitViolation) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::MessageTooLarge, violation.to_string()).with_stage("construct")
}

/// Best-effort extraction of the `correlation` field from raw wire bytes,
/// independent of full [`WireMessage::parse`] success. Used only to route
/// a rejection response back to the connection that sent it; never trusted
/// for anything security-relevant.
fn peek_correlation(raw: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(raw)
        .ok()?
        .as_object()?
        .get("correlation")?
        .as_str()
        .map(str::to_string)
}

/// One stage transition, handed to the Audit Log (spec.md §4.13).
pub struct AuditStep {
    pub stage: &'static str,
    pub outcome: &'static str,
    pub reason: Option<String>,
    pub field_paths: Option<Vec<String>>,
    /// `(raw, normalized)` error code pair, set only for a dispatch-stage
    /// failure a tool handler raised itself -- the pair the Audit Log's
    /// `append_handler_error` needs for its before/after-normalization
    /// entries.
    pub handler_error: Option<(ErrorCode, ErrorCode)>,
}

impl AuditStep {
    fn ok(stage: &'static str) -> Self {
        Self {
            stage,
            outcome: "routed",
            reason: None,
            field_paths: None,
            handler_error: None,
        }
    }

    fn rejected(stage: &'static str, error: &ErrorPayload) -> Self {
        Self {
            stage,
            outcome: "rejected",
            reason: Some(error.message.clone()),
            field_paths: None,
            handler_error: None,
        }
    }

    /// A dispatch-stage failure that wasn't handler-raised (e.g. a timeout).
    fn dispatch_error(error: &ErrorPayload) -> Self {
        Self {
            stage: "dispatch",
            outcome: "error",
            reason: Some(error.message.clone()),
            field_paths: None,
            handler_error: None,
        }
    }

    /// A dispatch-stage failure the tool handler itself raised.
    fn handler_error(error: &ErrorPayload, raw: ErrorCode) -> Self {
        Self {
            stage: "dispatch",
            outcome: "error",
            reason: Some(error.message.clone()),
            field_paths: None,
            handler_error: Some((raw, error.code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::intrinsic;
    use chrono::Utc;

    fn sample_session(group: &str) -> SessionRecord {
        SessionRecord {
            session_id: "s1".to_string(),
            container_id: "container-1".to_string(),
            group: group.to_string(),
            connection_identity: vec![1, 2, 3],
            started_at: Utc::now(),
        }
    }

    fn pipeline_with_echo() -> Pipeline {
        let catalog = Arc::new(ToolCatalog::new());
        catalog
            .register(
                intrinsic::echo_declaration(),
                Arc::new(intrinsic::echo_handler),
            )
            .unwrap();
        let config = CarapaceConfig {
            rate_limiter: crate::config::RateLimiterConfig {
                requests_per_minute: 600,
                burst_size: 100,
            },
            ..Default::default()
        };
        Pipeline::new(&config, catalog)
    }

    #[tokio::test]
    async fn happy_path_echoes_text() {
        let pipeline = pipeline_with_echo();
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.echo","correlation":"c1","arguments":{"text":"hi"}}"#;
        let (response, _audit) = pipeline.run(raw, &session).await;
        assert_eq!(response.payload.result, Some(serde_json::json!({"echoed": "hi"})));
        assert!(response.payload.error.is_none());
        assert_eq!(response.correlation.as_deref(), Some("c1"));
        assert_eq!(response.source, "core");
    }

    #[tokio::test]
    async fn identity_spoofing_via_group_field_is_rejected() {
        let pipeline = pipeline_with_echo();
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.echo","correlation":"c1","arguments":{"text":"hi"},"group":"admin"}"#;
        let (response, _audit) = pipeline.run(raw, &session).await;
        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let pipeline = pipeline_with_echo();
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.nope","correlation":"c1","arguments":{}}"#;
        let (response, _audit) = pipeline.run(raw, &session).await;
        assert_eq!(response.payload.error.unwrap().code, ErrorCode::UnknownTool);
    }

    #[tokio::test]
    async fn cross_group_denial_does_not_consume_rate_limit_tokens() {
        let catalog = Arc::new(ToolCatalog::new());
        let mut declaration = intrinsic::echo_declaration();
        declaration.name = "email_send".to_string();
        declaration.allowed_groups = Some(vec!["email".to_string()]);
        catalog
            .register(declaration, Arc::new(intrinsic::echo_handler))
            .unwrap();

        let mut config = CarapaceConfig::default();
        config.rate_limiter.burst_size = 1;
        config.rate_limiter.requests_per_minute = 600;
        let pipeline = Pipeline::new(&config, catalog);

        let slack_session = sample_session("slack");
        let raw = br#"{"topic":"tool.invoke.email_send","correlation":"c1","arguments":{"text":"hi"}}"#;
        for _ in 0..5 {
            let (response, _) = pipeline.run(raw, &slack_session).await;
            assert_eq!(response.payload.error.unwrap().code, ErrorCode::Unauthorized);
        }

        let email_session = sample_session("email");
        let (response, _) = pipeline.run(raw, &email_session).await;
        assert!(response.payload.error.is_none());
    }

    #[tokio::test]
    async fn rate_limit_boundary_allows_burst_then_denies() {
        let catalog = Arc::new(ToolCatalog::new());
        catalog
            .register(intrinsic::echo_declaration(), Arc::new(intrinsic::echo_handler))
            .unwrap();
        let mut config = CarapaceConfig::default();
        config.rate_limiter.burst_size = 3;
        config.rate_limiter.requests_per_minute = 60;
        let pipeline = Pipeline::new(&config, catalog);
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.echo","correlation":"c1","arguments":{"text":"hi"}}"#;

        for _ in 0..3 {
            let (response, _) = pipeline.run(raw, &session).await;
            assert!(response.payload.error.is_none());
        }
        let (response, _) = pipeline.run(raw, &session).await;
        let error = response.payload.error.unwrap();
        assert_eq!(error.code, ErrorCode::RateLimited);
        assert!(error.retry_after_ms.unwrap() > 0);
        assert!(error.retriable);
    }

    #[tokio::test]
    async fn credential_redaction_scrubs_dsn_but_not_notes() {
        let catalog = Arc::new(ToolCatalog::new());
        let mut declaration = intrinsic::echo_declaration();
        declaration.name = "leaky".to_string();
        declaration.arguments_schema = serde_json::json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {}
        });
        catalog
            .register(
                declaration,
                Arc::new(|_arguments: Value| async move {
                    Ok(serde_json::json!({"dsn": "postgres://u:pw@h/db", "notes": "ok"}))
                }),
            )
            .unwrap();
        let mut config = CarapaceConfig::default();
        config.rate_limiter.requests_per_minute = 600;
        config.rate_limiter.burst_size = 100;
        let pipeline = Pipeline::new(&config, catalog);
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.leaky","correlation":"c1","arguments":{}}"#;
        let (response, audit) = pipeline.run(raw, &session).await;
        let result = response.payload.result.unwrap();
        assert_eq!(result["dsn"], serde_json::json!("[REDACTED]"));
        assert_eq!(result["notes"], serde_json::json!("ok"));

        let dispatch_step = audit.iter().find(|s| s.stage == "dispatch").unwrap();
        assert_eq!(dispatch_step.outcome, "sanitized");
        assert_eq!(dispatch_step.field_paths.as_deref(), Some(&["/dsn".to_string()][..]));
    }

    #[tokio::test]
    async fn high_risk_tool_without_confirmation_is_denied() {
        let catalog = Arc::new(ToolCatalog::new());
        let mut declaration = intrinsic::echo_declaration();
        declaration.name = "dangerous".to_string();
        declaration.risk_level = carapace_types::RiskLevel::High;
        catalog
            .register(declaration, Arc::new(intrinsic::echo_handler))
            .unwrap();
        let mut config = CarapaceConfig::default();
        config.rate_limiter.requests_per_minute = 600;
        config.rate_limiter.burst_size = 100;
        let pipeline = Pipeline::new(&config, catalog);
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.dangerous","correlation":"c1","arguments":{"text":"hi"}}"#;
        let (response, _) = pipeline.run(raw, &session).await;
        assert_eq!(
            response.payload.error.unwrap().code,
            ErrorCode::ConfirmationDenied
        );
    }

    #[tokio::test]
    async fn high_risk_tool_with_confirmation_dispatches() {
        let catalog = Arc::new(ToolCatalog::new());
        let mut declaration = intrinsic::echo_declaration();
        declaration.name = "dangerous".to_string();
        declaration.risk_level = carapace_types::RiskLevel::High;
        catalog
            .register(declaration, Arc::new(intrinsic::echo_handler))
            .unwrap();
        let mut config = CarapaceConfig::default();
        config.rate_limiter.requests_per_minute = 600;
        config.rate_limiter.burst_size = 100;
        let pipeline = Pipeline::new(&config, catalog);
        pipeline.confirmation.request("c1");
        pipeline.confirmation.approve("c1");
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.dangerous","correlation":"c1","arguments":{"text":"hi"}}"#;
        let (response, _) = pipeline.run(raw, &session).await;
        assert!(response.payload.error.is_none());
    }

    #[tokio::test]
    async fn handler_raised_reserved_code_is_normalized_to_handler_error() {
        let catalog = Arc::new(ToolCatalog::new());
        let mut declaration = intrinsic::echo_declaration();
        declaration.name = "spoofer".to_string();
        catalog
            .register(
                declaration,
                Arc::new(|_arguments: Value| async move {
                    Err(ToolError::with_code("nope", ErrorCode::Unauthorized))
                }),
            )
            .unwrap();
        let mut config = CarapaceConfig::default();
        config.rate_limiter.requests_per_minute = 600;
        config.rate_limiter.burst_size = 100;
        let pipeline = Pipeline::new(&config, catalog);
        let session = sample_session("demo");
        let raw = br#"{"topic":"tool.invoke.spoofer","correlation":"c1","arguments":{"text":"hi"}}"#;
        let (response, audit) = pipeline.run(raw, &session).await;
        assert_eq!(response.payload.error.unwrap().code, ErrorCode::HandlerError);

        let dispatch_step = audit.iter().find(|s| s.stage == "dispatch").unwrap();
        assert_eq!(dispatch_step.outcome, "error");
        assert_eq!(
            dispatch_step.handler_error,
            Some((ErrorCode::Unauthorized, ErrorCode::HandlerError))
        );
    }
}

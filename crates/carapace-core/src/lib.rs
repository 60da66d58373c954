//! # carapace-core
//!
//! Request pipeline, session registry, socket provisioning, rate limiter,
//! confirmation gate, and response sanitizer for the Carapace broker. The
//! Event Bus / Request Channel transport plumbing, Event Dispatcher, and
//! Audit Log live in this crate too; the container runtime lives in
//! `carapace-containers` and the composition root in `carapace-server`.

pub mod audit;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod eventbus;
pub mod limits;
pub mod pipeline;
pub mod security;
pub mod session;
pub mod socket;
pub mod tools;

pub use audit::{AuditError, AuditLog, AuditQuery};
pub use channel::{RequestChannel, RequestChannelError, TimeoutHandler};
pub use config::CarapaceConfig;
pub use dispatcher::{DispatchOutcome, EventDispatcher, InMemorySessionIdStore, SessionIdStore};
pub use eventbus::{EventBus, EventBusError, Subscription};
pub use limits::LimitViolation;
pub use pipeline::{AuditStep, Pipeline, StageOutcome};
pub use security::Sanitizer;
pub use session::{SessionError, SessionManager};
pub use socket::{ProvisionerError, SessionSockets, SocketProvisioner};
pub use tools::{CatalogError, ToolCatalog, ToolError, ToolHandler};

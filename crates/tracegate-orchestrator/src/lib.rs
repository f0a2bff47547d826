#![forbid(unsafe_code)]
//! Deadline-bound request orchestration.
//!
//! Every request runs its handler as a separate task. The handler reports
//! one terminal outcome and any number of warnings through its
//! [`ExecutionContext`]; the [`Orchestrator`] races that against the route's
//! deadline, settles the storage transaction and serializes failures at the
//! configured [`DisclosureLevel`].

mod config;
mod context;
mod orchestrator;
mod outcome;
mod route;
mod telemetry;
mod transaction;

pub use config::{
    ConfigError, ConfigHandle, OrchestratorConfig, DEFAULT_AUTHENTICATION_TIMEOUT,
    DEFAULT_GRACE_WINDOW, DEFAULT_REQUEST_TIMEOUT,
};
pub use context::{ExecutionContext, Reply, ReplyBody};
pub use orchestrator::Orchestrator;
pub use outcome::{Outcome, OutcomeKind, Resolution, ResolutionBody, REQUEST_ID_HEADER};
pub use route::{RouteSpec, RouteTimeout};
pub use telemetry::{OrchestratorTelemetry, TelemetrySnapshot};
pub use tracegate_trace::{DisclosureLevel, ErrorTrace};
pub use transaction::{
    NoStorage, NoTransaction, StorageTransaction, TransactionCoordinator, TransactionSource,
};

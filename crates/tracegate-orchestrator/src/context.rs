//! The per-request handle given to handlers.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracegate_trace::{DisclosureLevel, ErrorTrace};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Json(Map<String, Value>),
    File { name: String, bytes: Vec<u8> },
}

/// A successful handler result.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    status: StatusCode,
    body: ReplyBody,
}

impl Reply {
    /// `{"status": "ok"}`, for handlers with nothing to return.
    #[must_use]
    pub fn ok() -> Self {
        let mut fields = Map::new();
        fields.insert("status".to_string(), Value::String("ok".to_string()));
        Self::json(fields)
    }

    #[must_use]
    pub fn json(fields: Map<String, Value>) -> Self {
        Self { status: StatusCode::OK, body: ReplyBody::Json(fields) }
    }

    /// Serializes `payload`, which must serialize to a JSON object.
    ///
    /// # Errors
    /// Returns an internal-failure trace when serialization fails or the
    /// payload is not an object.
    pub fn from_serializable<T>(payload: &T) -> Result<Self, ErrorTrace>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(payload) {
            Ok(Value::Object(fields)) => Ok(Self::json(fields)),
            Ok(other) => Err(ErrorTrace::new()
                .append(
                    DisclosureLevel::Debug,
                    format!("reply payload serialized to a non-object: {other}"),
                )
                .append(DisclosureLevel::Plain, "Could not build response")),
            Err(err) => Err(ErrorTrace::new()
                .append_error(DisclosureLevel::Debug, &err)
                .append(DisclosureLevel::Plain, "Could not build response")),
        }
    }

    /// A download served as an attachment named `name`.
    #[must_use]
    pub fn file(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { status: StatusCode::OK, body: ReplyBody::File { name: name.into(), bytes } }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    pub(crate) fn into_parts(self) -> (StatusCode, ReplyBody) {
        (self.status, self.body)
    }
}

#[derive(Debug)]
pub(crate) enum Terminal {
    Succeeded(Reply),
    Failed(ErrorTrace),
}

pub(crate) struct Signals {
    pub(crate) terminal: mpsc::Receiver<Terminal>,
    pub(crate) warnings: mpsc::UnboundedReceiver<ErrorTrace>,
}

pub(crate) struct ContextParts<T> {
    pub(crate) route: &'static str,
    pub(crate) request_id: Ulid,
    pub(crate) deadline: Instant,
    pub(crate) cancellation: CancellationToken,
    pub(crate) transaction: Option<Arc<T>>,
    pub(crate) principal: Option<String>,
}

struct Shared<T> {
    route: &'static str,
    request_id: Ulid,
    deadline: Instant,
    cancellation: CancellationToken,
    transaction: Option<Arc<T>>,
    principal: Option<String>,
    terminal: Mutex<Option<mpsc::Sender<Terminal>>>,
    warnings: mpsc::UnboundedSender<ErrorTrace>,
}

/// Everything a handler may use while serving one request.
///
/// A handler must report exactly one terminal outcome through
/// [`ExecutionContext::succeed`] or [`ExecutionContext::fail`] and may report
/// any number of warnings before that. Warnings sent after the terminal
/// outcome are not guaranteed to reach the response.
pub struct ExecutionContext<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ExecutionContext<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> std::fmt::Debug for ExecutionContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("route", &self.shared.route)
            .field("request_id", &self.shared.request_id)
            .field("deadline", &self.shared.deadline)
            .field("has_transaction", &self.shared.transaction.is_some())
            .field("principal", &self.shared.principal)
            .finish_non_exhaustive()
    }
}

impl<T> ExecutionContext<T> {
    pub(crate) fn new(parts: ContextParts<T>) -> (Self, Signals) {
        // Capacity one: at most one terminal signal is ever sent.
        let (terminal_tx, terminal_rx) = mpsc::channel(1);
        let (warnings_tx, warnings_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            route: parts.route,
            request_id: parts.request_id,
            deadline: parts.deadline,
            cancellation: parts.cancellation,
            transaction: parts.transaction,
            principal: parts.principal,
            terminal: Mutex::new(Some(terminal_tx)),
            warnings: warnings_tx,
        };
        (
            Self { shared: Arc::new(shared) },
            Signals { terminal: terminal_rx, warnings: warnings_rx },
        )
    }

    #[must_use]
    pub fn route(&self) -> &'static str {
        self.shared.route
    }

    #[must_use]
    pub fn request_id(&self) -> Ulid {
        self.shared.request_id
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.shared.deadline
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.shared.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancellation.is_cancelled() || Instant::now() >= self.shared.deadline
    }

    /// Resolves once the deadline passes or the request is cancelled for
    /// any other reason. Downstream calls should be raced against this.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.shared.cancellation.cancelled() => {}
            () = tokio::time::sleep_until(self.shared.deadline) => {}
        }
    }

    /// The storage transaction opened for this request, if the route asked
    /// for one.
    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<T>> {
        self.shared.transaction.as_ref()
    }

    /// Identity established by upstream authentication, if any.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.shared.principal.as_deref()
    }

    /// Reports success. Returns `false` if a terminal outcome was already
    /// reported or the request has been resolved without it.
    pub fn succeed(&self, reply: Reply) -> bool {
        self.terminate(Terminal::Succeeded(reply))
    }

    /// Reports failure. Returns `false` if a terminal outcome was already
    /// reported or the request has been resolved without it.
    pub fn fail(&self, trace: ErrorTrace) -> bool {
        self.terminate(Terminal::Failed(trace))
    }

    /// Reports whichever outcome `result` holds.
    pub fn complete(&self, result: Result<Reply, ErrorTrace>) -> bool {
        match result {
            Ok(reply) => self.succeed(reply),
            Err(trace) => self.fail(trace),
        }
    }

    /// Reports a non-terminal problem to be attached to a successful response.
    pub fn warn(&self, trace: ErrorTrace) {
        if self.shared.warnings.send(trace).is_err() {
            tracing::debug!(
                route = self.shared.route,
                request_id = %self.shared.request_id,
                "warning dropped, request already resolved"
            );
        }
    }

    fn terminate(&self, signal: Terminal) -> bool {
        let Some(sender) = self.shared.terminal.lock().take() else {
            tracing::warn!(
                route = self.shared.route,
                request_id = %self.shared.request_id,
                "handler reported a second terminal outcome; ignoring it"
            );
            return false;
        };
        if sender.try_send(signal).is_err() {
            tracing::debug!(
                route = self.shared.route,
                request_id = %self.shared.request_id,
                "terminal outcome arrived after the request was resolved"
            );
            return false;
        }
        true
    }
}

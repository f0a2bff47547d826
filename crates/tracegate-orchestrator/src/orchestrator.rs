//! Runs one handler per request against its deadline and resolves exactly
//! one outcome.

use std::future::Future;
use std::sync::Arc;

use http::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracegate_trace::{DisclosureLevel, ErrorTrace};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{ConfigHandle, OrchestratorConfig};
use crate::context::{ContextParts, ExecutionContext, Signals, Terminal};
use crate::outcome::{Outcome, Resolution};
use crate::route::RouteSpec;
use crate::telemetry::OrchestratorTelemetry;
use crate::transaction::{TransactionCoordinator, TransactionSource};

pub struct Orchestrator<S: TransactionSource> {
    config: ConfigHandle,
    source: Arc<S>,
    telemetry: Arc<OrchestratorTelemetry>,
    shutdown: CancellationToken,
}

impl<S: TransactionSource> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            telemetry: Arc::clone(&self.telemetry),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: TransactionSource> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config.snapshot())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// How the race between handler and deadline was decided.
enum Race {
    Signal(Terminal),
    Expired,
    Cancelled,
}

impl<S: TransactionSource> Orchestrator<S> {
    #[must_use]
    pub fn new(config: ConfigHandle, source: Arc<S>) -> Self {
        Self {
            config,
            source,
            telemetry: Arc::new(OrchestratorTelemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    #[must_use]
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    #[must_use]
    pub fn telemetry(&self) -> &Arc<OrchestratorTelemetry> {
        &self.telemetry
    }

    /// Cancels every in-flight request. Requests started afterwards are
    /// cancelled immediately.
    pub fn shutdown(&self) {
        tracing::info!("orchestrator shutting down, cancelling in-flight requests");
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs `handler` for one request and resolves its outcome.
    ///
    /// The handler is spawned onto the runtime and reports through the
    /// [`ExecutionContext`] it receives. `principal` is the identity
    /// established by upstream authentication, passed through untouched.
    pub async fn execute<F, Fut>(
        &self,
        route: RouteSpec,
        principal: Option<String>,
        handler: F,
    ) -> Resolution
    where
        F: FnOnce(ExecutionContext<S::Transaction>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let request_id = Ulid::new();
        let span = tracing::info_span!("request", route = route.name, request_id = %request_id);
        self.run(route, principal, request_id, handler).instrument(span).await
    }

    async fn run<F, Fut>(
        &self,
        route: RouteSpec,
        principal: Option<String>,
        request_id: Ulid,
        handler: F,
    ) -> Resolution
    where
        F: FnOnce(ExecutionContext<S::Transaction>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = self.config.snapshot();
        self.telemetry.record_request();

        let timeout = route.timeout.resolve(&config);
        let deadline = Instant::now() + timeout;

        let coordinator = if route.needs_storage {
            match TransactionCoordinator::begin(&self.source).await {
                Ok(coordinator) => coordinator,
                Err(trace) => {
                    self.telemetry.record_begin_failure();
                    let trace = trace.with_status(StatusCode::INTERNAL_SERVER_ERROR);
                    return self.resolve(Outcome::Failed(trace), &[], &config, request_id);
                }
            }
        } else {
            TransactionCoordinator::detached()
        };

        let cancellation = self.shutdown.child_token();
        let (context, signals) = ExecutionContext::new(ContextParts {
            route: route.name,
            request_id,
            deadline,
            cancellation: cancellation.clone(),
            transaction: coordinator.transaction(),
            principal,
        });
        let Signals { terminal: mut terminal_rx, warnings: warnings_rx } = signals;

        let warnings = WarningCollector::spawn(warnings_rx);
        tokio::spawn(handler(context).in_current_span());

        let race = tokio::select! {
            biased;
            Some(signal) = terminal_rx.recv() => Race::Signal(signal),
            () = tokio::time::sleep_until(deadline) => Race::Expired,
            () = cancellation.cancelled() => Race::Cancelled,
        };
        // Tell the handler to stop; it may still be running past the deadline.
        cancellation.cancel();

        let outcome = match race {
            Race::Signal(Terminal::Succeeded(reply)) => Outcome::Responded(reply),
            Race::Signal(Terminal::Failed(trace)) => Outcome::Failed(trace),
            Race::Expired => {
                let base = self.await_late_failure(&mut terminal_rx, &config).await;
                self.telemetry.record_timed_out();
                let seconds = timeout.as_secs_f64();
                Outcome::TimedOut(
                    base.with_status(StatusCode::GATEWAY_TIMEOUT)
                        .append(
                            DisclosureLevel::Wordy,
                            format!("Request timed out after {seconds} seconds"),
                        )
                        .alt(DisclosureLevel::Broad, "Request timed out"),
                )
            }
            Race::Cancelled => {
                let base = self.await_late_failure(&mut terminal_rx, &config).await;
                self.telemetry.record_cancelled();
                Outcome::TimedOut(base.append(DisclosureLevel::Broad, "Request failed"))
            }
        };
        // Late signals after this point are refused at the sender.
        drop(terminal_rx);

        let collected = warnings.finish().await;
        let outcome = coordinator.finalize(outcome, &self.telemetry, config.grace_window).await;
        self.resolve(outcome, &collected, &config, request_id)
    }

    /// Waits one grace window for a failure that explains the expiry.
    async fn await_late_failure(
        &self,
        terminal: &mut mpsc::Receiver<Terminal>,
        config: &OrchestratorConfig,
    ) -> ErrorTrace {
        match tokio::time::timeout(config.grace_window, terminal.recv()).await {
            Ok(Some(Terminal::Failed(trace))) => {
                self.telemetry.record_late_failure_captured();
                tracing::debug!("late failure captured inside the grace window");
                trace
            }
            Ok(Some(Terminal::Succeeded(_))) => {
                self.telemetry.record_late_success_discarded();
                tracing::warn!("handler succeeded after its deadline; discarding the reply");
                ErrorTrace::new()
            }
            Ok(None) | Err(_) => ErrorTrace::new(),
        }
    }

    fn resolve(
        &self,
        outcome: Outcome,
        warnings: &[ErrorTrace],
        config: &OrchestratorConfig,
        request_id: Ulid,
    ) -> Resolution {
        match &outcome {
            Outcome::Responded(_) => {
                self.telemetry.record_completed();
                for warning in warnings {
                    tracing::warn!(warning = %warning.serialize(DisclosureLevel::Debug), "request warning");
                }
            }
            Outcome::Failed(trace) | Outcome::TimedOut(trace) => {
                if matches!(outcome, Outcome::Failed(_)) {
                    self.telemetry.record_failed();
                }
                tracing::error!(
                    status = trace.status().as_u16(),
                    error = %trace.serialize(DisclosureLevel::Debug),
                    "request failed"
                );
                for warning in warnings {
                    tracing::warn!(
                        warning = %warning.serialize(DisclosureLevel::Debug),
                        "request warning dropped from failed response"
                    );
                }
            }
        }
        self.telemetry.record_warnings(warnings.len());

        Resolution::new(
            outcome,
            warnings,
            config.disclosure_level,
            request_id,
            config.allowed_origin.clone(),
        )
    }
}

/// Drains a request's warning channel until told to stop.
struct WarningCollector {
    stop: CancellationToken,
    task: JoinHandle<Vec<ErrorTrace>>,
}

impl WarningCollector {
    fn spawn(mut warnings: mpsc::UnboundedReceiver<ErrorTrace>) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let task = tokio::spawn(
            async move {
                let mut collected = Vec::new();
                loop {
                    tokio::select! {
                        biased;
                        received = warnings.recv() => match received {
                            Some(warning) => collected.push(warning),
                            None => break,
                        },
                        () = stopped.cancelled() => {
                            while let Ok(warning) = warnings.try_recv() {
                                collected.push(warning);
                            }
                            break;
                        }
                    }
                }
                collected
            }
            .in_current_span(),
        );
        Self { stop, task }
    }

    async fn finish(self) -> Vec<ErrorTrace> {
        self.stop.cancel();
        match self.task.await {
            Ok(collected) => collected,
            Err(err) => {
                tracing::error!(error = %err, "warning collector failed");
                Vec::new()
            }
        }
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracegate_orchestrator::{
    ConfigHandle, DisclosureLevel, ErrorTrace, Orchestrator, OrchestratorConfig, OutcomeKind,
    Reply, Resolution, ResolutionBody, RouteSpec, StorageTransaction, TransactionSource,
};

#[derive(Debug, Default)]
struct Ledger {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

#[derive(Debug, Default)]
struct LedgerSource {
    fail_begin: bool,
    fail_commit: bool,
    ledgers: Mutex<Vec<Arc<Ledger>>>,
}

#[derive(Debug)]
struct LedgerTransaction {
    ledger: Arc<Ledger>,
    fail_commit: bool,
}

impl StorageTransaction for LedgerTransaction {
    fn commit(&self) -> Result<(), ErrorTrace> {
        self.ledger.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit {
            return Err(ErrorTrace::new().append(DisclosureLevel::Debug, "database disk image is malformed"));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), ErrorTrace> {
        self.ledger.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl TransactionSource for LedgerSource {
    type Transaction = LedgerTransaction;

    fn begin(&self) -> Result<LedgerTransaction, ErrorTrace> {
        if self.fail_begin {
            return Err(ErrorTrace::new()
                .with_status(StatusCode::SERVICE_UNAVAILABLE)
                .append(DisclosureLevel::Debug, "unable to open database file")
                .append(DisclosureLevel::Wordy, "The database is not reachable")
                .alt(DisclosureLevel::Plain, "Database error"));
        }
        let ledger = Arc::new(Ledger::default());
        self.ledgers.lock().push(Arc::clone(&ledger));
        Ok(LedgerTransaction { ledger, fail_commit: self.fail_commit })
    }
}

fn orchestrator_with(
    source: LedgerSource,
    config: OrchestratorConfig,
) -> (Orchestrator<LedgerSource>, Arc<LedgerSource>) {
    let handle = ConfigHandle::new(config)
        .unwrap_or_else(|err| panic!("test config rejected: {err}"));
    let source = Arc::new(source);
    (Orchestrator::new(handle, Arc::clone(&source)), source)
}

fn short_config(timeout_ms: u64, grace_ms: u64) -> OrchestratorConfig {
    OrchestratorConfig {
        default_timeout: Duration::from_millis(timeout_ms),
        authentication_timeout: Duration::from_millis(timeout_ms),
        grace_window: Duration::from_millis(grace_ms),
        ..OrchestratorConfig::default()
    }
}

fn json_body(resolution: &Resolution) -> &Value {
    match resolution.body() {
        ResolutionBody::Json(value) => value,
        ResolutionBody::File { name, .. } => panic!("expected JSON body, got file {name}"),
    }
}

const STORAGE_ROUTE: RouteSpec = RouteSpec::new("contract").with_storage();

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_request_resolves_exactly_once_under_load() {
    let timeout = Duration::from_millis(300);
    let grace = Duration::from_millis(100);
    let (orchestrator, source) = orchestrator_with(LedgerSource::default(), short_config(300, 100));

    let mut requests = JoinSet::new();
    for index in 0..1000_usize {
        let orchestrator = orchestrator.clone();
        requests.spawn(async move {
            let started = Instant::now();
            let resolution = orchestrator
                .execute(STORAGE_ROUTE, None, move |ctx| async move {
                    match index % 3 {
                        0 => {
                            if index % 2 == 0 {
                                ctx.warn(ErrorTrace::new().append(DisclosureLevel::Plain, "partial data"));
                            }
                            ctx.succeed(Reply::ok());
                        }
                        1 => {
                            ctx.fail(
                                ErrorTrace::new()
                                    .with_status(StatusCode::NOT_FOUND)
                                    .append(DisclosureLevel::Plain, "item not found"),
                            );
                        }
                        _ => {
                            tokio::time::sleep(Duration::from_secs(3)).await;
                            ctx.succeed(Reply::ok());
                        }
                    }
                })
                .await;
            (index, resolution, started.elapsed())
        });
    }

    let mut resolved = 0_usize;
    let mut seen = vec![false; 1000];
    while let Some(joined) = requests.join_next().await {
        let (index, resolution, elapsed) =
            joined.unwrap_or_else(|err| panic!("request task failed: {err}"));
        assert!(!seen[index], "request {index} resolved twice");
        seen[index] = true;
        resolved += 1;

        match index % 3 {
            0 => {
                assert_eq!(resolution.kind(), OutcomeKind::Responded);
                assert_eq!(resolution.status(), StatusCode::OK);
                if index % 2 == 0 {
                    assert_eq!(resolution.warnings(), ["Partial data".to_string()]);
                }
            }
            1 => {
                assert_eq!(resolution.kind(), OutcomeKind::Failed);
                assert_eq!(resolution.status(), StatusCode::NOT_FOUND);
                assert_eq!(resolution.error_message(), Some("Item not found"));
            }
            _ => {
                assert_eq!(resolution.kind(), OutcomeKind::TimedOut);
                assert_eq!(resolution.status(), StatusCode::GATEWAY_TIMEOUT);
                assert!(elapsed >= timeout, "request {index} resolved before its deadline");
                assert!(
                    elapsed < timeout + grace + Duration::from_millis(150),
                    "request {index} took {elapsed:?}"
                );
            }
        }
    }
    assert_eq!(resolved, 1000);

    let ledgers = source.ledgers.lock();
    assert_eq!(ledgers.len(), 1000);
    let commits: usize = ledgers.iter().map(|l| l.commits.load(Ordering::SeqCst)).sum();
    let rollbacks: usize = ledgers.iter().map(|l| l.rollbacks.load(Ordering::SeqCst)).sum();
    for ledger in ledgers.iter() {
        assert_eq!(
            ledger.commits.load(Ordering::SeqCst) + ledger.rollbacks.load(Ordering::SeqCst),
            1,
            "transaction must be finalized exactly once"
        );
    }
    assert_eq!(commits, 334);
    assert_eq!(rollbacks, 666);

    let telemetry = orchestrator.telemetry().snapshot();
    assert_eq!(telemetry.requests, 1000);
    assert_eq!(telemetry.completed, 334);
    assert_eq!(telemetry.failed, 333);
    assert_eq!(telemetry.timed_out, 333);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_failure_inside_grace_window_explains_the_timeout() {
    let config = OrchestratorConfig {
        disclosure_level: DisclosureLevel::Wordy,
        ..short_config(200, 400)
    };
    let (orchestrator, _source) = orchestrator_with(LedgerSource::default(), config);

    let resolution = orchestrator
        .execute(RouteSpec::new("sync"), None, |ctx| async move {
            ctx.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.fail(
                ErrorTrace::new()
                    .with_status(StatusCode::SERVICE_UNAVAILABLE)
                    .append(DisclosureLevel::Debug, "GET https://dav.internal/cal/7 timed out")
                    .append(DisclosureLevel::Wordy, "CalDAV server did not answer")
                    .alt(DisclosureLevel::Plain, "Source did not answer"),
            );
        })
        .await;

    assert_eq!(resolution.kind(), OutcomeKind::TimedOut);
    assert_eq!(resolution.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        resolution.error_message(),
        Some("Request timed out after 0.2 seconds: CalDAV server did not answer")
    );
    assert_eq!(orchestrator.telemetry().snapshot().late_failures_captured, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_stall_times_out_with_broad_text() {
    let (orchestrator, source) = orchestrator_with(LedgerSource::default(), short_config(150, 50));

    let resolution = orchestrator
        .execute(STORAGE_ROUTE, None, |ctx| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ctx.succeed(Reply::ok());
        })
        .await;

    assert_eq!(resolution.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(resolution.error_message(), Some("Request timed out"));
    assert_eq!(json_body(&resolution), &json!({"error": "Request timed out"}));

    let ledgers = source.ledgers.lock();
    assert_eq!(ledgers[0].rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(ledgers[0].commits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_success_is_discarded() {
    let (orchestrator, source) = orchestrator_with(LedgerSource::default(), short_config(150, 400));

    let resolution = orchestrator
        .execute(STORAGE_ROUTE, None, |ctx| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            ctx.succeed(Reply::ok());
        })
        .await;

    assert_eq!(resolution.kind(), OutcomeKind::TimedOut);
    assert_eq!(resolution.error_message(), Some("Request timed out"));
    assert_eq!(orchestrator.telemetry().snapshot().late_successes_discarded, 1);
    assert_eq!(source.ledgers.lock()[0].commits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_returning_without_signal_times_out() {
    let (orchestrator, _source) = orchestrator_with(LedgerSource::default(), short_config(100, 50));

    let started = Instant::now();
    let resolution = orchestrator.execute(RouteSpec::new("forgetful"), None, |_ctx| async {}).await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(resolution.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_in_flight_requests() {
    let (orchestrator, source) = orchestrator_with(LedgerSource::default(), short_config(5_000, 100));

    let running = orchestrator.clone();
    let request = tokio::spawn(async move {
        running
            .execute(STORAGE_ROUTE, None, |ctx| async move {
                ctx.cancelled().await;
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.shutdown();

    let resolution = request.await.unwrap_or_else(|err| panic!("request task failed: {err}"));
    assert_eq!(resolution.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resolution.error_message(), Some("Request failed"));
    assert_eq!(orchestrator.telemetry().snapshot().cancelled, 1);
    assert_eq!(source.ledgers.lock()[0].rollbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn begin_failure_skips_the_handler() {
    let source = LedgerSource { fail_begin: true, ..LedgerSource::default() };
    let (orchestrator, _source) = orchestrator_with(source, short_config(500, 50));
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    let resolution = orchestrator
        .execute(STORAGE_ROUTE, None, move |ctx| async move {
            flag.store(true, Ordering::SeqCst);
            ctx.succeed(Reply::ok());
        })
        .await;

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(resolution.kind(), OutcomeKind::Failed);
    assert_eq!(resolution.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resolution.error_message(), Some("Database error"));
    assert_eq!(orchestrator.telemetry().snapshot().begin_failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_failure_overrides_success() {
    let source = LedgerSource { fail_commit: true, ..LedgerSource::default() };
    let (orchestrator, source) = orchestrator_with(source, short_config(500, 50));

    let resolution = orchestrator
        .execute(STORAGE_ROUTE, None, |ctx| async move {
            ctx.succeed(Reply::ok());
        })
        .await;

    assert_eq!(resolution.kind(), OutcomeKind::Failed);
    assert_eq!(resolution.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resolution.error_message(), Some("Could not save changes"));
    let ledgers = source.ledgers.lock();
    assert_eq!(ledgers[0].commits.load(Ordering::SeqCst), 1);
    assert_eq!(ledgers[0].rollbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn warnings_are_serialized_deduplicated_and_attached() {
    let (orchestrator, _source) = orchestrator_with(LedgerSource::default(), short_config(500, 50));

    let resolution = orchestrator
        .execute(RouteSpec::new("import"), None, |ctx| async move {
            let stale = || {
                ErrorTrace::new()
                    .append(DisclosureLevel::Debug, "etag mismatch on /cal/3")
                    .append(DisclosureLevel::Plain, "some events may be outdated")
            };
            ctx.warn(stale());
            ctx.warn(stale());
            ctx.warn(ErrorTrace::new().append(DisclosureLevel::Plain, "one source was skipped"));
            let mut fields = serde_json::Map::new();
            fields.insert("imported".to_string(), json!(12));
            ctx.succeed(Reply::json(fields));
        })
        .await;

    assert_eq!(resolution.status(), StatusCode::OK);
    assert_eq!(
        json_body(&resolution),
        &json!({
            "imported": 12,
            "warnings": ["Some events may be outdated", "One source was skipped"],
        })
    );
    assert_eq!(orchestrator.telemetry().snapshot().warnings, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authentication_routes_use_their_own_timeout_and_cap() {
    let config = OrchestratorConfig {
        disclosure_level: DisclosureLevel::Wordy,
        authentication_timeout: Duration::from_millis(100),
        ..short_config(5_000, 50)
    };
    let (orchestrator, _source) = orchestrator_with(LedgerSource::default(), config);
    let login = RouteSpec::new("login").authentication();

    let started = Instant::now();
    let stalled = orchestrator
        .execute(login.clone(), None, |ctx| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            ctx.succeed(Reply::ok());
        })
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stalled.error_message(), Some("Request timed out after 0.1 seconds"));

    let rejected = orchestrator
        .execute(login, Some("anonymous".to_string()), |ctx| async move {
            assert_eq!(ctx.principal(), Some("anonymous"));
            ctx.fail(
                ErrorTrace::new()
                    .with_status(StatusCode::UNAUTHORIZED)
                    .append(DisclosureLevel::Debug, "user 7f3a not found")
                    .append(DisclosureLevel::Wordy, "Invalid username")
                    .append(DisclosureLevel::Broad, "Could not log in")
                    .cap_level(DisclosureLevel::Broad),
            );
        })
        .await;
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(rejected.error_message(), Some("Could not log in"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responses_carry_configured_origin() {
    let config = OrchestratorConfig {
        allowed_origin: Some("https://calendar.example.org".to_string()),
        ..short_config(500, 50)
    };
    let (orchestrator, _source) = orchestrator_with(LedgerSource::default(), config);

    let resolution = orchestrator
        .execute(RouteSpec::new("version"), None, |ctx| async move {
            ctx.succeed(Reply::ok());
        })
        .await;
    let response = axum::response::IntoResponse::into_response(resolution);
    assert_eq!(
        response
            .headers()
            .get(http::header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok()),
        Some("https://calendar.example.org")
    );
}

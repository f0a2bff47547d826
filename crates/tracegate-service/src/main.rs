use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde::Serialize;
use tracegate_orchestrator::{
    ConfigHandle, DisclosureLevel, ErrorTrace, Orchestrator, OrchestratorConfig, Reply, Resolution,
    RouteSpec, TelemetrySnapshot,
};
use tracegate_store_sqlite::SqliteDatabase;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION_ROUTE: RouteSpec = RouteSpec::new("version");
const HEALTH_ROUTE: RouteSpec = RouteSpec::new("health").with_storage();

#[derive(Debug, Clone)]
struct ServiceState {
    orchestrator: Orchestrator<SqliteDatabase>,
}

#[derive(Debug, Clone, Serialize)]
struct VersionResponse {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: &'static str,
    telemetry: TelemetrySnapshot,
}

#[derive(Debug, Parser)]
#[command(name = "tracegate-service")]
#[command(about = "HTTP service running every request under a deadline-bound orchestrator")]
struct Args {
    #[arg(long, env = "TRACEGATE_DB", default_value = "./tracegate.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "TRACEGATE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Most detailed error wording ever sent to clients.
    #[arg(long, env = "TRACEGATE_DISCLOSURE_LEVEL", default_value_t = DisclosureLevel::Plain)]
    disclosure_level: DisclosureLevel,
    #[arg(long, env = "REQUEST_TIMEOUT_DEFAULT", default_value_t = 5000)]
    request_timeout_ms: u64,
    #[arg(long, env = "REQUEST_TIMEOUT_AUTHENTICATION", default_value_t = 5000)]
    auth_timeout_ms: u64,
    #[arg(long, env = "TRACEGATE_GRACE_WINDOW_MS", default_value_t = 100)]
    grace_window_ms: u64,
    #[arg(long, env = "DEVELOPMENT")]
    development: bool,
    /// Origin allowed to read responses cross-site.
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,
}

impl Args {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            disclosure_level: self.disclosure_level,
            default_timeout: Duration::from_millis(self.request_timeout_ms),
            authentication_timeout: Duration::from_millis(self.auth_timeout_ms),
            grace_window: Duration::from_millis(self.grace_window_ms),
            development: self.development,
            allowed_origin: self
                .public_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty()),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/version", get(version))
        .route("/api/health", get(health))
        .with_state(state)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = ConfigHandle::new(args.orchestrator_config())
        .context("invalid orchestrator configuration")?;
    let database = SqliteDatabase::open(args.db.clone())?;
    let orchestrator = Orchestrator::new(config, Arc::new(database));
    let state = ServiceState { orchestrator: orchestrator.clone() };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "tracegate service listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await?;
    Ok(())
}

async fn shutdown_signal(orchestrator: Orchestrator<SqliteDatabase>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    orchestrator.shutdown();
}

async fn version(State(state): State<ServiceState>) -> Resolution {
    state
        .orchestrator
        .execute(VERSION_ROUTE, None, |ctx| async move {
            ctx.complete(Reply::from_serializable(&VersionResponse {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            }));
        })
        .await
}

async fn health(State(state): State<ServiceState>) -> Resolution {
    let telemetry = Arc::clone(state.orchestrator.telemetry());
    state
        .orchestrator
        .execute(HEALTH_ROUTE, None, move |ctx| async move {
            let Some(tx) = ctx.transaction().cloned() else {
                ctx.fail(
                    ErrorTrace::new()
                        .append(DisclosureLevel::Debug, "health route ran without a transaction")
                        .append(DisclosureLevel::Plain, "Database error"),
                );
                return;
            };
            let probe = tx
                .query(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
                .await;
            let result = probe
                .map_err(|trace| trace.append(DisclosureLevel::Wordy, "Database health probe failed"))
                .and_then(|_| {
                    Reply::from_serializable(&HealthResponse {
                        status: "ok",
                        database: "reachable",
                        telemetry: telemetry.snapshot(),
                    })
                });
            ctx.complete(result);
        })
        .await
}

//! Greenlight API server - Main entry point

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use greenlight_core::{
    api::{self, AppState},
    config::{Config, Environment},
    db::{Database, POOL_METRICS_INTERVAL},
    middleware::{ClientLimiter, IdentityResolver},
    observability,
    shutdown::ShutdownCoordinator,
    tasks::{TaskTracker, TracingNotifier},
    version::{BUILD_VERSION, PKG_VERSION},
};

#[derive(Debug, Parser)]
#[command(name = "greenlight-api", version = BUILD_VERSION, about = "Greenlight JSON API server")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "GREENLIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,

    /// Deployment environment, overrides server.environment
    #[arg(short, long, value_enum)]
    env: Option<Environment>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            // The subscriber may not be installed yet.
            eprintln!("Error: {:#}", e);
            tracing::error!(error = %e, "Server exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = Config::load(cli.config.as_deref())?.with_overrides(cli.port, cli.env);

    observability::init("greenlight-api", &config.observability)?;
    let metrics = observability::install_metrics_recorder()?;

    tracing::info!(
        version = BUILD_VERSION,
        crate_version = PKG_VERSION,
        environment = %config.server.environment,
        "Starting Greenlight API"
    );

    let db = Arc::new(Database::connect(&config.database).await?);

    let tasks = TaskTracker::new();
    let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown.clone(), tasks.clone()));

    let limiter = Arc::new(ClientLimiter::new(config.limiter.clone()));
    let sweeper = limiter.clone().spawn_sweeper(coordinator.drain_token());
    let pool_monitor = db.spawn_pool_monitor(POOL_METRICS_INTERVAL, coordinator.drain_token());

    let resolver = Arc::new(IdentityResolver::new(
        db.clone(),
        db.clone(),
        config.auth.clone(),
    ));

    let state = AppState {
        limiter,
        resolver,
        tasks,
        notifier: Arc::new(TracingNotifier),
        environment: config.server.environment,
        request_timeout: config.server.request_timeout,
        cors: config.cors.clone(),
        metrics: Some(metrics),
        limiter_bypass: None,
    };
    let app = api::build_router(state, api::identity_routes());

    coordinator.on_release("rate limiter sweeper", move || async move {
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Rate limiter sweeper ended abnormally");
        }
    });
    coordinator.on_release("database pool", move || async move {
        if let Err(e) = pool_monitor.await {
            tracing::warn!(error = %e, "Pool monitor ended abnormally");
        }
        db.close().await;
    });
    coordinator.spawn_signal_listener();

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    tracing::info!(address = %listener.local_addr()?, "Starting HTTP server");

    let outcome = coordinator.serve(listener, app).await?;

    observability::shutdown();
    Ok(outcome.exit_code())
}

use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    catalog::{LogAlertManager, SqliteCatalog},
    data_motion::EndpointDataMotion,
    endpoint::EndpointGateway,
    local_endpoint::LocalEndpoint,
    template_service::{Collaborators, TemplateService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run flags ---
    let (cfg, flags) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting template orchestrator with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );
    let catalog = SqliteCatalog::new(db.clone());

    // --- Handle migration mode ---
    if flags.migrate {
        let applied = catalog.migrate().await?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(());
    }

    // --- Wire collaborators ---
    let gateway: Arc<dyn EndpointGateway> = Arc::new(LocalEndpoint::new(cfg.verify_checksums));
    let motion = Arc::new(EndpointDataMotion::new(gateway.clone()));
    let service = TemplateService::new(Collaborators::with_sqlite(
        catalog,
        Arc::new(LogAlertManager),
        gateway,
        motion,
    ));

    // --- One-shot sweep mode ---
    if flags.sync_once {
        let reports = service.sync_all_stores().await?;
        tracing::info!("Swept {} image stores.", reports.len());
        drain_in_flight(&service, cfg.sync_interval()).await;
        return Ok(());
    }

    tokio::spawn(run_periodic_sync(service.clone(), cfg.sync_interval()));

    // --- Build router ---
    let state = AppState {
        service,
        db,
        storage_dir: cfg.storage_dir.clone().into(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Sweep every image store at start-up and then once per `interval`.
async fn run_periodic_sync(service: TemplateService, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match service.sync_all_stores().await {
            Ok(reports) => tracing::debug!("Periodic sync covered {} stores", reports.len()),
            Err(err) => tracing::warn!("Periodic sync failed: {}", err),
        }
    }
}

/// Give downloads requested by a one-shot sweep a chance to finish before exit.
async fn drain_in_flight(service: &TemplateService, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match service.count_in_flight().await {
            Ok(0) => return,
            Ok(n) if tokio::time::Instant::now() >= deadline => {
                tracing::warn!("Exiting with {} operations still in flight", n);
                return;
            }
            Ok(n) => tracing::debug!("Waiting for {} operations in flight", n),
            Err(err) => {
                tracing::warn!("Could not count in-flight operations: {}", err);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

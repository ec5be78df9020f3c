//! Settlement reconciler: entry point.
//!
//! Starts a background task that keeps the owner dashboard reconciled
//! against the fundraising backend and caches the last good figures in
//! SQLite. Simultaneously exposes a small Axum REST API for the frontend.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use settlement::api::{self, ApiState};
use settlement::backend::ContributionBackend;
use settlement::client::BackendClient;
use settlement::config::Config;
use settlement::reconcile::Dashboard;
use settlement::session::Session;
use settlement::worker::{self, WorkerState};
use settlement::{resolver, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = store::init_pool(&config.database_url).await?;

    let session = Arc::new(Session::load(pool.clone()).await?);
    if let Some(token) = config.session_token.clone() {
        session.install(token).await?;
    }

    let backend: Arc<dyn ContributionBackend> = Arc::new(BackendClient::from_config(&config, session.clone())?);
    let resolver = resolver::build(&config, backend.clone());
    let dashboard = Arc::new(Dashboard::new(
        backend.clone(),
        resolver,
        pool,
        config.reconcile_scope,
    ));

    // ─── Background reconciler ────────────────────────────
    let worker_state = Arc::new(WorkerState {
        dashboard: dashboard.clone(),
        session: session.clone(),
        refresh_interval: config.refresh_interval,
    });
    tokio::spawn(worker::run(worker_state));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState {
        dashboard: dashboard.clone(),
        session,
        backend,
    }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    dashboard.unmount().await;
    Ok(())
}

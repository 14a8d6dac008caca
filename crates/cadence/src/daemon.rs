//! Daemon command: scheduler plus lifecycle API in one process.

use std::sync::Arc;

use miette::Result;
use tracing::info;

use cadence_scheduler::{ActionClient, CampaignScheduler};
use cadence_store::PostgresStore;
use cadence_web::create_router;

use crate::dispatch::{DryRunClient, HttpActionClient};

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub database_url: String,
    /// Dispatcher endpoint. When absent the daemon falls back to dry-run.
    pub dispatch_url: Option<String>,
    pub port: u16,
    pub dry_run: bool,
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    let pool = cadence_store::connect(&config.database_url)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    cadence_store::run_migrations(&pool)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let store = Arc::new(PostgresStore::new(pool));

    let client: Arc<dyn ActionClient> = match (&config.dispatch_url, config.dry_run) {
        (Some(url), false) => {
            info!(dispatch_url = %url, "using http dispatcher");
            Arc::new(HttpActionClient::new(url.clone()))
        }
        (url, _) => {
            if url.is_some() {
                info!("dry run requested, actions will be logged only");
            } else {
                info!("no dispatcher configured, actions will be logged only");
            }
            Arc::new(DryRunClient)
        }
    };

    let scheduler = Arc::new(CampaignScheduler::new(
        store.clone(),
        store.clone(),
        client,
        store.clone(),
    ));

    // Restart recovery: campaigns left active by a previous process get
    // their loops back.
    scheduler
        .resume_all()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let router = create_router(scheduler, store);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    info!("api listening on http://0.0.0.0:{}", config.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    Ok(())
}

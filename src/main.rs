use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cabinbook::config::Config;
use cabinbook::engine::Engine;
use cabinbook::gateway::{Credentials, GetnetClient};
use cabinbook::http::{self, AppState};
use cabinbook::notify::NotifyHub;
use cabinbook::sync::{CalendarFetcher, HttpFetcher};
use cabinbook::{mailer, observability, reaper, sync};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env()?);
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), notify.clone())?);

    let credentials = Credentials::new(config.getnet_login.clone(), config.getnet_secret_key.clone());
    let gateway = Arc::new(GetnetClient::new(&config.getnet_base_url, credentials.clone())?);
    let fetcher: Arc<dyn CalendarFetcher> = Arc::new(HttpFetcher::new()?);

    let ttl = chrono::Duration::seconds(i64::try_from(config.pending_ttl_secs).unwrap_or(i64::MAX));
    tokio::spawn(reaper::run_reaper(engine.clone(), ttl));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));
    tokio::spawn(mailer::run_mailer(engine.clone(), notify.clone()));
    if let Some(secs) = config.sync_interval_secs {
        tokio::spawn(sync::run_periodic_sync(
            engine.clone(),
            fetcher.clone(),
            Duration::from_secs(secs),
        ));
    }

    let state = AppState {
        engine,
        gateway,
        credentials,
        fetcher,
        config: config.clone(),
    };
    let app = http::router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("cabinbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  site_url: {}", config.site_url);
    info!("  gateway: {}", config.getnet_base_url);
    info!(
        "  calendar sync: {}",
        config
            .sync_interval_secs
            .map_or("cron endpoint only".to_string(), |s| format!("every {s}s"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("cabinbook stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("could not register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining requests");
}

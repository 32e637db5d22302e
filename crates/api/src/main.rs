use std::sync::Arc;

use anyhow::Context;
use tokio::signal;

use finsync_api::app::{self, services::build_services};
use finsync_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    finsync_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let services = Arc::new(
        build_services(&config)
            .await
            .context("failed to initialise services")?,
    );
    let reaper = services.sync.reaper().clone().spawn(config.reaper_interval);

    let app = app::build_app(services.clone(), &config.jwt_secret);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped; draining sync jobs");
    reaper.shutdown().await;
    services.shutdown(config.shutdown_grace).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("shutdown signal received");
}

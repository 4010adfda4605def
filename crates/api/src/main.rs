use std::sync::Arc;

use anyhow::Context;

use bulklabel_api::app::services::{AppServices, Background, BackgroundOptions, Backends, Collaborators};
use bulklabel_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bulklabel_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let backends = Backends::connect(&settings).await?;
    let services = Arc::new(AppServices::new(&backends, settings.dispatcher.clone()));

    // Blocking HTTP clients and worker threads are set up off the async executor.
    let background = {
        let settings = settings.clone();
        let backends = backends.clone();
        tokio::task::spawn_blocking(move || {
            let collaborators = if settings.workers > 0 {
                Some(Collaborators::from_settings(&settings)?)
            } else {
                None
            };
            Background::start(
                &settings,
                &backends,
                collaborators.as_ref(),
                BackgroundOptions {
                    workers: settings.workers,
                    reaper: true,
                    janitor: true,
                },
            )
        })
        .await
        .context("background startup panicked")??
    };

    let app = bulklabel_api::app::build_app(services);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tokio::task::spawn_blocking(move || background.shutdown())
        .await
        .context("background shutdown panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

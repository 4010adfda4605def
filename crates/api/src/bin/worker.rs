//! Standalone worker process: claims jobs from the shared Postgres ledger.

use anyhow::Context;

use bulklabel_api::app::services::{Background, BackgroundOptions, Backends, Collaborators};
use bulklabel_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bulklabel_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    anyhow::ensure!(
        settings.database_url.is_some(),
        "DATABASE_URL must be set: a standalone worker needs the shared ledger"
    );
    anyhow::ensure!(settings.workers > 0, "BULKLABEL_WORKERS must be at least 1");

    let backends = Backends::connect(&settings).await?;

    let background = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || {
            let collaborators = Collaborators::from_settings(&settings)?;
            Background::start(
                &settings,
                &backends,
                Some(&collaborators),
                BackgroundOptions {
                    workers: settings.workers,
                    reaper: true,
                    janitor: false,
                },
            )
        })
        .await
        .context("worker startup panicked")??
    };

    tracing::info!(workers = settings.workers, "worker process running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    tokio::task::spawn_blocking(move || background.shutdown())
        .await
        .context("worker shutdown panicked")?;
    Ok(())
}

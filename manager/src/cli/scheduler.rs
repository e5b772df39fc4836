//! `scheduler`: the long-running process

use std::path::Path;

use anyhow::{bail, Result};
use tracing::info;

use crate::app::options::AppOptions;
use crate::app::run::run as run_app;
use crate::cli::context::load;

pub async fn run(config: &Path) -> Result<()> {
    let loaded = load(config).await?;

    let Some(schedule) = loaded.schedule.clone().filter(|s| s.enabled) else {
        bail!(
            "The scheduler is disabled, set scheduler.enabled in {}",
            config.display()
        );
    };

    let options = AppOptions::from_settings(loaded.path.clone(), &loaded.config.manager, &schedule);
    info!(
        "Scheduler: every {:?}, window {}, days {:?}, actions {:?}, max retries {}",
        schedule.check_interval,
        schedule.time_window,
        schedule.days,
        schedule.actions,
        schedule.max_retries
    );

    let (state, events_rx) = loaded.wire()?;
    run_app(
        options,
        state,
        loaded.definitions.clone(),
        events_rx,
        await_shutdown_signal(),
    )
    .await?;
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}

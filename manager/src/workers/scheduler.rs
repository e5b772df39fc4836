//! Scheduler worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::scheduler::engine::{ScheduleEngine, TickOutcome};
use crate::scheduler::gate::Clock;

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between ticks
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

/// Run the scheduler worker. Returns on shutdown or once the engine halts.
pub async fn run<S, F>(
    options: &Options,
    engine: Arc<ScheduleEngine>,
    clock: Arc<dyn Clock>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Scheduler worker starting (every {:?})...", options.interval);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Scheduler worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        // Cycles run inline so they never overlap
        match engine.on_tick(clock.now()).await {
            TickOutcome::Halted => {
                error!("Scheduler halted, no further cycles until restart");
                return;
            }
            TickOutcome::Gated { .. } => {
                info!("Outside allowed schedule, task postponed");
            }
            TickOutcome::Ran { report } => {
                if !report.succeeded() {
                    let halted = engine.snapshot().await.halted;
                    if halted {
                        error!("Scheduler halted, no further cycles until restart");
                        return;
                    }
                }
            }
        }
    }
}

//! Liveness worker promoting started runners and catching dead containers

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::lifecycle::manager::AgentLifecycleManager;

#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

pub async fn run<S, F>(
    options: &Options,
    lifecycle: Arc<AgentLifecycleManager>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Liveness worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Liveness worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        for (id, state) in lifecycle.probe_liveness().await {
            debug!("Liveness: {} is now {}", id, state);
        }
    }
}

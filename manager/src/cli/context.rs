//! Configuration loading and component wiring shared by the commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;

use crate::app::state::{AppState, Collaborators};
use crate::config::schedule::ScheduleConfig;
use crate::config::schema::FullConfig;
use crate::config::store::YamlConfigStore;
use crate::logs::{init_logging, LogOptions};
use crate::models::definition::{definitions_from_config, AgentDefinition};
use crate::notify::events::NotificationEvent;
use crate::runtime::ExternalTimeouts;

/// Validated configuration file
pub struct Loaded {
    pub path: PathBuf,
    pub config: FullConfig,
    pub schedule: Option<ScheduleConfig>,
    pub definitions: Vec<AgentDefinition>,
    _log_guard: Option<WorkerGuard>,
}

impl Loaded {
    pub fn timeouts(&self) -> ExternalTimeouts {
        ExternalTimeouts::from(&self.config.manager.timeouts)
    }

    /// Wire the components against the production collaborators
    pub fn wire(&self) -> Result<(Arc<AppState>, mpsc::UnboundedReceiver<NotificationEvent>)> {
        let collaborators = Collaborators::production(&self.path)?;
        let webhooks = self.config.webhooks.clone().unwrap_or_default();
        let (state, events_rx) =
            AppState::init(&webhooks, self.schedule.clone(), self.timeouts(), collaborators);
        Ok((Arc::new(state), events_rx))
    }
}

/// Read and validate `path`, then install logging from its manager settings
pub async fn load(path: &Path) -> Result<Loaded> {
    let store = YamlConfigStore::new(path);
    let config = store
        .read_full()
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let settings = &config.manager;
    let log_guard = init_logging(LogOptions {
        log_level: settings.log_level,
        stdout: true,
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
    })?;

    let schedule = config
        .scheduler
        .as_ref()
        .map(ScheduleConfig::from_settings)
        .transpose()
        .context("invalid scheduler section")?;
    let definitions = definitions_from_config(&config).context("invalid runners section")?;
    debug!("Loaded {} runner groups", definitions.len());

    Ok(Loaded {
        path: path.to_path_buf(),
        config,
        schedule,
        definitions,
        _log_guard: log_guard,
    })
}

/// Components for a one-shot command, with notifications delivered in the background
pub struct Session {
    pub loaded: Loaded,
    pub state: Arc<AppState>,
    stop_tx: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

impl Session {
    pub async fn open(path: &Path) -> Result<Self> {
        let loaded = load(path).await?;
        let (state, events_rx) = loaded.wire()?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let dispatcher = state.spawn_dispatcher(
            events_rx,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        );

        Ok(Self {
            loaded,
            state,
            stop_tx,
            dispatcher,
        })
    }

    pub fn definitions(&self) -> &[AgentDefinition] {
        &self.loaded.definitions
    }

    /// Wait for pending notifications before the process exits
    pub async fn close(self) -> Result<()> {
        let _ = self.stop_tx.send(());
        self.dispatcher
            .await
            .context("notification dispatcher panicked")?;
        Ok(())
    }
}

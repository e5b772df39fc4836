//! Application state management

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::schedule::ScheduleConfig;
use crate::config::schema::WebhooksConfig;
use crate::config::store::{ConfigStore, YamlConfigStore};
use crate::errors::ManagerError;
use crate::lifecycle::fleet::Fleet;
use crate::lifecycle::manager::{AgentLifecycleManager, LifecycleDeps};
use crate::notify::dispatcher::{self, NotificationDispatcher, Notifier};
use crate::notify::events::NotificationEvent;
use crate::notify::transport::{ReqwestTransport, WebhookTransport};
use crate::runtime::docker::DockerCli;
use crate::runtime::github::GithubClient;
use crate::runtime::{ContainerRuntime, ExternalTimeouts, ImageBuilder, RegistryClient, TokenIssuer};
use crate::scheduler::engine::{EngineDeps, ScheduleEngine};
use crate::update::checker::ImageUpdateChecker;

/// External collaborators, swappable for tests
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub builder: Arc<dyn ImageBuilder>,
    pub registry: Arc<dyn RegistryClient>,
    pub tokens: Arc<dyn TokenIssuer>,
    pub transport: Arc<dyn WebhookTransport>,
    pub config_store: Arc<dyn ConfigStore>,
    pub credential: Option<SecretString>,
}

impl Collaborators {
    /// Docker CLI, GitHub API, reqwest webhooks and the YAML file at `config_path`
    pub fn production(config_path: &Path) -> Result<Self, ManagerError> {
        let docker = Arc::new(DockerCli::default());
        let github = Arc::new(GithubClient::new()?);

        let credential = std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .map(SecretString::from);
        if credential.is_none() {
            warn!("GITHUB_TOKEN is not set, new runners cannot register");
        }

        Ok(Self {
            runtime: docker.clone(),
            builder: docker,
            registry: github.clone(),
            tokens: github,
            transport: Arc::new(ReqwestTransport::new()?),
            config_store: Arc::new(YamlConfigStore::new(config_path)),
            credential,
        })
    }
}

/// Main application state
pub struct AppState {
    pub lifecycle: Arc<AgentLifecycleManager>,
    pub fleet: Arc<Fleet>,
    pub dispatcher: NotificationDispatcher,
    pub notifier: Notifier,
    pub checker: ImageUpdateChecker,
    pub builder: Arc<dyn ImageBuilder>,
    pub config_store: Arc<dyn ConfigStore>,
    pub engine: Option<Arc<ScheduleEngine>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the core components. The returned receiver feeds the dispatcher.
    pub fn init(
        webhooks: &WebhooksConfig,
        schedule: Option<ScheduleConfig>,
        timeouts: ExternalTimeouts,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        info!("Initializing application state...");

        let (notifier, events_rx) = dispatcher::channel();
        let dispatcher = NotificationDispatcher::new(webhooks, collaborators.transport.clone());

        let lifecycle = Arc::new(AgentLifecycleManager::new(LifecycleDeps {
            runtime: collaborators.runtime.clone(),
            tokens: collaborators.tokens.clone(),
            credential: collaborators.credential.clone(),
            notifier: notifier.clone(),
            timeouts,
        }));
        let fleet = Arc::new(Fleet::new(lifecycle.clone()));
        let checker = ImageUpdateChecker::new(collaborators.registry.clone(), timeouts.registry);

        let engine = schedule.map(|config| {
            Arc::new(ScheduleEngine::new(
                config,
                EngineDeps {
                    config_store: collaborators.config_store.clone(),
                    checker: checker.clone(),
                    builder: collaborators.builder.clone(),
                    lifecycle: lifecycle.clone(),
                    notifier: notifier.clone(),
                    timeouts,
                },
            ))
        });

        let state = Self {
            lifecycle,
            fleet,
            dispatcher,
            notifier,
            checker,
            builder: collaborators.builder,
            config_store: collaborators.config_store,
            engine,
            started_at: Utc::now(),
        };
        (state, events_rx)
    }

    /// Run the dispatcher on its own task until `shutdown_signal`
    pub fn spawn_dispatcher(
        &self,
        events_rx: mpsc::UnboundedReceiver<NotificationEvent>,
        shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(dispatcher.run(events_rx, shutdown_signal))
    }
}

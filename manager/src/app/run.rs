//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::ManagerError;
use crate::models::definition::AgentDefinition;
use crate::notify::events::NotificationEvent;
use crate::scheduler::gate::LocalClock;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{liveness, scheduler};

/// Run the manager until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    app_state: Arc<AppState>,
    definitions: Vec<AgentDefinition>,
    events_rx: mpsc::UnboundedReceiver<NotificationEvent>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ManagerError> {
    info!("Initializing runner manager...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(
        &options,
        app_state,
        &definitions,
        events_rx,
        shutdown_tx.clone(),
        &mut shutdown_manager,
    )
    .await
    {
        error!("Failed to start runner manager: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
        }
    }

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    app_state: Arc<AppState>,
    definitions: &[AgentDefinition],
    events_rx: mpsc::UnboundedReceiver<NotificationEvent>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ManagerError> {
    init_dispatcher(app_state.clone(), events_rx, shutdown_manager)?;

    // Adopt containers left by a previous process
    for definition in definitions {
        match app_state.lifecycle.discover(definition).await {
            Ok(extras) if !extras.is_empty() => warn!(
                "{} container(s) of {} exceed the configured count",
                extras.len(),
                definition.name_prefix
            ),
            Ok(_) => {}
            Err(e) => warn!("Could not discover runners of {}: {}", definition.name_prefix, e),
        }
    }

    if options.enable_liveness {
        init_liveness_worker(
            options.liveness.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_scheduler {
        init_scheduler_worker(
            options.scheduler.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    if options.enable_server {
        init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    Ok(())
}

fn init_dispatcher(
    app_state: Arc<AppState>,
    events_rx: mpsc::UnboundedReceiver<NotificationEvent>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ManagerError> {
    info!("Initializing notification dispatcher...");

    // Stopped after every other worker so their last events still go out
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = app_state.spawn_dispatcher(
        events_rx,
        Box::pin(async move {
            let _ = stop_rx.await;
        }),
    );

    shutdown_manager.with_dispatcher_handle(stop_tx, handle)
}

fn init_liveness_worker(
    options: liveness::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ManagerError> {
    info!("Initializing liveness worker...");

    let lifecycle = app_state.lifecycle.clone();
    let liveness_handle = tokio::spawn(async move {
        liveness::run(
            &options,
            lifecycle,
            |wait| tokio::time::sleep(wait),
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_liveness_worker_handle(liveness_handle)
}

fn init_scheduler_worker(
    options: scheduler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ManagerError> {
    let Some(engine) = app_state.engine.clone() else {
        warn!("Scheduler enabled without a schedule, worker not started");
        return Ok(());
    };
    info!("Initializing scheduler worker...");

    let scheduler_handle = tokio::spawn(async move {
        scheduler::run(
            &options,
            engine,
            Arc::new(LocalClock),
            |wait| tokio::time::sleep(wait),
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_scheduler_worker_handle(scheduler_handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ManagerError> {
    info!("Initializing local HTTP server...");

    let server_state = ServerState::new(
        app_state.lifecycle.clone(),
        app_state.engine.as_ref().map(|engine| engine.state_handle()),
        app_state.dispatcher.log(),
        app_state.started_at,
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct DispatcherShutdownParams {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    dispatcher: Option<DispatcherShutdownParams>,
    server_handle: Option<JoinHandle<Result<(), ManagerError>>>,
    scheduler_worker_handle: Option<JoinHandle<()>>,
    liveness_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            dispatcher: None,
            server_handle: None,
            scheduler_worker_handle: None,
            liveness_worker_handle: None,
        }
    }

    pub fn with_dispatcher_handle(
        &mut self,
        stop_tx: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    ) -> Result<(), ManagerError> {
        if self.dispatcher.is_some() {
            return Err(ManagerError::ShutdownError("dispatcher already set".to_string()));
        }
        self.dispatcher = Some(DispatcherShutdownParams { stop_tx, handle });
        Ok(())
    }

    pub fn with_scheduler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ManagerError> {
        if self.scheduler_worker_handle.is_some() {
            return Err(ManagerError::ShutdownError("scheduler_handle already set".to_string()));
        }
        self.scheduler_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_liveness_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ManagerError> {
        if self.liveness_worker_handle.is_some() {
            return Err(ManagerError::ShutdownError("liveness_handle already set".to_string()));
        }
        self.liveness_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ManagerError>>,
    ) -> Result<(), ManagerError> {
        if self.server_handle.is_some() {
            return Err(ManagerError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ManagerError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ManagerError> {
        info!("Shutting down runner manager...");

        // 1. Scheduler worker, finishing any cycle in progress
        if let Some(handle) = self.scheduler_worker_handle.take() {
            handle.await.map_err(|e| ManagerError::ShutdownError(e.to_string()))?;
        }

        // 2. Liveness worker
        if let Some(handle) = self.liveness_worker_handle.take() {
            handle.await.map_err(|e| ManagerError::ShutdownError(e.to_string()))?;
        }

        // 3. Local server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| ManagerError::ShutdownError(e.to_string()))??;
        }

        // 4. Dispatcher, draining queued notifications
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.stop_tx.send(());
            dispatcher
                .handle
                .await
                .map_err(|e| ManagerError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

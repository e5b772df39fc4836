//! Schedule engine
//!
//! Each eligible tick runs one cycle of the configured actions in the fixed
//! order check, build, deploy. A phase finishes completely before the next one
//! starts. Failed cycles are counted; reaching `max_retries` consecutive
//! failures halts the engine until the process restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::schedule::{Action, ScheduleConfig};
use crate::config::store::{ConfigStore, ImageUpdate};
use crate::errors::ManagerError;
use crate::lifecycle::fsm::RunnerState;
use crate::lifecycle::manager::AgentLifecycleManager;
use crate::models::definition::AgentDefinition;
use crate::models::image::ImageRef;
use crate::notify::dispatcher::Notifier;
use crate::notify::events::{EventKind, NotificationEvent};
use crate::runtime::{ExternalTimeouts, ImageBuilder};
use crate::scheduler::gate::{self, GateDecision};
use crate::scheduler::state::{ActionOutcome, EngineStatus, RunStateHandle, ScheduleRunState};
use crate::update::build::{build_runner_image, pull_base_image};
use crate::update::checker::{ImageUpdateChecker, UpdateCheck};

/// Collaborators of the schedule engine
#[derive(Clone)]
pub struct EngineDeps {
    pub config_store: Arc<dyn ConfigStore>,
    pub checker: ImageUpdateChecker,
    pub builder: Arc<dyn ImageBuilder>,
    pub lifecycle: Arc<AgentLifecycleManager>,
    pub notifier: Notifier,
    pub timeouts: ExternalTimeouts,
}

/// A newer base image found by the check phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingUpdate {
    pub from: String,
    pub to: String,
    pub current: Option<String>,
    pub latest: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub outcomes: BTreeMap<Action, ActionOutcome>,
    pub updates: Vec<PendingUpdate>,
    pub rebuilt: Vec<ImageUpdate>,
    pub redeployed: Vec<String>,
}

impl CycleReport {
    pub fn succeeded(&self) -> bool {
        !self.outcomes.values().any(ActionOutcome::is_failure)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tick", rename_all = "snake_case")]
pub enum TickOutcome {
    Halted,
    Gated { decision: GateDecision },
    Ran { report: CycleReport },
}

pub struct ScheduleEngine {
    config: ScheduleConfig,
    deps: EngineDeps,
    state: Arc<RwLock<ScheduleRunState>>,
}

impl ScheduleEngine {
    pub fn new(config: ScheduleConfig, deps: EngineDeps) -> Self {
        let state = ScheduleRunState {
            max_retries: config.max_retries,
            ..Default::default()
        };
        Self {
            config,
            deps,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn state_handle(&self) -> RunStateHandle {
        RunStateHandle::new(self.state.clone())
    }

    pub async fn snapshot(&self) -> ScheduleRunState {
        self.state.read().await.clone()
    }

    /// Handle one tick of the scheduler clock
    pub async fn on_tick(&self, now: NaiveDateTime) -> TickOutcome {
        if self.state.read().await.halted {
            debug!("Scheduler halted, tick ignored");
            return TickOutcome::Halted;
        }

        let decision = gate::evaluate(&self.config, now);
        if !decision.is_open() {
            debug!("Tick at {} gated: {:?}", now, decision);
            let mut state = self.state.write().await;
            state.status = EngineStatus::GatedWait;
            state.last_gated_at = Some(Utc::now());
            return TickOutcome::Gated { decision };
        }

        self.state.write().await.status = EngineStatus::RunningCycle;
        info!("Running scheduled cycle at {}", now.format("%H:%M:%S"));

        let report = self.run_cycle().await;
        self.finish_cycle(&report).await;
        TickOutcome::Ran { report }
    }

    async fn finish_cycle(&self, report: &CycleReport) {
        let mut state = self.state.write().await;
        state.cycles_run += 1;
        state.last_run_at = Some(Utc::now());
        state.last_outcomes = report.outcomes.clone();

        if report.succeeded() {
            state.consecutive_failures = 0;
            state.status = EngineStatus::Idle;
            info!("Cycle completed successfully");
            return;
        }

        state.consecutive_failures += 1;
        warn!(
            "Cycle failed ({}/{})",
            state.consecutive_failures, self.config.max_retries
        );

        if state.consecutive_failures >= self.config.max_retries {
            state.halted = true;
            state.status = EngineStatus::Halted;
            error!(
                "Maximum retry count reached ({}), scheduler halted",
                self.config.max_retries
            );
            self.deps.notifier.publish(
                NotificationEvent::new(EventKind::UpdateError)
                    .with("runner_type", "scheduler")
                    .with(
                        "error_message",
                        format!(
                            "Scheduler halted after {} consecutive failed cycles",
                            state.consecutive_failures
                        ),
                    )
                    .with("consecutive_failures", state.consecutive_failures)
                    .with("fatal", true),
            );
        } else {
            state.status = EngineStatus::Idle;
        }
    }

    async fn load_definitions(&self) -> Result<Vec<AgentDefinition>, ManagerError> {
        Ok(self.deps.config_store.load().await?.definitions)
    }

    async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let definitions = match self.load_definitions().await {
            Ok(definitions) => definitions,
            Err(e) => {
                error!("Could not load runner definitions: {}", e);
                for action in &self.config.actions {
                    report
                        .outcomes
                        .insert(*action, ActionOutcome::failed(e.to_string()));
                }
                return report;
            }
        };

        for action in &self.config.actions {
            let outcome = match action {
                Action::Check => {
                    let (outcome, updates) = self.check(&definitions).await;
                    report.updates = updates;
                    outcome
                }
                Action::Build => {
                    let (outcome, rebuilt) = self.build(&definitions, &report.updates).await;
                    report.rebuilt = rebuilt;
                    outcome
                }
                Action::Deploy => {
                    let (outcome, redeployed) = self.deploy(&report.rebuilt).await;
                    report.redeployed = redeployed;
                    outcome
                }
            };
            debug!("Action {}: {:?}", action, outcome);
            report.outcomes.insert(*action, outcome);
        }

        report
    }

    /// One registry check per distinct base image
    async fn check(&self, definitions: &[AgentDefinition]) -> (ActionOutcome, Vec<PendingUpdate>) {
        let images: BTreeSet<&str> = definitions.iter().map(|d| d.base_image.as_str()).collect();
        let mut updates = Vec::new();
        let mut failures = Vec::new();

        for image in images {
            match self.deps.checker.check(image).await {
                UpdateCheck::UpToDate { current } => {
                    info!("{} is up to date ({})", image, current.as_deref().unwrap_or("unversioned"));
                }
                UpdateCheck::Available {
                    current,
                    latest,
                    new_image,
                } => {
                    info!("New version available for {}: {}", image, latest);
                    let repository = ImageRef::parse(image).repository;
                    self.deps.notifier.publish(
                        NotificationEvent::new(EventKind::UpdateAvailable)
                            .with("runner_type", "base")
                            .with("image_name", repository)
                            .with("current_version", current.clone().unwrap_or_default())
                            .with("new_version", latest.clone())
                            .with("new_image", new_image.clone())
                            .with("auto_update", self.config.has(Action::Build)),
                    );
                    updates.push(PendingUpdate {
                        from: image.to_string(),
                        to: new_image,
                        current,
                        latest,
                    });
                }
                UpdateCheck::Failed { reason } => {
                    self.deps.notifier.publish(
                        NotificationEvent::new(EventKind::UpdateError)
                            .with("runner_type", "base")
                            .with("image_name", image)
                            .with("error_message", reason.clone()),
                    );
                    failures.push(format!("{}: {}", image, reason));
                }
            }
        }

        let outcome = if failures.is_empty() {
            ActionOutcome::Succeeded
        } else {
            ActionOutcome::failed(failures.join("; "))
        };
        (outcome, updates)
    }

    /// Rebuild every bound definition per updated image; groups without a
    /// Dockerfile get one pull of the new base. An image is persisted only when
    /// all of its builds succeeded; images do not affect each other.
    async fn build(
        &self,
        definitions: &[AgentDefinition],
        updates: &[PendingUpdate],
    ) -> (ActionOutcome, Vec<ImageUpdate>) {
        if updates.is_empty() {
            return (ActionOutcome::skipped("no pending update"), Vec::new());
        }

        let mut rebuilt = Vec::new();
        let mut failures = Vec::new();

        for update in updates {
            let bound: Vec<&AgentDefinition> = definitions
                .iter()
                .filter(|d| d.base_image == update.from)
                .collect();

            if bound.is_empty() {
                continue;
            }

            let mut image_ok = true;
            let pulled: Vec<&str> = bound
                .iter()
                .filter(|d| d.build_image.is_none())
                .map(|d| d.id.as_str())
                .collect();
            if !pulled.is_empty() {
                if let Err(e) = pull_base_image(
                    self.deps.builder.as_ref(),
                    &self.deps.notifier,
                    self.deps.timeouts.build,
                    &pulled,
                    &update.to,
                )
                .await
                {
                    failures.push(format!("{}: {}", pulled.join(", "), e));
                    image_ok = false;
                }
            }

            for definition in bound.iter().filter(|d| d.build_image.is_some()) {
                if let Err(e) = build_runner_image(
                    self.deps.builder.as_ref(),
                    &self.deps.notifier,
                    self.deps.timeouts.build,
                    definition,
                    &update.to,
                )
                .await
                {
                    failures.push(format!("{}: {}", definition.id, e));
                    image_ok = false;
                }
            }

            if !image_ok {
                warn!("Keeping {} since some builds failed", update.from);
                continue;
            }

            let image_update = ImageUpdate {
                from: update.from.clone(),
                to: update.to.clone(),
            };
            if let Err(e) = self
                .deps
                .config_store
                .persist(std::slice::from_ref(&image_update))
                .await
            {
                self.deps.notifier.publish(
                    NotificationEvent::new(EventKind::UpdateError)
                        .with("runner_type", "base")
                        .with("image_name", update.from.clone())
                        .with("error_message", e.to_string()),
                );
                failures.push(format!("persist {}: {}", update.to, e));
                continue;
            }

            let repository = ImageRef::parse(&update.from).repository;
            let from_version = update.current.clone().unwrap_or_default();
            let affected = bound.iter().map(|d| d.id.as_str()).collect::<Vec<_>>().join(", ");

            info!("base_image updated to {}", update.to);
            self.deps.notifier.publish(
                NotificationEvent::new(EventKind::ImageUpdated)
                    .with("runner_type", "base")
                    .with("image_name", repository.clone())
                    .with("from_version", from_version.clone())
                    .with("to_version", update.latest.clone()),
            );
            self.deps.notifier.publish(
                NotificationEvent::new(EventKind::UpdateApplied)
                    .with("runner_type", "base")
                    .with("image_name", repository)
                    .with("old_version", from_version)
                    .with("new_version", update.latest.clone())
                    .with("affected_runners", affected),
            );
            rebuilt.push(image_update);
        }

        let outcome = if failures.is_empty() {
            ActionOutcome::Succeeded
        } else {
            ActionOutcome::failed(failures.join("; "))
        };
        (outcome, rebuilt)
    }

    /// Recreate every instance bound to a rebuilt image
    async fn deploy(&self, rebuilt: &[ImageUpdate]) -> (ActionOutcome, Vec<String>) {
        if rebuilt.is_empty() {
            return (ActionOutcome::skipped("nothing rebuilt"), Vec::new());
        }

        let definitions = match self.load_definitions().await {
            Ok(definitions) => definitions,
            Err(e) => return (ActionOutcome::failed(e.to_string()), Vec::new()),
        };

        let from: Vec<String> = rebuilt.iter().map(|u| u.from.clone()).collect();
        let ids = self.deps.lifecycle.instances_for_images(&from).await;

        let mut redeployed = Vec::new();
        let mut failures = Vec::new();

        for id in ids {
            match self.redeploy(&id, &definitions).await {
                Ok(Some(new_id)) => redeployed.push(new_id),
                Ok(None) => {}
                Err(e) => {
                    error!("Redeploy of {} failed: {}", id, e);
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        let outcome = if failures.is_empty() {
            ActionOutcome::Succeeded
        } else {
            ActionOutcome::failed(failures.join("; "))
        };
        (outcome, redeployed)
    }

    /// stop, remove, create in the same slot, start
    async fn redeploy(&self, id: &str, definitions: &[AgentDefinition]) -> Result<Option<String>, ManagerError> {
        let lifecycle = &self.deps.lifecycle;
        let instance = lifecycle.get(id).await?;

        let Some(definition) = definitions.iter().find(|d| d.id == instance.definition_id) else {
            warn!("{} no longer has a definition, leaving it alone", id);
            return Ok(None);
        };

        if instance.state() == RunnerState::Created {
            lifecycle.retarget(id, &definition.runtime_image()).await?;
            lifecycle.start(id).await?;
            return Ok(Some(id.to_string()));
        }

        if instance.state().is_active() {
            lifecycle.stop(id).await?;
        }
        lifecycle.remove(id, false).await?;

        if instance.slot > definition.nb {
            info!("{} is above the desired count, not recreated", id);
            return Ok(None);
        }

        let fresh = lifecycle.create_slot(definition, instance.slot).await?;
        lifecycle.start(&fresh.id).await?;
        info!("{} redeployed on {}", fresh.id, fresh.image);
        Ok(Some(fresh.id))
    }
}

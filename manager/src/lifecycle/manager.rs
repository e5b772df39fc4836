//! Agent lifecycle manager
//!
//! Owns the table of runner instances. Every state change goes through the
//! instance's [`RunnerFsm`]; operations on one id are serialized by a per-instance
//! mutex while different ids proceed in parallel.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{with_timeout, ManagerError};
use crate::lifecycle::fsm::{InvalidTransition, RunnerEvent, RunnerFsm, RunnerState};
use crate::models::definition::AgentDefinition;
use crate::models::image::ImageRef;
use crate::models::instance::AgentInstance;
use crate::notify::dispatcher::Notifier;
use crate::notify::events::{EventKind, NotificationEvent};
use crate::runtime::{ContainerHandle, ContainerRuntime, ExternalTimeouts, RunSpec, RuntimeState, TokenIssuer};
use crate::utils::format_uptime;

/// Result of an operation that may legitimately do nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    Done { state: RunnerState },
    Skipped { reason: String },
}

/// Collaborators of the lifecycle manager
#[derive(Clone)]
pub struct LifecycleDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub tokens: Arc<dyn TokenIssuer>,
    /// GitHub credential used to request registration tokens
    pub credential: Option<SecretString>,
    pub notifier: Notifier,
    pub timeouts: ExternalTimeouts,
}

type Entry = Arc<Mutex<AgentInstance>>;

pub struct AgentLifecycleManager {
    deps: LifecycleDeps,
    instances: RwLock<HashMap<String, Entry>>,
    retired: RwLock<HashSet<String>>,
}

fn conflict(id: &str, err: InvalidTransition) -> ManagerError {
    ManagerError::StateConflict {
        id: id.to_string(),
        from: err.from.to_string(),
        to: err.to.to_string(),
    }
}

impl AgentLifecycleManager {
    pub fn new(deps: LifecycleDeps) -> Self {
        Self {
            deps,
            instances: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashSet::new()),
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.deps.notifier
    }

    async fn entry(&self, id: &str) -> Result<Entry, ManagerError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    async fn is_retired(&self, id: &str) -> bool {
        self.retired.read().await.contains(id)
    }

    /// The entry of `id`, or `None` when it has been removed
    async fn live_entry(&self, id: &str) -> Result<Option<Entry>, ManagerError> {
        match self.entry(id).await {
            Ok(entry) => Ok(Some(entry)),
            Err(ManagerError::NotFound(_)) if self.is_retired(id).await => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn new_instance(definition: &AgentDefinition, slot: u32) -> AgentInstance {
        let now = Utc::now();
        AgentInstance {
            id: definition.instance_name(slot),
            definition_id: definition.id.clone(),
            slot,
            container: None,
            image: definition.runtime_image(),
            base_image: definition.base_image.clone(),
            labels: definition.labels.clone(),
            org_url: definition.org_url.clone(),
            fsm: RunnerFsm::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    async fn insert(&self, instance: AgentInstance) -> Result<AgentInstance, ManagerError> {
        let mut table = self.instances.write().await;
        if table.contains_key(&instance.id) {
            return Err(ManagerError::CapacityConflict(format!(
                "{} already exists",
                instance.id
            )));
        }
        self.retired.write().await.remove(&instance.id);
        table.insert(instance.id.clone(), Arc::new(Mutex::new(instance.clone())));
        Ok(instance)
    }

    /// Create a record in the lowest free slot of `definition`
    pub async fn create(&self, definition: &AgentDefinition) -> Result<AgentInstance, ManagerError> {
        let mut table = self.instances.write().await;
        let slot = (1..=definition.nb)
            .find(|slot| !table.contains_key(&definition.instance_name(*slot)))
            .ok_or_else(|| {
                ManagerError::CapacityConflict(format!(
                    "{}: all {} slots are in use",
                    definition.id, definition.nb
                ))
            })?;

        let instance = Self::new_instance(definition, slot);
        self.retired.write().await.remove(&instance.id);
        table.insert(instance.id.clone(), Arc::new(Mutex::new(instance.clone())));
        debug!("Created record {}", instance.id);
        Ok(instance)
    }

    /// Create a record in an explicit slot
    pub async fn create_slot(
        &self,
        definition: &AgentDefinition,
        slot: u32,
    ) -> Result<AgentInstance, ManagerError> {
        let instance = self.insert(Self::new_instance(definition, slot)).await?;
        debug!("Created record {}", instance.id);
        Ok(instance)
    }

    /// Register a container found at startup, replaying a valid path to its observed state
    pub async fn adopt(
        &self,
        definition: &AgentDefinition,
        slot: u32,
        observed: RuntimeState,
    ) -> Result<AgentInstance, ManagerError> {
        let id = definition.instance_name(slot);
        if let Ok(entry) = self.entry(&id).await {
            return Ok(entry.lock().await.clone());
        }

        let mut instance = Self::new_instance(definition, slot);
        instance.container = Some(ContainerHandle {
            name: id.clone(),
            reused: true,
        });

        let path = match observed {
            RuntimeState::Running => vec![RunnerEvent::Start, RunnerEvent::Run],
            RuntimeState::Exited => vec![RunnerEvent::Start, RunnerEvent::Stop],
            RuntimeState::Missing => Vec::new(),
        };
        for event in path {
            instance.fsm.process(event).map_err(|e| conflict(&id, e))?;
        }
        if observed == RuntimeState::Running {
            instance.started_at = Some(Utc::now());
        }

        let instance = self.insert(instance).await?;
        debug!("Adopted {} as {}", id, instance.state());
        Ok(instance)
    }

    /// Replace the image of a record that has never been started
    pub async fn retarget(&self, id: &str, image: &str) -> Result<(), ManagerError> {
        let entry = self.entry(id).await?;
        let mut instance = entry.lock().await;
        if instance.state() != RunnerState::Created {
            return Err(ManagerError::StateConflict {
                id: id.to_string(),
                from: instance.state().to_string(),
                to: RunnerState::Created.to_string(),
            });
        }
        instance.image = image.to_string();
        instance.updated_at = Utc::now();
        Ok(())
    }

    /// `created|stopped|error -> started`
    pub async fn start(&self, id: &str) -> Result<OperationOutcome, ManagerError> {
        if self.is_retired(id).await {
            return Err(ManagerError::StateConflict {
                id: id.to_string(),
                from: RunnerState::Removed.to_string(),
                to: RunnerState::Started.to_string(),
            });
        }
        let entry = self.entry(id).await?;
        let mut instance = entry.lock().await;
        instance
            .fsm
            .check(&RunnerEvent::Start)
            .map_err(|e| conflict(id, e))?;

        match self.launch(&instance).await {
            Ok(handle) => {
                let restarted = handle.reused;
                instance.container = Some(handle);
                let state = instance
                    .fsm
                    .process(RunnerEvent::Start)
                    .map_err(|e| conflict(id, e))?;
                let now = Utc::now();
                instance.started_at = Some(now);
                instance.updated_at = now;

                info!("Runner {} started", id);
                self.deps.notifier.publish(
                    NotificationEvent::new(EventKind::RunnerStarted)
                        .with("runner_id", instance.runner_id())
                        .with("runner_name", instance.id.clone())
                        .with("labels", instance.labels.join(", "))
                        .with("image", instance.image.clone())
                        .with("restarted", restarted),
                );
                Ok(OperationOutcome::Done { state })
            }
            Err(e) => {
                self.fail_locked(&mut instance, &e.to_string());
                Err(e)
            }
        }
    }

    /// Start the container of `instance`, registering a new runner when none exists
    async fn launch(&self, instance: &AgentInstance) -> Result<ContainerHandle, ManagerError> {
        let timeout = self.deps.timeouts.runtime;

        if let Some(handle) = &instance.container {
            let observed = with_timeout("inspect", timeout, self.deps.runtime.inspect(handle)).await?;
            if observed != RuntimeState::Missing {
                let spec = RunSpec {
                    name: instance.id.clone(),
                    image: instance.image.clone(),
                    env: BTreeMap::new(),
                    command: String::new(),
                };
                return with_timeout("container start", timeout, self.deps.runtime.start_container(&spec))
                    .await;
            }
            debug!("Container {} vanished, registering again", instance.id);
        }

        let credential = self.deps.credential.as_ref().ok_or_else(|| {
            ManagerError::ConfigError("GITHUB_TOKEN is not set".to_string())
        })?;
        let token = with_timeout(
            "registration token",
            self.deps.timeouts.token,
            self.deps.tokens.issue_registration_token(&instance.org_url, credential),
        )
        .await?;

        let spec = registration_spec(instance, &token);
        with_timeout("container start", timeout, self.deps.runtime.start_container(&spec)).await
    }

    /// `started -> running`
    pub async fn mark_running(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self.entry(id).await?;
        let mut instance = entry.lock().await;
        instance
            .fsm
            .process(RunnerEvent::Run)
            .map_err(|e| conflict(id, e))?;
        instance.updated_at = Utc::now();
        debug!("Runner {} is running", id);
        Ok(())
    }

    fn skipped(&self, runner_name: &str, operation: &str, reason: &str) -> OperationOutcome {
        debug!("Skipping {} of {}: {}", operation, runner_name, reason);
        self.deps.notifier.publish(
            NotificationEvent::new(EventKind::RunnerSkipped)
                .with("runner_name", runner_name)
                .with("operation", operation)
                .with("reason", reason),
        );
        OperationOutcome::Skipped {
            reason: reason.to_string(),
        }
    }

    /// `started|running -> stopped`; already stopped or removed is a skip
    pub async fn stop(&self, id: &str) -> Result<OperationOutcome, ManagerError> {
        let Some(entry) = self.live_entry(id).await? else {
            return Ok(self.skipped(id, "stop", "Removed"));
        };
        let mut instance = entry.lock().await;

        match instance.state() {
            RunnerState::Stopped => return Ok(self.skipped(id, "stop", "Not running")),
            RunnerState::Removed => return Ok(self.skipped(id, "stop", "Removed")),
            _ => {}
        }
        instance
            .fsm
            .check(&RunnerEvent::Stop)
            .map_err(|e| conflict(id, e))?;

        if let Some(handle) = instance.container.clone() {
            let result = with_timeout(
                "container stop",
                self.deps.timeouts.runtime,
                self.deps.runtime.stop_container(&handle),
            )
            .await;
            if let Err(e) = result {
                self.fail_locked(&mut instance, &e.to_string());
                return Err(e);
            }
        }

        let state = instance
            .fsm
            .process(RunnerEvent::Stop)
            .map_err(|e| conflict(id, e))?;
        let now = Utc::now();
        let uptime = instance
            .uptime(now)
            .map(format_uptime)
            .unwrap_or_else(|| "unknown".to_string());
        instance.started_at = None;
        instance.updated_at = now;

        info!("Runner {} stopped after {}", id, uptime);
        self.deps.notifier.publish(
            NotificationEvent::new(EventKind::RunnerStopped)
                .with("runner_id", instance.runner_id())
                .with("runner_name", instance.id.clone())
                .with("uptime", uptime),
        );
        Ok(OperationOutcome::Done { state })
    }

    /// `stopped|error -> removed`. The record is dropped and its id retired.
    pub async fn remove(&self, id: &str, keep_container: bool) -> Result<OperationOutcome, ManagerError> {
        let Some(entry) = self.live_entry(id).await? else {
            return Ok(self.skipped(id, "remove", "Removed"));
        };
        let mut instance = entry.lock().await;

        if instance.state() == RunnerState::Removed {
            return Ok(self.skipped(id, "remove", "Removed"));
        }
        instance
            .fsm
            .check(&RunnerEvent::Remove)
            .map_err(|e| conflict(id, e))?;

        if !keep_container {
            if let Some(handle) = instance.container.clone() {
                let result = with_timeout(
                    "container remove",
                    self.deps.timeouts.runtime,
                    self.deps.runtime.remove_container(&handle),
                )
                .await;
                if let Err(e) = result {
                    self.fail_locked(&mut instance, &e.to_string());
                    return Err(e);
                }
            }
        }

        let state = instance
            .fsm
            .process(RunnerEvent::Remove)
            .map_err(|e| conflict(id, e))?;
        instance.updated_at = Utc::now();

        {
            let mut table = self.instances.write().await;
            table.remove(id);
            self.retired.write().await.insert(id.to_string());
        }

        info!("Runner {} removed", id);
        self.deps.notifier.publish(
            NotificationEvent::new(EventKind::RunnerRemoved)
                .with("runner_id", instance.runner_id())
                .with("runner_name", instance.id.clone())
                .with("keep_container", keep_container),
        );
        Ok(OperationOutcome::Done { state })
    }

    /// Force a record into `error`
    pub async fn mark_error(&self, id: &str, cause: &str) -> Result<(), ManagerError> {
        if self.is_retired(id).await {
            return Err(ManagerError::StateConflict {
                id: id.to_string(),
                from: RunnerState::Removed.to_string(),
                to: RunnerState::Error.to_string(),
            });
        }
        let entry = self.entry(id).await?;
        let mut instance = entry.lock().await;
        instance
            .fsm
            .check(&RunnerEvent::Fail(cause.to_string()))
            .map_err(|e| conflict(id, e))?;
        self.fail_locked(&mut instance, cause);
        Ok(())
    }

    fn fail_locked(&self, instance: &mut AgentInstance, cause: &str) {
        if let Err(e) = instance.fsm.process(RunnerEvent::Fail(cause.to_string())) {
            warn!("{} cannot enter error from {}", instance.id, e.from);
            return;
        }
        instance.updated_at = Utc::now();

        warn!("Runner {} failed: {}", instance.id, cause);
        self.deps.notifier.publish(
            NotificationEvent::new(EventKind::RunnerError)
                .with("runner_id", instance.runner_id())
                .with("runner_name", instance.id.clone())
                .with("error_message", cause),
        );
    }

    /// Inspect active containers, promoting started ones and failing dead ones.
    ///
    /// Returns the ids whose state changed.
    pub async fn probe_liveness(&self) -> Vec<(String, RunnerState)> {
        let mut changed = Vec::new();

        for instance in self.list().await {
            if !instance.state().is_active() {
                continue;
            }
            let Some(handle) = instance.container.as_ref() else {
                continue;
            };

            let observed = match with_timeout(
                "inspect",
                self.deps.timeouts.runtime,
                self.deps.runtime.inspect(handle),
            )
            .await
            {
                Ok(observed) => observed,
                Err(e) => {
                    warn!("Liveness probe of {} failed: {}", instance.id, e);
                    continue;
                }
            };

            let result = match (instance.state(), observed) {
                (RunnerState::Started, RuntimeState::Running) => self
                    .mark_running(&instance.id)
                    .await
                    .map(|_| RunnerState::Running),
                (_, RuntimeState::Exited) => self
                    .mark_error(&instance.id, "container exited")
                    .await
                    .map(|_| RunnerState::Error),
                (_, RuntimeState::Missing) => self
                    .mark_error(&instance.id, "container missing")
                    .await
                    .map(|_| RunnerState::Error),
                _ => continue,
            };

            match result {
                Ok(state) => changed.push((instance.id.clone(), state)),
                // The record moved on since the snapshot
                Err(e) => debug!("Liveness update of {} skipped: {}", instance.id, e),
            }
        }

        changed
    }

    /// Adopt the existing containers of `definition`. Returns the names of
    /// containers whose slot is above `nb`.
    pub async fn discover(&self, definition: &AgentDefinition) -> Result<Vec<(u32, String)>, ManagerError> {
        let prefix = format!("{}-", definition.name_prefix);
        let names = with_timeout(
            "container list",
            self.deps.timeouts.runtime,
            self.deps.runtime.list(&prefix),
        )
        .await?;

        let mut extras = Vec::new();
        for name in names {
            let Some(slot) = definition.slot_of(&name) else {
                continue;
            };
            let handle = ContainerHandle {
                name: name.clone(),
                reused: true,
            };
            let observed = with_timeout(
                "inspect",
                self.deps.timeouts.runtime,
                self.deps.runtime.inspect(&handle),
            )
            .await?;
            if observed == RuntimeState::Missing {
                continue;
            }
            self.adopt(definition, slot, observed).await?;
            if slot > definition.nb {
                extras.push((slot, name));
            }
        }
        extras.sort();
        Ok(extras)
    }

    /// Snapshot of every record, ordered by id
    pub async fn list(&self) -> Vec<AgentInstance> {
        let entries: Vec<Entry> = self.instances.read().await.values().cloned().collect();
        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            instances.push(entry.lock().await.clone());
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    pub async fn get(&self, id: &str) -> Result<AgentInstance, ManagerError> {
        let entry = self.entry(id).await?;
        let instance = entry.lock().await.clone();
        Ok(instance)
    }

    /// Ids of records running on any of `base_images`, compared by repository
    pub async fn instances_for_images(&self, base_images: &[String]) -> Vec<String> {
        let repositories: HashSet<String> = base_images
            .iter()
            .map(|image| ImageRef::parse(image).repository)
            .collect();

        self.list()
            .await
            .into_iter()
            .filter(|instance| repositories.contains(&ImageRef::parse(&instance.base_image).repository))
            .map(|instance| instance.id)
            .collect()
    }
}

/// Run spec registering a fresh runner with `token`
fn registration_spec(instance: &AgentInstance, token: &SecretString) -> RunSpec {
    let labels = instance.labels.join(",");
    let token = token.expose_secret();

    let mut env = BTreeMap::new();
    env.insert("RUNNER_NAME".to_string(), instance.id.clone());
    env.insert("RUNNER_REPO".to_string(), instance.org_url.clone());
    env.insert("RUNNER_TOKEN".to_string(), token.to_string());
    env.insert("RUNNER_LABELS".to_string(), labels.clone());

    RunSpec {
        name: instance.id.clone(),
        image: instance.image.clone(),
        env,
        command: format!(
            "./config.sh --url {} --token {} --name {} --labels {} --unattended && ./run.sh",
            instance.org_url, token, instance.id, labels
        ),
    }
}

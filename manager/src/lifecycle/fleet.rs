//! Fleet-wide operations over every runner group

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::ManagerError;
use crate::lifecycle::fsm::RunnerState;
use crate::lifecycle::manager::{AgentLifecycleManager, OperationOutcome};
use crate::models::definition::AgentDefinition;

/// One runner touched by a fleet operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RunnerRef {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reason: None,
        }
    }

    fn because(name: &str, reason: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

/// Per-runner outcome buckets of a fleet operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetReport {
    pub started: Vec<RunnerRef>,
    pub restarted: Vec<RunnerRef>,
    pub running: Vec<RunnerRef>,
    pub stopped: Vec<RunnerRef>,
    pub removed: Vec<RunnerRef>,
    pub skipped: Vec<RunnerRef>,
    pub errors: Vec<RunnerRef>,
}

impl FleetReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerListing {
    pub slot: u32,
    pub name: String,
    pub status: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupListing {
    pub id: String,
    pub prefix: String,
    pub total: u32,
    pub running: u32,
    pub runners: Vec<RunnerListing>,
    /// Containers above `nb`, removed by the next start
    pub extra_runners: Vec<RunnerListing>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetListing {
    pub groups: Vec<GroupListing>,
    pub total_count: u32,
    pub total_running: u32,
}

pub struct Fleet {
    manager: Arc<AgentLifecycleManager>,
}

impl Fleet {
    pub fn new(manager: Arc<AgentLifecycleManager>) -> Self {
        Self { manager }
    }

    /// Stop if active, then remove
    async fn retire(&self, id: &str) -> Result<(), ManagerError> {
        let instance = self.manager.get(id).await?;
        if instance.state().is_active() {
            self.manager.stop(id).await?;
        }
        self.manager.remove(id, false).await?;
        Ok(())
    }

    /// Ensure slots `1..=nb` of every group exist and are started; remove slots above `nb`
    pub async fn start_all(&self, definitions: &[AgentDefinition]) -> FleetReport {
        let mut report = FleetReport::default();

        for definition in definitions {
            let extras = match self.manager.discover(definition).await {
                Ok(extras) => extras,
                Err(e) => {
                    report
                        .errors
                        .push(RunnerRef::because(&definition.name_prefix, e));
                    continue;
                }
            };

            for (_, name) in extras {
                match self.retire(&name).await {
                    Ok(()) => report.removed.push(RunnerRef::named(&name)),
                    Err(e) => report.errors.push(RunnerRef::because(&name, e)),
                }
            }

            for slot in 1..=definition.nb {
                let name = definition.instance_name(slot);
                if let Err(e) = self.ensure_started(definition, slot, &name, &mut report).await {
                    report.errors.push(RunnerRef::because(&name, e));
                }
            }
        }

        info!(
            "Start: {} started, {} restarted, {} running, {} removed, {} errors",
            report.started.len(),
            report.restarted.len(),
            report.running.len(),
            report.removed.len(),
            report.errors.len()
        );
        report
    }

    async fn ensure_started(
        &self,
        definition: &AgentDefinition,
        slot: u32,
        name: &str,
        report: &mut FleetReport,
    ) -> Result<(), ManagerError> {
        let existing = match self.manager.get(name).await {
            Ok(instance) => Some(instance),
            Err(ManagerError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let fresh = match existing {
            Some(instance) if instance.state().is_active() => {
                report.running.push(RunnerRef::named(name));
                return Ok(());
            }
            Some(instance) => instance.state() == RunnerState::Created,
            None => {
                self.manager.create_slot(definition, slot).await?;
                true
            }
        };

        self.manager.start(name).await?;
        let reused = self
            .manager
            .get(name)
            .await?
            .container
            .map(|handle| handle.reused)
            .unwrap_or(false);

        if fresh && !reused {
            report.started.push(RunnerRef::named(name));
        } else {
            report.restarted.push(RunnerRef::named(name));
        }
        Ok(())
    }

    /// Stop every configured slot concurrently
    pub async fn stop_all(&self, definitions: &[AgentDefinition]) -> FleetReport {
        let mut report = FleetReport::default();
        let names = self.configured_names(definitions, &mut report).await;

        let results = join_all(names.iter().map(|name| self.manager.stop(name))).await;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(OperationOutcome::Done { .. }) => report.stopped.push(RunnerRef::named(name)),
                Ok(OperationOutcome::Skipped { reason }) => {
                    report.skipped.push(RunnerRef::because(name, reason))
                }
                Err(ManagerError::NotFound(_)) => report
                    .skipped
                    .push(RunnerRef::because(name, "Container not found")),
                Err(e) => report.errors.push(RunnerRef::because(name, e)),
            }
        }
        report
    }

    /// Deregister and delete every configured slot
    pub async fn remove_all(&self, definitions: &[AgentDefinition]) -> FleetReport {
        let mut report = FleetReport::default();
        let names = self.configured_names(definitions, &mut report).await;

        let results = join_all(names.iter().map(|name| self.retire(name))).await;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(()) => report.removed.push(RunnerRef::named(name)),
                Err(ManagerError::NotFound(_)) => report
                    .skipped
                    .push(RunnerRef::because(name, "Container not found")),
                Err(e) => report.errors.push(RunnerRef::because(name, e)),
            }
        }
        report
    }

    async fn configured_names(
        &self,
        definitions: &[AgentDefinition],
        report: &mut FleetReport,
    ) -> Vec<String> {
        let mut names = Vec::new();
        for definition in definitions {
            if let Err(e) = self.manager.discover(definition).await {
                warn!("Could not list containers of {}: {}", definition.name_prefix, e);
                report
                    .errors
                    .push(RunnerRef::because(&definition.name_prefix, e));
                continue;
            }
            names.extend((1..=definition.nb).map(|slot| definition.instance_name(slot)));
        }
        names
    }

    /// Per-group status table
    pub async fn listing(&self, definitions: &[AgentDefinition]) -> Result<FleetListing, ManagerError> {
        let mut listing = FleetListing::default();

        for definition in definitions {
            let extras = self.manager.discover(definition).await?;
            let mut group = GroupListing {
                id: definition.id.clone(),
                prefix: definition.name_prefix.clone(),
                total: definition.nb,
                running: 0,
                runners: Vec::new(),
                extra_runners: Vec::new(),
            };

            for slot in 1..=definition.nb {
                let name = definition.instance_name(slot);
                let status = match self.manager.get(&name).await {
                    Ok(instance) => {
                        if instance.state().is_active() {
                            group.running += 1;
                        }
                        instance.state().to_string()
                    }
                    Err(_) => "absent".to_string(),
                };
                group.runners.push(RunnerListing {
                    slot,
                    name,
                    status,
                    labels: definition.labels.clone(),
                });
            }

            for (slot, name) in extras {
                let active = self
                    .manager
                    .get(&name)
                    .await
                    .map(|instance| instance.state().is_active())
                    .unwrap_or(false);
                group.extra_runners.push(RunnerListing {
                    slot,
                    name,
                    status: if active {
                        "running_will_be_removed".to_string()
                    } else {
                        "will_be_removed".to_string()
                    },
                    labels: definition.labels.clone(),
                });
            }

            listing.total_count += group.total;
            listing.total_running += group.running;
            listing.groups.push(group);
        }

        Ok(listing)
    }
}

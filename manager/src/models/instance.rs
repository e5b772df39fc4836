//! Runner instance records

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lifecycle::fsm::{RunnerFsm, RunnerState};
use crate::runtime::ContainerHandle;

/// One concrete runner container tracked by the lifecycle manager
#[derive(Debug, Clone, Serialize)]
pub struct AgentInstance {
    /// Container name, `{name_prefix}-{slot}`
    pub id: String,
    pub definition_id: String,
    pub slot: u32,
    pub container: Option<ContainerHandle>,
    pub image: String,
    pub base_image: String,
    pub labels: Vec<String>,
    pub org_url: String,
    #[serde(flatten)]
    pub(crate) fsm: RunnerFsm,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    pub fn state(&self) -> RunnerState {
        self.fsm.state()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.fsm.error()
    }

    pub fn history(&self) -> &[RunnerState] {
        self.fsm.history()
    }

    /// `{definition_id}-{slot}`, as shown in notifications
    pub fn runner_id(&self) -> String {
        format!("{}-{}", self.definition_id, self.slot)
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|started| now - started)
    }
}

//! Scheduler run state

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::schedule::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineStatus {
    #[default]
    Idle,
    GatedWait,
    RunningCycle,
    Halted,
}

/// Result of one action in the last cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Skipped { reason: String },
    Failed { reason: String },
}

impl ActionOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ActionOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        ActionOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ActionOutcome::Failed { .. })
    }
}

/// Engine-owned scheduling context. Observers get clones.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleRunState {
    pub status: EngineStatus,
    pub consecutive_failures: u32,
    pub max_retries: u32,
    pub halted: bool,
    pub cycles_run: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_gated_at: Option<DateTime<Utc>>,
    pub last_outcomes: BTreeMap<Action, ActionOutcome>,
}

/// Read-only view of the run state for the status surface
#[derive(Debug, Clone)]
pub struct RunStateHandle {
    inner: Arc<RwLock<ScheduleRunState>>,
}

impl RunStateHandle {
    pub(crate) fn new(inner: Arc<RwLock<ScheduleRunState>>) -> Self {
        Self { inner }
    }

    pub async fn snapshot(&self) -> ScheduleRunState {
        self.inner.read().await.clone()
    }
}

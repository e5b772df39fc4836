//! Server state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::lifecycle::manager::AgentLifecycleManager;
use crate::notify::dispatcher::DeliveryLog;
use crate::scheduler::state::RunStateHandle;

/// Server state shared across handlers
pub struct ServerState {
    pub lifecycle: Arc<AgentLifecycleManager>,
    pub run_state: Option<RunStateHandle>,
    pub deliveries: DeliveryLog,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        lifecycle: Arc<AgentLifecycleManager>,
        run_state: Option<RunStateHandle>,
        deliveries: DeliveryLog,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lifecycle,
            run_state,
            deliveries,
            started_at,
        }
    }
}

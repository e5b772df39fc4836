//! Notification events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::errors::ManagerError;

/// Kind of a notification event, also the subscription key of providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunnerStarted,
    RunnerStopped,
    RunnerRemoved,
    RunnerError,
    RunnerSkipped,
    BuildStarted,
    BuildCompleted,
    BuildFailed,
    ImageUpdated,
    UpdateAvailable,
    UpdateApplied,
    UpdateError,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::RunnerStarted,
        EventKind::RunnerStopped,
        EventKind::RunnerRemoved,
        EventKind::RunnerError,
        EventKind::RunnerSkipped,
        EventKind::BuildStarted,
        EventKind::BuildCompleted,
        EventKind::BuildFailed,
        EventKind::ImageUpdated,
        EventKind::UpdateAvailable,
        EventKind::UpdateApplied,
        EventKind::UpdateError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunnerStarted => "runner_started",
            EventKind::RunnerStopped => "runner_stopped",
            EventKind::RunnerRemoved => "runner_removed",
            EventKind::RunnerError => "runner_error",
            EventKind::RunnerSkipped => "runner_skipped",
            EventKind::BuildStarted => "build_started",
            EventKind::BuildCompleted => "build_completed",
            EventKind::BuildFailed => "build_failed",
            EventKind::ImageUpdated => "image_updated",
            EventKind::UpdateAvailable => "update_available",
            EventKind::UpdateApplied => "update_applied",
            EventKind::UpdateError => "update_error",
        }
    }

    /// Human title used when no template matches, e.g. `Runner Started`
    pub fn title(&self) -> String {
        self.as_str()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::RunnerError | EventKind::BuildFailed | EventKind::UpdateError
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s.trim())
            .copied()
            .ok_or_else(|| ManagerError::ConfigError(format!("Unknown event type: {}", s)))
    }
}

/// One state change or failure worth reporting
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add a payload field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload.extend(payload);
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Canned payload for webhook testing
    pub fn sample(kind: EventKind) -> Self {
        let payload = match kind {
            EventKind::RunnerStarted => json!({
                "runner_id": "php83-1",
                "runner_name": "my-runner-php83-1",
                "labels": "my-runner-set-php83, php8.3",
                "techno": "php",
                "techno_version": "8.3",
            }),
            EventKind::RunnerStopped => json!({
                "runner_id": "php83-1",
                "runner_name": "my-runner-php83-1",
                "uptime": "3h 24m 12s",
            }),
            EventKind::RunnerRemoved => json!({
                "runner_id": "php83-3",
                "runner_name": "my-runner-php83-3",
            }),
            EventKind::RunnerError => json!({
                "runner_id": "php83-1",
                "runner_name": "my-runner-php83-1",
                "error_message": "The runner could not register with GitHub: invalid token.",
            }),
            EventKind::RunnerSkipped => json!({
                "runner_name": "my-runner-php83-2",
                "operation": "stop",
                "reason": "Not running",
            }),
            EventKind::BuildStarted => json!({
                "image_name": "itroom/php:8.3-2.329.0",
                "base_image": "ghcr.io/actions/actions-runner:2.329.0",
                "techno": "php",
                "techno_version": "8.3",
            }),
            EventKind::BuildCompleted => json!({
                "image_name": "itroom/php:8.3-2.329.0",
                "duration": "45",
                "image_size": "1.2GB",
            }),
            EventKind::BuildFailed => json!({
                "image_name": "itroom/php:8.3-2.329.0",
                "error_message": "Error during step 3/8: npm install failed with code 1",
            }),
            EventKind::ImageUpdated => json!({
                "runner_type": "base",
                "image_name": "ghcr.io/actions/actions-runner",
                "from_version": "2.328.0",
                "to_version": "2.329.0",
            }),
            EventKind::UpdateAvailable => json!({
                "image_name": "actions-runner",
                "current_version": "2.328.0",
                "new_version": "2.329.0",
                "auto_update": "Enabled",
            }),
            EventKind::UpdateApplied => json!({
                "image_name": "actions-runner",
                "old_version": "2.328.0",
                "new_version": "2.329.0",
                "affected_runners": "php83-1, node20-1",
            }),
            EventKind::UpdateError => json!({
                "runner_type": "base",
                "error_message": "Could not get latest version from GitHub API",
            }),
        };

        let mut event = NotificationEvent::new(kind);
        if let Value::Object(map) = payload {
            event.payload = map;
        }
        event
    }
}

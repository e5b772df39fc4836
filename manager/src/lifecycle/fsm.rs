//! Finite State Machine for runner instances

use std::fmt;

use serde::{Deserialize, Serialize};

/// Runner instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    /// Record exists, no container started yet
    Created,

    /// Container start requested
    Started,

    /// Container observed running
    Running,

    /// Container stopped
    Stopped,

    /// Deregistered and deleted
    Removed,

    /// Collaborator failure or forced error
    Error,
}

impl RunnerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Created => "created",
            RunnerState::Started => "started",
            RunnerState::Running => "running",
            RunnerState::Stopped => "stopped",
            RunnerState::Removed => "removed",
            RunnerState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == RunnerState::Removed
    }

    /// Whether a container is expected to be up
    pub fn is_active(&self) -> bool {
        matches!(self, RunnerState::Started | RunnerState::Running)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runner lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Start,
    Run,
    Stop,
    Remove,
    Fail(String),
}

impl RunnerEvent {
    /// State this event leads to when accepted
    pub fn target(&self) -> RunnerState {
        match self {
            RunnerEvent::Start => RunnerState::Started,
            RunnerEvent::Run => RunnerState::Running,
            RunnerEvent::Stop => RunnerState::Stopped,
            RunnerEvent::Remove => RunnerState::Removed,
            RunnerEvent::Fail(_) => RunnerState::Error,
        }
    }
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: RunnerState,
    pub to: RunnerState,
}

/// Runner FSM, records every state it has been in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerFsm {
    state: RunnerState,
    error: Option<String>,
    history: Vec<RunnerState>,
}

impl RunnerFsm {
    /// Create a new FSM in created state
    pub fn new() -> Self {
        Self {
            state: RunnerState::Created,
            error: None,
            history: vec![RunnerState::Created],
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn history(&self) -> &[RunnerState] {
        &self.history
    }

    /// Check an event against the transition table without applying it
    pub fn check(&self, event: &RunnerEvent) -> Result<RunnerState, InvalidTransition> {
        let to = event.target();
        let allowed = match (self.state, event) {
            // From Created
            (RunnerState::Created, RunnerEvent::Start) => true,
            (RunnerState::Created, RunnerEvent::Fail(_)) => true,

            // From Started
            (RunnerState::Started, RunnerEvent::Run) => true,
            (RunnerState::Started, RunnerEvent::Stop) => true,
            (RunnerState::Started, RunnerEvent::Fail(_)) => true,

            // From Running
            (RunnerState::Running, RunnerEvent::Stop) => true,
            (RunnerState::Running, RunnerEvent::Fail(_)) => true,

            // From Stopped
            (RunnerState::Stopped, RunnerEvent::Start) => true,
            (RunnerState::Stopped, RunnerEvent::Remove) => true,
            (RunnerState::Stopped, RunnerEvent::Fail(_)) => true,

            // From Error, a repeated failure refreshes the cause
            (RunnerState::Error, RunnerEvent::Start) => true,
            (RunnerState::Error, RunnerEvent::Remove) => true,
            (RunnerState::Error, RunnerEvent::Fail(_)) => true,

            _ => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: RunnerEvent) -> Result<RunnerState, InvalidTransition> {
        let to = self.check(&event)?;

        match event {
            RunnerEvent::Fail(cause) => self.error = Some(cause),
            RunnerEvent::Start | RunnerEvent::Run => self.error = None,
            RunnerEvent::Stop | RunnerEvent::Remove => {}
        }

        self.state = to;
        self.history.push(to);
        Ok(to)
    }
}

impl Default for RunnerFsm {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether every consecutive pair of `history` is an edge of the transition table
pub fn is_valid_path(history: &[RunnerState]) -> bool {
    if history.first() != Some(&RunnerState::Created) {
        return false;
    }
    history.windows(2).all(|pair| {
        let probe = RunnerFsm {
            state: pair[0],
            error: None,
            history: Vec::new(),
        };
        let event = match pair[1] {
            RunnerState::Started => RunnerEvent::Start,
            RunnerState::Running => RunnerEvent::Run,
            RunnerState::Stopped => RunnerEvent::Stop,
            RunnerState::Removed => RunnerEvent::Remove,
            RunnerState::Error => RunnerEvent::Fail(String::new()),
            RunnerState::Created => return false,
        };
        probe.check(&event).is_ok()
    })
}

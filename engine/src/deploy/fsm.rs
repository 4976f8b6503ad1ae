//! Finite State Machine for the deployment lifecycle

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::EngineError;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Submitted, pipeline not started yet
    Pending,

    /// Source is being cloned or extracted
    Cloning,

    /// Image is being built and the container started
    Building,

    /// Container is up and reachable
    Running,

    /// Pipeline failed
    Failed,

    /// Stopped by the user
    Stopped,
}

impl DeploymentStatus {
    /// Transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Cloning)
                | (Cloning, Building)
                | (Building, Running)
                | (Pending, Failed)
                | (Cloning, Failed)
                | (Building, Failed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }

    /// Failed and Stopped are never left automatically
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Cloning => "cloning",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Start fetching the source
    Acquire,

    /// Source is ready, start building
    Build,

    /// Container passed its start check
    Launched,

    /// A stage failed
    Fail(String),

    /// Explicit user stop
    Stop,
}

impl DeploymentEvent {
    fn target(&self) -> DeploymentStatus {
        match self {
            DeploymentEvent::Acquire => DeploymentStatus::Cloning,
            DeploymentEvent::Build => DeploymentStatus::Building,
            DeploymentEvent::Launched => DeploymentStatus::Running,
            DeploymentEvent::Fail(_) => DeploymentStatus::Failed,
            DeploymentEvent::Stop => DeploymentStatus::Stopped,
        }
    }
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentStatus,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self::resume(DeploymentStatus::Pending)
    }

    /// Rebuild the FSM from a persisted status
    pub fn resume(state: DeploymentStatus) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    ///
    /// Returns the new status. An event outside the transition table leaves
    /// the state untouched.
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentStatus, EngineError> {
        let next = event.target();
        if !self.state.can_transition_to(next) {
            warn!("Rejected deployment transition {} -> {} ({:?})", self.state, next, event);
            return Err(EngineError::InvalidTransition(format!(
                "{} -> {}",
                self.state, next
            )));
        }

        if let DeploymentEvent::Fail(reason) = event {
            self.error = Some(reason);
        }
        self.state = next;
        Ok(next)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}

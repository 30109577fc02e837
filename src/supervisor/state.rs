//! Per-service lifecycle state

use crate::compose::model::DependencyCondition;
use crate::container::ExitStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Status channels of every service in a deployment
pub type StatusBoard = Arc<BTreeMap<String, watch::Sender<ServiceStatus>>>;

/// Lifecycle state of one service instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ServiceState {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Container being created and started
    Starting,
    /// Container running
    Running,
    /// Container exited on its own
    Exited { code: i32 },
    /// Could not be started, or a dependency failed
    Failed { reason: String },
    /// Waiting out the restart delay
    Restarting,
    /// Stopped by the operator
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Exited { code } => write!(f, "exited ({})", code),
            ServiceState::Failed { reason } => write!(f, "failed: {}", reason),
            ServiceState::Restarting => write!(f, "restarting"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Observable status of a service
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Start attempts made
    pub attempts: u32,
    /// Restarts performed
    pub restarts: u32,
    /// Reached `Running` at least once
    pub ever_running: bool,
    /// Result of the latest health evaluation, `None` without a health check
    pub healthy: Option<bool>,
    /// Passed its health check at least once
    pub ever_healthy: bool,
    /// Some run exited with status 0
    pub completed_successfully: bool,
    /// How the latest run ended
    pub last_exit: Option<ExitStatus>,
    /// Latest error
    pub error: Option<String>,
    /// The supervisor is done with this service
    pub settled: bool,
}

/// Where a dependency stands with respect to a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Waiting,
    Satisfied,
    /// The condition can no longer be met
    Unreachable,
}

impl ServiceStatus {
    /// Evaluate a `depends_on` condition against this status
    pub fn readiness(&self, condition: DependencyCondition) -> Readiness {
        let satisfied = match condition {
            DependencyCondition::Started => self.ever_running,
            DependencyCondition::Healthy => self.ever_healthy,
            DependencyCondition::CompletedSuccessfully => self.completed_successfully,
        };

        if satisfied {
            Readiness::Satisfied
        } else if self.settled
            || (condition == DependencyCondition::Healthy && self.healthy == Some(false))
        {
            Readiness::Unreachable
        } else {
            Readiness::Waiting
        }
    }

    /// Whether the service ended in failure
    pub fn is_failed(&self) -> bool {
        matches!(self.state, ServiceState::Failed { .. })
    }
}

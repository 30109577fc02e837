//! Service lifecycle supervision
//!
//! Every service gets its own task. A task waits for its direct
//! dependencies, reserves devices, then creates, starts and watches its
//! container, restarting it as the service's restart policy says.

pub mod deployment;
mod health;
pub mod ports;
pub mod state;
mod task;

pub use deployment::Deployment;
pub use ports::check_port_conflicts;
pub use state::{Readiness, ServiceState, ServiceStatus};

use crate::compose::graph::DependencyGraph;
use crate::compose::model::Service;
use crate::container::{ContainerConfig, ContainerManager, ContainerRuntime, DeviceInventory};
use crate::error::{KeelError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use task::ServiceTask;
use tokio::sync::watch;

/// Supervisor timing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorConfig {
    /// Time a container has to reach `Running`
    pub start_timeout: Duration,
    /// Time a service waits for its dependencies, `None` waits forever
    pub dependency_timeout: Option<Duration>,
    /// Delay between restart attempts unless the service sets its own
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            dependency_timeout: None,
            restart_delay: Duration::from_secs(1),
        }
    }
}

/// A service together with the container configuration to run it
#[derive(Debug, Clone)]
pub struct ServicePlan {
    pub service: Service,
    pub container: ContainerConfig,
}

/// Launches and supervises services
pub struct Supervisor {
    containers: Arc<ContainerManager>,
    inventory: Arc<DeviceInventory>,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Supervisor over `runtime`, reserving against the detected host inventory
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SupervisorConfig) -> Self {
        Self {
            containers: Arc::new(ContainerManager::new(runtime)),
            inventory: Arc::new(DeviceInventory::detect()),
            config,
        }
    }

    /// Use a specific device inventory
    pub fn with_inventory(mut self, inventory: Arc<DeviceInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    /// Container manager shared by the service tasks
    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    /// Timing parameters
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start supervising `plans`, ordered by `graph`.
    ///
    /// Port conflicts are reported before any task is spawned. Must be
    /// called from within a tokio runtime.
    pub fn launch(&self, plans: Vec<ServicePlan>, graph: &DependencyGraph) -> Result<Deployment> {
        check_port_conflicts(plans.iter().map(|p| &p.service))?;

        let mut plans: BTreeMap<String, ServicePlan> = plans
            .into_iter()
            .map(|p| (p.service.name.clone(), p))
            .collect();

        for name in graph.start_order() {
            if !plans.contains_key(name) {
                return Err(KeelError::ServiceNotFound(name.clone()));
            }
        }

        let board: state::StatusBoard = Arc::new(
            plans
                .keys()
                .map(|name| (name.clone(), watch::channel(ServiceStatus::default()).0))
                .collect(),
        );
        let (cancel, cancel_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(plans.len());
        for name in graph.start_order() {
            let Some(plan) = plans.remove(name) else {
                continue;
            };
            let task = ServiceTask {
                dependencies: graph.dependencies(name)?.clone(),
                service: plan.service,
                container: plan.container,
                board: board.clone(),
                cancel: cancel_rx.clone(),
                containers: self.containers.clone(),
                inventory: self.inventory.clone(),
                config: self.config,
            };
            handles.push(tokio::spawn(task.run()));
        }

        // services the graph does not know about have no dependencies
        for (_, plan) in std::mem::take(&mut plans) {
            let task = ServiceTask {
                dependencies: BTreeMap::new(),
                service: plan.service,
                container: plan.container,
                board: board.clone(),
                cancel: cancel_rx.clone(),
                containers: self.containers.clone(),
                inventory: self.inventory.clone(),
                config: self.config,
            };
            handles.push(tokio::spawn(task.run()));
        }

        tracing::info!("Supervising {} service(s)", handles.len());
        Ok(Deployment::new(board, cancel, handles))
    }
}

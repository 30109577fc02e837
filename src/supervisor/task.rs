//! Supervision of a single service

use super::health;
use super::state::{Readiness, ServiceState, ServiceStatus, StatusBoard};
use super::SupervisorConfig;
use crate::compose::model::{DependencyCondition, Service};
use crate::container::{ContainerConfig, ContainerManager, DeviceInventory, ExitStatus};
use crate::error::{KeelError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// How one start attempt ended
enum Attempt {
    Exited(ExitStatus),
    Failed(KeelError),
    Cancelled,
}

/// Everything a service's task needs
pub(crate) struct ServiceTask {
    pub service: Service,
    pub container: ContainerConfig,
    pub dependencies: BTreeMap<String, DependencyCondition>,
    pub board: StatusBoard,
    pub cancel: watch::Receiver<bool>,
    pub containers: Arc<ContainerManager>,
    pub inventory: Arc<DeviceInventory>,
    pub config: SupervisorConfig,
}

async fn cancelled(mut cancel: watch::Receiver<bool>) {
    // a dropped deployment cancels as well
    let _ = cancel.wait_for(|c| *c).await;
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ServiceTask {
    fn name(&self) -> &str {
        &self.service.name
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ServiceStatus),
    {
        if let Some(status) = self.board.get(&self.service.name) {
            status.send_modify(f);
        }
    }

    fn transition(&self, state: ServiceState) {
        tracing::debug!("Service {} -> {}", self.name(), state);
        self.update(|s| s.state = state);
    }

    fn fail(&self, error: KeelError) {
        tracing::error!("Service {} failed: {}", self.name(), error);
        let reason = error.to_string();
        self.update(|s| {
            s.state = ServiceState::Failed {
                reason: reason.clone(),
            };
            s.error = Some(reason);
        });
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drive the service to a settled state
    pub(crate) async fn run(self) {
        self.supervise().await;

        if let Err(e) = self.inventory.release(self.name()) {
            tracing::warn!("Failed to release reservations of {}: {}", self.name(), e);
        }
        self.update(|s| s.settled = true);
    }

    async fn supervise(&self) {
        match self.wait_for_dependencies().await {
            Ok(()) => {}
            Err(KeelError::Cancelled(_)) => return self.transition(ServiceState::Stopped),
            Err(e) => return self.fail(e),
        }

        if let Err(e) = self.reserve() {
            return self.fail(e);
        }

        self.run_attempts().await;
    }

    /// Block until every direct dependency meets its condition
    async fn wait_for_dependencies(&self) -> Result<()> {
        let deadline_at = self.config.dependency_timeout.map(|t| Instant::now() + t);

        for (dependency, condition) in &self.dependencies {
            let mut receiver = self
                .board
                .get(dependency)
                .ok_or_else(|| KeelError::ServiceNotFound(dependency.clone()))?
                .subscribe();
            let condition = *condition;

            tracing::debug!(
                "Service {} waiting for {} ({:?})",
                self.name(),
                dependency,
                condition
            );

            let readiness = tokio::select! {
                ready = async {
                    receiver
                        .wait_for(|s| s.readiness(condition) != Readiness::Waiting)
                        .await
                        .map(|s| s.readiness(condition))
                } => ready.unwrap_or(Readiness::Unreachable),
                _ = cancelled(self.cancel.clone()) => {
                    return Err(KeelError::Cancelled(format!(
                        "{} was waiting for {}",
                        self.name(),
                        dependency
                    )));
                }
                _ = deadline(deadline_at) => {
                    return Err(KeelError::StartTimeout {
                        service: self.name().to_string(),
                        seconds: self
                            .config
                            .dependency_timeout
                            .map(|t| t.as_secs_f64())
                            .unwrap_or_default(),
                        waiting_on: Some(dependency.clone()),
                    });
                }
            };

            if readiness != Readiness::Satisfied {
                return Err(KeelError::DependencyFailed {
                    service: self.name().to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    fn reserve(&self) -> Result<()> {
        if self.service.devices.is_empty() && self.service.cpus.is_none() {
            return Ok(());
        }

        let granted = self
            .inventory
            .reserve(self.name(), &self.service.devices, self.service.cpus)?;
        if !granted.is_empty() {
            let ids: Vec<String> = granted
                .iter()
                .map(|(driver, id)| format!("{}:{}", driver, id))
                .collect();
            tracing::info!("Reserved {} for {}", ids.join(", "), self.name());
        }
        Ok(())
    }

    async fn run_attempts(&self) {
        let policy = self.service.restart;
        let delay = self
            .service
            .restart_delay
            .unwrap_or(self.config.restart_delay);
        let mut restarts = 0u32;

        loop {
            if self.is_cancelled() {
                return self.transition(ServiceState::Stopped);
            }

            self.update(|s| {
                s.state = ServiceState::Starting;
                s.attempts += 1;
            });

            let failed = match self.attempt().await {
                Attempt::Cancelled => return self.transition(ServiceState::Stopped),
                Attempt::Exited(exit) => {
                    if exit.success() {
                        tracing::info!("Service {} completed", self.name());
                    } else {
                        tracing::warn!("Service {} exited with {}", self.name(), exit);
                    }
                    self.update(|s| {
                        s.state = ServiceState::Exited {
                            code: exit.as_code(),
                        };
                        s.last_exit = Some(exit);
                        s.healthy = None;
                        s.completed_successfully |= exit.success();
                    });
                    !exit.success()
                }
                Attempt::Failed(error) => {
                    self.fail(error);
                    true
                }
            };

            if !policy.should_restart(failed, restarts) {
                return;
            }
            if self.is_cancelled() {
                return self.transition(ServiceState::Stopped);
            }

            restarts += 1;
            tracing::warn!(
                "Restarting service {} in {:?} (restart {})",
                self.name(),
                delay,
                restarts
            );
            self.update(|s| {
                s.state = ServiceState::Restarting;
                s.restarts = restarts;
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(self.cancel.clone()) => {
                    return self.transition(ServiceState::Stopped);
                }
            }
        }
    }

    /// Create, start and wait for one container
    async fn attempt(&self) -> Attempt {
        let id = match self.containers.create(self.container.renewed()).await {
            Ok(id) => id,
            Err(e) => return Attempt::Failed(e),
        };

        let start_timeout = self.config.start_timeout;
        let started = tokio::select! {
            result = tokio::time::timeout(start_timeout, self.containers.start(&id)) => match result {
                Ok(started) => started,
                Err(_) => Err(KeelError::StartTimeout {
                    service: self.name().to_string(),
                    seconds: start_timeout.as_secs_f64(),
                    waiting_on: None,
                }),
            },
            _ = cancelled(self.cancel.clone()) => {
                self.discard(&id).await;
                return Attempt::Cancelled;
            }
        };
        if let Err(e) = started {
            self.discard(&id).await;
            return Attempt::Failed(e);
        }

        tracing::info!("Service {} is running", self.name());
        self.update(|s| {
            s.state = ServiceState::Running;
            s.ever_running = true;
            s.healthy = None;
            s.error = None;
        });

        let monitor = self.service.healthcheck.clone().map(|check| {
            health::spawn_monitor(
                self.containers.clone(),
                id.clone(),
                self.service.name.clone(),
                check,
                self.board.clone(),
            )
        });

        let outcome = tokio::select! {
            exit = self.containers.wait(&id) => match exit {
                Ok(exit) => Attempt::Exited(exit),
                Err(e) => Attempt::Failed(e),
            },
            _ = cancelled(self.cancel.clone()) => {
                tracing::info!("Stopping service {}", self.name());
                if let Err(e) = self.containers.stop(&id).await {
                    tracing::warn!("Failed to stop {}: {}", self.name(), e);
                }
                if let Err(e) = self.containers.wait(&id).await {
                    tracing::debug!("Failed to reap {}: {}", self.name(), e);
                }
                Attempt::Cancelled
            }
        };

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        self.discard(&id).await;
        outcome
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = self.containers.remove(id).await {
            tracing::debug!("Failed to remove container {}: {}", id, e);
        }
    }
}

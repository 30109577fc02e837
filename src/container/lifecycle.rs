//! Container lifecycle management

use super::config::{ContainerConfig, ContainerStatus, ExitStatus};
use super::runtime::ContainerRuntime;
use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Bookkeeping for one container
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    /// Container configuration
    pub config: ContainerConfig,
    /// Current status
    pub status: ContainerStatus,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// Stop time
    pub finished_at: Option<DateTime<Utc>>,
    /// How the last run ended
    pub exit: Option<ExitStatus>,
}

/// Container manager for handling container lifecycle on top of a runtime
pub struct ContainerManager {
    /// Backend executing the containers
    runtime: Arc<dyn ContainerRuntime>,
    /// All containers indexed by ID
    containers: Arc<RwLock<HashMap<String, ContainerRecord>>>,
}

impl ContainerManager {
    /// Create a new container manager
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            containers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Runtime backing this manager
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    fn update<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ContainerRecord),
    {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        let record = containers
            .get_mut(id)
            .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
        f(record);
        Ok(())
    }

    /// Create a new container
    pub async fn create(&self, config: ContainerConfig) -> Result<String> {
        let id = self.runtime.create(&config).await?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        containers.insert(
            id.clone(),
            ContainerRecord {
                config,
                status: ContainerStatus::Created,
                started_at: None,
                finished_at: None,
                exit: None,
            },
        );
        Ok(id)
    }

    /// Start a container
    pub async fn start(&self, id: &str) -> Result<()> {
        let status = self.get(id)?.status;
        if status == ContainerStatus::Running {
            return Err(KeelError::ContainerAlreadyRunning(id.to_string()));
        }

        if let Err(e) = self.runtime.start(id).await {
            self.update(id, |record| record.status = ContainerStatus::Dead)?;
            return Err(e);
        }

        self.update(id, |record| {
            record.status = ContainerStatus::Running;
            record.started_at = Some(Utc::now());
        })
    }

    /// Wait for a running container to exit
    pub async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let exit = self.runtime.wait(id).await?;
        self.update(id, |record| {
            record.status = ContainerStatus::Exited;
            record.finished_at = Some(Utc::now());
            record.exit = Some(exit);
        })?;
        Ok(exit)
    }

    /// Stop a container, killing it after its grace period
    pub async fn stop(&self, id: &str) -> Result<()> {
        let record = self.get(id)?;
        if record.status != ContainerStatus::Running {
            return Err(KeelError::ContainerNotRunning(id.to_string()));
        }

        self.update(id, |record| record.status = ContainerStatus::Stopping)?;
        self.runtime
            .stop(id, record.config.stop_grace_period)
            .await
    }

    /// Remove a container
    pub async fn remove(&self, id: &str) -> Result<()> {
        let record = self.get(id)?;
        if matches!(
            record.status,
            ContainerStatus::Running | ContainerStatus::Stopping
        ) {
            return Err(KeelError::Container(
                "Cannot remove a running container".to_string(),
            ));
        }

        self.runtime.remove(id).await?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;
        containers.remove(id);
        Ok(())
    }

    /// Run a health probe inside a container
    pub async fn probe(
        &self,
        id: &str,
        argv: &[String],
        timeout: std::time::Duration,
    ) -> Result<bool> {
        self.runtime.exec(id, argv, timeout).await
    }

    /// Get container by ID
    pub fn get(&self, id: &str) -> Result<ContainerRecord> {
        let containers = self
            .containers
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        containers
            .get(id)
            .cloned()
            .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))
    }

    /// List containers, optionally only running ones
    pub fn list(&self, all: bool) -> Result<Vec<ContainerRecord>> {
        let containers = self
            .containers
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(containers
            .values()
            .filter(|c| all || c.status == ContainerStatus::Running)
            .cloned()
            .collect())
    }

    /// Find container by name
    pub fn find_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        let containers = self
            .containers
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(containers.values().find(|c| c.config.name == name).cloned())
    }
}

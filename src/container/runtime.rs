//! Container runtime abstraction
//!
//! The supervisor never executes anything itself. It drives containers
//! through a [`ContainerRuntime`], which can be a real engine, host
//! processes, or a scripted fake in tests.

use super::config::{ContainerConfig, ExitStatus};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Executes service containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Prepare a container; returns its ID
    async fn create(&self, config: &ContainerConfig) -> Result<String>;

    /// Start a created container. Returns once the container is running.
    async fn start(&self, id: &str) -> Result<()>;

    /// Wait for the container to exit.
    ///
    /// Must be safe to call while a concurrent [`ContainerRuntime::stop`]
    /// is in progress.
    async fn wait(&self, id: &str) -> Result<ExitStatus>;

    /// Ask the container to stop, killing it after `grace`
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Release everything the container holds. The container must not be running.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Run a probe inside the container's context.
    ///
    /// Returns `Ok(true)` when the probe exits 0 within `timeout`.
    async fn exec(&self, id: &str, argv: &[String], timeout: Duration) -> Result<bool>;
}

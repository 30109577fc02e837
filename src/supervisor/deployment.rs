//! Handle on a launched set of services

use super::state::{ServiceStatus, StatusBoard};
use crate::error::{KeelError, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running deployment
///
/// Dropping it cancels every service.
pub struct Deployment {
    board: StatusBoard,
    cancel: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Deployment {
    pub(crate) fn new(
        board: StatusBoard,
        cancel: watch::Sender<bool>,
        handles: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            board,
            cancel,
            handles,
        }
    }

    /// Names of the supervised services
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.board.keys().map(String::as_str)
    }

    /// Current status of a service
    pub fn status(&self, service: &str) -> Result<ServiceStatus> {
        self.board
            .get(service)
            .map(|s| s.borrow().clone())
            .ok_or_else(|| KeelError::ServiceNotFound(service.to_string()))
    }

    /// Current status of every service
    pub fn snapshot(&self) -> BTreeMap<String, ServiceStatus> {
        self.board
            .iter()
            .map(|(name, s)| (name.clone(), s.borrow().clone()))
            .collect()
    }

    /// Receiver of a service's status changes
    pub fn subscribe(&self, service: &str) -> Result<watch::Receiver<ServiceStatus>> {
        self.board
            .get(service)
            .map(|s| s.subscribe())
            .ok_or_else(|| KeelError::ServiceNotFound(service.to_string()))
    }

    /// Wait until a service's status matches `predicate`
    pub async fn wait_for<F>(
        &self,
        service: &str,
        mut predicate: F,
        timeout: Duration,
    ) -> Result<ServiceStatus>
    where
        F: FnMut(&ServiceStatus) -> bool,
    {
        let mut receiver = self.subscribe(service)?;
        let waited = tokio::time::timeout(timeout, async {
            receiver
                .wait_for(|s| predicate(s))
                .await
                .map(|s| s.clone())
        })
        .await;

        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(KeelError::Cancelled(format!(
                "status of {} is no longer published",
                service
            ))),
            Err(_) => Err(KeelError::StartTimeout {
                service: service.to_string(),
                seconds: timeout.as_secs_f64(),
                waiting_on: None,
            }),
        }
    }

    /// Whether every service has settled
    pub fn is_settled(&self) -> bool {
        self.board.values().all(|s| s.borrow().settled)
    }

    /// Wait until every service has settled
    pub async fn settled(&self) {
        for status in self.board.values() {
            let mut receiver = status.subscribe();
            let _ = receiver.wait_for(|s| s.settled).await;
        }
    }

    /// Ask every service to stop
    pub fn cancel(&self) {
        tracing::info!("Stopping {} service(s)", self.board.len());
        self.cancel.send_replace(true);
    }

    /// Wait for every service task to finish
    pub async fn wait(&mut self) -> Result<()> {
        let mut panicked = Vec::new();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                panicked.push(e.to_string());
            }
        }

        if panicked.is_empty() {
            Ok(())
        } else {
            Err(KeelError::Container(format!(
                "supervisor task failed: {}",
                panicked.join("; ")
            )))
        }
    }

    /// Stop every service and wait until they have stopped
    pub async fn shutdown(&mut self) -> Result<()> {
        self.cancel();
        self.wait().await
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

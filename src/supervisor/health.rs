//! Health check monitoring

use super::state::StatusBoard;
use crate::compose::model::HealthCheck;
use crate::container::ContainerManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Probe a running container until the task is aborted.
///
/// The first probe runs one `interval` after start. Failures inside
/// `start_period` do not count; `retries` consecutive failures after it mark
/// the service unhealthy. A later success makes it healthy again.
pub fn spawn_monitor(
    containers: Arc<ContainerManager>,
    container_id: String,
    service: String,
    check: HealthCheck,
    board: StatusBoard,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(status) = board.get(&service) else {
            return;
        };
        let started = Instant::now();
        let mut failures = 0u32;

        loop {
            tokio::time::sleep(check.interval).await;

            let passed = match containers
                .probe(&container_id, &check.test, check.timeout)
                .await
            {
                Ok(passed) => passed,
                Err(e) => {
                    tracing::debug!("Health probe for {} could not run: {}", service, e);
                    false
                }
            };

            if passed {
                failures = 0;
                status.send_if_modified(|s| {
                    let changed = s.healthy != Some(true);
                    if changed {
                        tracing::info!("Service {} is healthy", service);
                    }
                    s.healthy = Some(true);
                    s.ever_healthy = true;
                    changed
                });
                continue;
            }

            if started.elapsed() < check.start_period {
                continue;
            }

            failures += 1;
            if failures >= check.retries.max(1) {
                status.send_if_modified(|s| {
                    let changed = s.healthy != Some(false);
                    if changed {
                        tracing::warn!(
                            "Service {} is unhealthy after {} failed probes",
                            service,
                            failures
                        );
                    }
                    s.healthy = Some(false);
                    changed
                });
            }
        }
    })
}

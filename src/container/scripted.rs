//! Scripted runtime used by unit tests

use super::config::{ContainerConfig, ExitStatus};
use super::runtime::ContainerRuntime;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Behaviour of one service's containers
#[derive(Debug, Clone)]
pub struct Script {
    start_delay: Duration,
    fail_start: bool,
    /// Exit code per attempt, `None` runs until stopped. The last entry repeats.
    exits: Vec<Option<i32>>,
    run_for: Duration,
    healthy: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            fail_start: false,
            exits: vec![None],
            run_for: Duration::from_millis(10),
            healthy: true,
        }
    }
}

impl Script {
    /// Runs until stopped
    pub fn runs() -> Self {
        Self::default()
    }

    /// Exits with `code` shortly after starting
    pub fn exits(code: i32) -> Self {
        Self {
            exits: vec![Some(code)],
            ..Self::default()
        }
    }

    /// One entry per attempt
    pub fn sequence(exits: Vec<Option<i32>>) -> Self {
        Self {
            exits,
            ..Self::default()
        }
    }

    /// Start always fails
    pub fn fails_to_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Delay before start returns
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// How long an exiting attempt runs
    pub fn run_for(mut self, duration: Duration) -> Self {
        self.run_for = duration;
        self
    }

    /// Health probes fail
    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }
}

struct ScriptedContainer {
    service: String,
    attempt: usize,
    stop: watch::Sender<bool>,
}

#[derive(Default)]
struct ScriptState {
    containers: HashMap<String, ScriptedContainer>,
    starts: HashMap<String, usize>,
    events: Vec<String>,
    next_id: usize,
}

/// In-memory runtime following per-service scripts
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    scripts: HashMap<String, Script>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the script for a service
    pub fn script(mut self, service: &str, script: Script) -> Self {
        self.scripts.insert(service.to_string(), script);
        self
    }

    fn script_for(&self, service: &str) -> Script {
        self.scripts.get(service).cloned().unwrap_or_default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("scripted runtime state poisoned")
    }

    /// Recorded `start <service>` / `exit <service> <code>` / `stop <service>` events
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    /// Number of successful starts for a service
    pub fn starts(&self, service: &str) -> usize {
        self.state().starts.get(service).copied().unwrap_or(0)
    }

    fn container(&self, id: &str) -> Result<(String, usize, watch::Receiver<bool>)> {
        let state = self.state();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
        Ok((
            container.service.clone(),
            container.attempt,
            container.stop.subscribe(),
        ))
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{}-{}", config.service, state.next_id);
        let (stop, _) = watch::channel(false);
        state.containers.insert(
            id.clone(),
            ScriptedContainer {
                service: config.service.clone(),
                attempt: 0,
                stop,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let (service, _, _) = self.container(id)?;
        let script = self.script_for(&service);

        tokio::time::sleep(script.start_delay).await;
        if script.fail_start {
            return Err(KeelError::Container(format!("{} refused to start", service)));
        }

        let mut state = self.state();
        let starts = state.starts.entry(service.clone()).or_insert(0);
        *starts += 1;
        let attempt = *starts - 1;
        if let Some(container) = state.containers.get_mut(id) {
            container.attempt = attempt;
        }
        state.events.push(format!("start {}", service));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let (service, attempt, mut stopped) = self.container(id)?;
        let script = self.script_for(&service);
        let planned = script
            .exits
            .get(attempt)
            .or_else(|| script.exits.last())
            .copied()
            .flatten();

        let stop_signal = async {
            let _ = stopped.wait_for(|stopped| *stopped).await;
        };

        let status = match planned {
            Some(code) => tokio::select! {
                _ = tokio::time::sleep(script.run_for) => ExitStatus::code(code),
                _ = stop_signal => ExitStatus::signal(15),
            },
            None => {
                stop_signal.await;
                ExitStatus::signal(15)
            }
        };

        self.state()
            .events
            .push(format!("exit {} {}", service, status.as_code()));
        Ok(status)
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state();
        let service = {
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
            container.stop.send_replace(true);
            container.service.clone()
        };
        state.events.push(format!("stop {}", service));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.state().containers.remove(id);
        Ok(())
    }

    async fn exec(&self, id: &str, _argv: &[String], _timeout: Duration) -> Result<bool> {
        let (service, _, _) = self.container(id)?;
        Ok(self.script_for(&service).healthy)
    }
}

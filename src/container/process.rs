//! Host process runtime
//!
//! Runs each service's command as a plain child process. There is no
//! filesystem or network isolation: mounts and addresses are exported to
//! the process as environment variables instead.

use super::config::{ContainerConfig, ExitStatus};
use super::runtime::ContainerRuntime;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

struct ProcessEntry {
    config: ContainerConfig,
    pid: Option<i32>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

/// Runs containers as host processes
#[derive(Clone, Default)]
pub struct ProcessRuntime {
    /// Containers indexed by ID
    containers: Arc<RwLock<HashMap<String, ProcessEntry>>>,
}

impl ProcessRuntime {
    /// Create a new process runtime
    pub fn new() -> Self {
        Self::default()
    }

    fn command_for(config: &ContainerConfig, argv: &[String]) -> Result<Command> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            KeelError::Container(format!(
                "service '{}' has no command; the process runtime cannot run image {}",
                config.service, config.image
            ))
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&config.env)
            .env("HOSTNAME", &config.hostname)
            .env("KEEL_SERVICE", &config.service)
            .env("KEEL_CONTAINER", &config.name)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        for attachment in &config.networks {
            if let Some(ip) = attachment.ip {
                command.env(format!("KEEL_IP_{}", env_key(&attachment.network)), ip.to_string());
            }
        }
        for mount in &config.mounts {
            if let Some(host_path) = &mount.host_path {
                command.env(format!("KEEL_MOUNT_{}", env_key(&mount.container_path)), host_path);
            }
        }
        if let Some(dir) = config.working_dir.as_ref().filter(|d| d.is_dir()) {
            command.current_dir(dir);
        }

        Ok(command)
    }

    fn entry_pid(&self, id: &str) -> Result<(Option<i32>, watch::Receiver<Option<ExitStatus>>)> {
        let containers = self
            .containers
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        let entry = containers
            .get(id)
            .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
        Ok((entry.pid, entry.exit.clone()))
    }
}

fn env_key(raw: &str) -> String {
    raw.trim_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Send a signal to a process
fn kill(pid: i32, signal: i32) -> Result<()> {
    let result = unsafe { libc::kill(pid, signal) };
    if result < 0 {
        let err = std::io::Error::last_os_error();
        // already gone
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

async fn wait_exit(mut exit: watch::Receiver<Option<ExitStatus>>) -> Result<ExitStatus> {
    let status = *exit
        .wait_for(|status| status.is_some())
        .await
        .map_err(|_| KeelError::Container("process watcher went away".to_string()))?;
    status.ok_or_else(|| KeelError::Container("missing exit status".to_string()))
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn create(&self, config: &ContainerConfig) -> Result<String> {
        // fail at create time rather than at start
        Self::command_for(config, &config.cmd)?;

        let mut containers = self
            .containers
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        if containers.contains_key(&config.id) {
            return Err(KeelError::Container(format!(
                "container {} already exists",
                config.id
            )));
        }

        let (_, exit) = watch::channel(None);
        containers.insert(
            config.id.clone(),
            ProcessEntry {
                config: config.clone(),
                pid: None,
                exit,
            },
        );
        Ok(config.id.clone())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let config = {
            let containers = self
                .containers
                .read()
                .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;
            let entry = containers
                .get(id)
                .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
            if entry.pid.is_some() {
                return Err(KeelError::ContainerAlreadyRunning(id.to_string()));
            }
            entry.config.clone()
        };

        let mut child = Self::command_for(&config, &config.cmd)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                KeelError::Container(format!("failed to spawn {}: {}", config.cmd[0], e))
            })?;

        let pid = child.id().map(|p| p as i32);

        for stream in [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
        ]
        .into_iter()
        .flatten()
        {
            let service = config.service.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "keel::service", "{} | {}", service, line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let name = config.name.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => ExitStatus::code(code),
                    None => ExitStatus::signal(status.signal().unwrap_or(libc::SIGKILL)),
                },
                Err(e) => {
                    tracing::warn!("Failed to wait for {}: {}", name, e);
                    ExitStatus::code(-1)
                }
            };
            tracing::debug!("Container {} exited with {}", name, status);
            let _ = exit_tx.send(Some(status));
        });

        let mut containers = self
            .containers
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;
        let entry = containers
            .get_mut(id)
            .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
        entry.pid = pid;
        entry.exit = exit_rx;

        tracing::debug!("Started {} as pid {:?}", config.name, pid);
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<ExitStatus> {
        let (pid, exit) = self.entry_pid(id)?;
        if pid.is_none() {
            return Err(KeelError::ContainerNotRunning(id.to_string()));
        }
        wait_exit(exit).await
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let (pid, exit) = self.entry_pid(id)?;
        let Some(pid) = pid else {
            return Ok(());
        };
        if exit.borrow().is_some() {
            return Ok(());
        }

        kill(pid, libc::SIGTERM)?;
        if tokio::time::timeout(grace, wait_exit(exit.clone())).await.is_err() {
            tracing::warn!("Container {} ignored SIGTERM, killing", id);
            kill(pid, libc::SIGKILL)?;
            wait_exit(exit).await?;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut containers = self
            .containers
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        let entry = containers
            .get(id)
            .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?;
        if entry.pid.is_some() && entry.exit.borrow().is_none() {
            return Err(KeelError::Container(
                "Cannot remove a running container".to_string(),
            ));
        }

        containers.remove(id);
        Ok(())
    }

    async fn exec(&self, id: &str, argv: &[String], timeout: Duration) -> Result<bool> {
        let config = {
            let containers = self
                .containers
                .read()
                .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;
            containers
                .get(id)
                .map(|e| e.config.clone())
                .ok_or_else(|| KeelError::ContainerNotFound(id.to_string()))?
        };

        let mut command = Self::command_for(&config, argv)?;
        command.stdout(Stdio::null()).stderr(Stdio::null());

        match tokio::time::timeout(timeout, command.status()).await {
            Ok(Ok(status)) => Ok(status.success()),
            Ok(Err(e)) => {
                tracing::debug!("Probe for {} failed to run: {}", config.name, e);
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str) -> ContainerConfig {
        ContainerConfig::new(name, "busybox").cmd(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let runtime = ProcessRuntime::new();
        let id = runtime.create(&shell("ok", "exit 3")).await.unwrap();
        runtime.start(&id).await.unwrap();

        let status = runtime.wait(&id).await.unwrap();
        assert_eq!(status, ExitStatus::code(3));
        runtime.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_long_running_process() {
        let runtime = ProcessRuntime::new();
        let id = runtime.create(&shell("sleeper", "sleep 30")).await.unwrap();
        runtime.start(&id).await.unwrap();

        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
        let status = runtime.wait(&id).await.unwrap();
        assert!(!status.success());
        runtime.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_required() {
        let runtime = ProcessRuntime::new();
        let err = runtime
            .create(&ContainerConfig::new("bare", "ollama/ollama"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::Container(ref m) if m.contains("no command")));
    }

    #[tokio::test]
    async fn test_exec_probe_sees_environment() {
        let runtime = ProcessRuntime::new();
        let config = shell("probe", "sleep 30").env("READY", "yes");
        let id = runtime.create(&config).await.unwrap();
        runtime.start(&id).await.unwrap();

        let probe = |script: &str| {
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]
        };
        let timeout = Duration::from_secs(5);
        assert!(runtime.exec(&id, &probe("test \"$READY\" = yes"), timeout).await.unwrap());
        assert!(!runtime.exec(&id, &probe("exit 1"), timeout).await.unwrap());

        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
    }
}

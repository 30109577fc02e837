//! Container configuration

use crate::compose::model::{DeviceRequest, PortBinding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Default time between the stop signal and a forced kill
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is being stopped
    Stopping,
    /// Container has exited
    Exited,
    /// Container could not be started
    Dead,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopping => write!(f, "stopping"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// How a container process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Normal exit with `code`
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Terminated by `signal`
    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Whether the process exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code in shell convention (`128 + signal` for signals)
    pub fn as_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Mount with its host side resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path; `None` for anonymous and tmpfs mounts
    pub host_path: Option<PathBuf>,
    /// Path inside the container
    pub container_path: String,
    /// Read only
    pub read_only: bool,
}

/// Network endpoint assigned to the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Host-level network name
    pub network: String,
    /// Assigned address
    pub ip: Option<IpAddr>,
    /// DNS aliases on this network
    pub aliases: Vec<String>,
}

fn new_container_id() -> String {
    Uuid::new_v4().to_string().replace('-', "")[..12].to_string()
}

/// Container configuration
#[derive(Debug, Clone, Serialize)]
pub struct ContainerConfig {
    /// Unique container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Service this container runs
    pub service: String,
    /// Image name/tag
    pub image: String,
    /// Full argv (entrypoint followed by command)
    pub cmd: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// User to run as
    pub user: Option<String>,
    /// Hostname
    pub hostname: String,
    /// Published ports
    pub ports: Vec<PortBinding>,
    /// Mounts
    pub mounts: Vec<Mount>,
    /// Network endpoints
    pub networks: Vec<NetworkAttachment>,
    /// Device reservations
    pub devices: Vec<DeviceRequest>,
    /// CPU reservation
    pub cpus: Option<f64>,
    /// Time between the stop signal and a forced kill
    pub stop_grace_period: Duration,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl ContainerConfig {
    /// Create a new container configuration
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            id: new_container_id(),
            name: name.to_string(),
            service: name.to_string(),
            image: image.to_string(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            user: None,
            hostname: name.to_string(),
            ports: Vec::new(),
            mounts: Vec::new(),
            networks: Vec::new(),
            devices: Vec::new(),
            cpus: None,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Same configuration under a fresh ID, for another run
    pub fn renewed(&self) -> Self {
        Self {
            id: new_container_id(),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Set the owning service
    pub fn service(mut self, service: &str) -> Self {
        self.service = service.to_string();
        self
    }

    /// Set command to run
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add port binding
    pub fn port(mut self, binding: PortBinding) -> Self {
        self.ports.push(binding);
        self
    }

    /// Add a mount
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the stop grace period
    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("dria-ollama-1", "ollama/ollama")
            .service("ollama")
            .cmd(vec!["ollama".to_string(), "serve".to_string()])
            .env("OLLAMA_HOST", "0.0.0.0")
            .port(PortBinding::tcp(11434, 11434))
            .label("com.docker.compose.project", "dria");

        assert_eq!(config.id.len(), 12);
        assert_eq!(config.service, "ollama");
        assert_eq!(config.hostname, "dria-ollama-1");
        assert_eq!(config.env["OLLAMA_HOST"], "0.0.0.0");
        assert_eq!(config.stop_grace_period, DEFAULT_STOP_GRACE_PERIOD);

        let next = config.renewed();
        assert_ne!(next.id, config.id);
        assert_eq!(next.name, config.name);
    }

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::code(0).success());
        assert!(!ExitStatus::code(2).success());
        assert_eq!(ExitStatus::signal(15).as_code(), 143);
        assert_eq!(ExitStatus::signal(9).to_string(), "signal 9");
    }
}

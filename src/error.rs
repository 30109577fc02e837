//! Error types for keel

use thiserror::Error;

/// Result type for keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Compose file parse error: {0}")]
    Parse(String),

    #[error("Missing variable {variable} at {location}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    MissingVariable {
        variable: String,
        location: String,
        message: Option<String>,
    },

    #[error("Cyclic dependency between services: {}", .members.join(" -> "))]
    CyclicDependency { members: Vec<String> },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Resource conflict on {resource}: {reason}")]
    ResourceConflict { resource: String, reason: String },

    #[error("Port conflict: host port {port}/{protocol} claimed by both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        protocol: String,
        first: String,
        second: String,
    },

    #[error("Resource unavailable for service '{service}': {reason}")]
    ResourceUnavailable { service: String, reason: String },

    #[error("Service '{service}' did not start within {seconds:.1}s{}", .waiting_on.as_deref().map(|d| format!(" (waiting on '{}')", d)).unwrap_or_default())]
    StartTimeout {
        service: String,
        seconds: f64,
        waiting_on: Option<String>,
    },

    #[error("Service '{service}' cannot start: dependency '{dependency}' failed")]
    DependencyFailed { service: String, dependency: String },

    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already running: {0}")]
    ContainerAlreadyRunning(String),

    #[error("Container not running: {0}")]
    ContainerNotRunning(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl KeelError {
    /// Name of the service or resource the error is about, if any
    pub fn subject(&self) -> Option<&str> {
        match self {
            KeelError::UnknownDependency { service, .. }
            | KeelError::ResourceUnavailable { service, .. }
            | KeelError::StartTimeout { service, .. }
            | KeelError::DependencyFailed { service, .. } => Some(service),
            KeelError::ResourceConflict { resource, .. } => Some(resource),
            KeelError::PortConflict { first, .. } => Some(first),
            KeelError::MissingVariable { variable, .. } => Some(variable),
            KeelError::ContainerNotFound(name)
            | KeelError::ContainerAlreadyRunning(name)
            | KeelError::ContainerNotRunning(name)
            | KeelError::NetworkNotFound(name)
            | KeelError::VolumeNotFound(name)
            | KeelError::ServiceNotFound(name) => Some(name),
            _ => None,
        }
    }

    /// Whether the error aborts the whole deployment rather than a single service
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            KeelError::ResourceUnavailable { .. }
                | KeelError::StartTimeout { .. }
                | KeelError::DependencyFailed { .. }
                | KeelError::Container(_)
        )
    }
}

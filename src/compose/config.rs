//! Compose document types
//!
//! These mirror the on-disk document after merge keys and interpolation
//! have been applied. They are normalized into [`crate::compose::model`]
//! types by the loader.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

/// Top level of a compose document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Ignored apart from being accepted
    pub version: Option<String>,
    /// `name:`, one source of the project name
    pub name: Option<String>,
    pub services: BTreeMap<String, ServiceConfig>,
    /// A bare `key:` declares a network with defaults
    pub networks: BTreeMap<String, Option<NetworkConfig>>,
    pub volumes: BTreeMap<String, Option<VolumeConfig>>,
}

/// One entry under `services:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub image: Option<String>,
    /// Required when there is no `image`
    pub build: Option<BuildConfig>,
    pub command: Option<CommandConfig>,
    pub entrypoint: Option<CommandConfig>,
    pub container_name: Option<String>,
    pub hostname: Option<String>,
    /// Overrides values from `env_file`
    pub environment: Option<EnvironmentConfig>,
    /// Environment file(s), relative to the project directory
    pub env_file: Option<EnvFileConfig>,
    pub ports: Option<Vec<PortConfig>>,
    pub volumes: Option<Vec<VolumeMount>>,
    /// Joins `default` when absent
    pub networks: Option<NetworksConfig>,
    pub depends_on: Option<DependsOnConfig>,
    /// Only reservations and `restart_policy` are honoured
    pub deploy: Option<DeployConfig>,
    pub healthcheck: Option<HealthcheckConfig>,
    pub labels: Option<LabelsConfig>,
    /// `no`, `always`, `on-failure[:N]` or `unless-stopped`
    pub restart: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    /// Duration string such as `1m30s`
    pub stop_grace_period: Option<String>,
    pub profiles: Option<Vec<String>>,
}

/// `build:` as a context path or a mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    Simple(String),
    Full(BuildConfigFull),
}

/// Mapping form of `build:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfigFull {
    pub context: Option<String>,
    pub dockerfile: Option<String>,
    pub args: Option<BTreeMap<String, String>>,
    pub target: Option<String>,
}

/// `command:` and `entrypoint:`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Run through `/bin/sh -c`
    Shell(String),
    Exec(Vec<String>),
}

/// `environment:` as a list or a mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// `KEY=value`, or a bare `KEY` taken from the variables
    Array(Vec<String>),
    /// A null value is taken from the variables
    Map(BTreeMap<String, Option<Value>>),
}

/// `env_file:`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    Single(String),
    Multiple(Vec<String>),
}

/// One entry of `ports:`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port: `8080`
    Number(u16),
    /// Short syntax: "8080:80/udp"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Mapping form of a port entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Container port or range
    pub target: StringOrNumber,
    /// Host port or range
    #[serde(default)]
    pub published: Option<StringOrNumber>,
    #[serde(default)]
    pub host_ip: Option<String>,
    /// `tcp` unless given
    #[serde(default)]
    pub protocol: Option<String>,
}

/// A scalar that may be written as a string or a number
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrNumber {
    Number(u64),
    Float(f64),
    String(String),
}

impl StringOrNumber {
    /// Read the value as a number, whichever way it was written
    pub fn parse<T: std::str::FromStr>(&self) -> Option<T> {
        match self {
            StringOrNumber::String(s) => s.trim().parse().ok(),
            other => other.to_string().parse().ok(),
        }
    }
}

impl std::fmt::Display for StringOrNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StringOrNumber::Number(n) => write!(f, "{}", n),
            StringOrNumber::Float(n) => write!(f, "{}", n),
            StringOrNumber::String(s) => write!(f, "{}", s),
        }
    }
}

/// One entry of a service's `volumes:`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// `source:target[:mode]`
    Short(String),
    Long(VolumeMountLong),
}

/// Mapping form of a mount
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMountLong {
    /// `volume`, `bind` or `tmpfs`
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Volume key or host path
    pub source: Option<String>,
    pub target: String,
    pub read_only: Option<bool>,
}

/// A service's `networks:`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

/// Per-network options of a service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceNetworkConfig {
    /// Extra names the service resolves under
    pub aliases: Option<Vec<String>>,
    /// Static address inside the network's subnet
    pub ipv4_address: Option<String>,
}

/// `depends_on:` as a list or with conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Every entry waits for `service_started`
    Array(Vec<String>),
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Long form of one dependency
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependsOnCondition {
    pub condition: Option<String>,
}

/// `deploy:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub resources: Option<ResourcesConfig>,
    /// Takes precedence over `restart`
    pub restart_policy: Option<RestartPolicyConfig>,
}

/// `deploy.resources`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Accepted but not enforced
    pub limits: Option<ResourceSpec>,
    /// Checked against the host before the service starts
    pub reservations: Option<ResourceSpec>,
}

/// Limits or reservations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub cpus: Option<StringOrNumber>,
    pub memory: Option<String>,
    pub devices: Option<Vec<DeviceSpec>>,
}

/// One device request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSpec {
    pub capabilities: Option<Vec<String>>,
    pub driver: Option<String>,
    /// Count, either a number or "all"
    pub count: Option<StringOrNumber>,
    /// Specific devices; excludes `count`
    pub device_ids: Option<Vec<String>>,
}

/// `deploy.restart_policy`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicyConfig {
    /// `none`, `on-failure` or `any`
    pub condition: Option<String>,
    pub delay: Option<String>,
    /// Bounds `on-failure` restarts
    pub max_attempts: Option<StringOrNumber>,
}

/// `healthcheck:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    pub test: Option<HealthcheckTest>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    /// Consecutive failures before the service counts as unhealthy
    pub retries: Option<StringOrNumber>,
    /// Failures during this window are not counted
    pub start_period: Option<String>,
    pub disable: Option<bool>,
}

/// `healthcheck.test`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Run through `/bin/sh -c`
    Command(String),
    /// Starts with `NONE`, `CMD` or `CMD-SHELL`
    Array(Vec<String>),
}

/// `labels:` as a list or a mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, String>),
}

/// One entry under the top-level `networks:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `bridge` unless given
    pub driver: Option<String>,
    pub driver_opts: Option<BTreeMap<String, String>>,
    pub ipam: Option<IpamConfig>,
    pub external: Option<ExternalConfig>,
    pub internal: Option<bool>,
    pub labels: Option<LabelsConfig>,
    /// Host-level name, otherwise `<project>_<key>`
    pub name: Option<String>,
}

/// `ipam:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    pub driver: Option<String>,
    pub config: Option<Vec<IpamPoolConfig>>,
}

/// One address pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamPoolConfig {
    /// CIDR notation
    pub subnet: Option<String>,
    /// Must lie inside `subnet`
    pub gateway: Option<String>,
}

/// One entry under the top-level `volumes:`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub driver: Option<String>,
    pub driver_opts: Option<BTreeMap<String, String>>,
    pub external: Option<ExternalConfig>,
    pub labels: Option<LabelsConfig>,
    pub name: Option<String>,
}

/// `external:` on a network or volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    Bool(bool),
    /// Legacy form naming the resource
    Named { name: String },
}

impl ExternalConfig {
    /// Whether the resource is managed outside this project
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }
}

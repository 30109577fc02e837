//! Normalized project model
//!
//! Everything downstream of the loader (profile selection, graph building,
//! provisioning, supervision) works on these types. They are plain values:
//! components receive their own copy or a shared reference and never
//! mutate another component's data.

use crate::error::{KeelError, Result};
use crate::network::Subnet;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Name of the implicit network services join when they declare none
pub const DEFAULT_NETWORK: &str = "default";

/// A fully resolved compose project
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Project {
    /// Project name, used to namespace networks, volumes and containers
    pub name: String,
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub working_dir: PathBuf,
    /// Services keyed by name
    pub services: BTreeMap<String, Service>,
    /// Networks keyed by their name inside the document
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkSpec>,
    /// Volumes keyed by their name inside the document
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeSpec>,
}

impl Project {
    /// Look up a service by name
    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| KeelError::ServiceNotFound(name.to_string()))
    }

    /// Host-level name of a network declared in this project
    pub fn network_name(&self, key: &str) -> String {
        match self.networks.get(key) {
            Some(NetworkSpec { name: Some(explicit), .. }) => explicit.clone(),
            Some(NetworkSpec { external: true, .. }) => key.to_string(),
            _ => format!("{}_{}", self.name, key),
        }
    }

    /// Host-level name of a volume declared in this project
    pub fn volume_name(&self, key: &str) -> String {
        match self.volumes.get(key) {
            Some(VolumeSpec { name: Some(explicit), .. }) => explicit.clone(),
            Some(VolumeSpec { external: true, .. }) => key.to_string(),
            _ => format!("{}_{}", self.name, key),
        }
    }

    /// Container name for one instance of a service
    pub fn container_name(&self, service: &Service) -> String {
        service
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", self.name, service.name))
    }
}

/// One deployable unit
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Service {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBinding>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<MountSpec>,
    pub networks: BTreeMap<String, ServiceNetwork>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, DependencyCondition>,
    pub restart: RestartPolicy,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration"
    )]
    pub restart_delay: Option<Duration>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub profiles: BTreeSet<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration"
    )]
    pub stop_grace_period: Option<Duration>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Service {
    /// Create a service with only a name and image
    pub fn new(name: &str, image: &str) -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(DEFAULT_NETWORK.to_string(), ServiceNetwork::default());
        Self {
            name: name.to_string(),
            image: Some(image.to_string()),
            networks,
            ..Self::default()
        }
    }

    /// Add a `service_started` dependency
    pub fn depends_on(mut self, dependency: &str) -> Self {
        self.depends_on
            .insert(dependency.to_string(), DependencyCondition::Started);
        self
    }

    /// Tag the service with a profile
    pub fn profile(mut self, profile: &str) -> Self {
        self.profiles.insert(profile.to_string());
        self
    }

    /// Set the restart policy
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Add a port binding
    pub fn port(mut self, binding: PortBinding) -> Self {
        self.ports.push(binding);
        self
    }

    /// Set the command
    pub fn command(mut self, command: &[&str]) -> Self {
        self.command = command.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Whether the service is tagged with no profile at all
    pub fn always_on(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Full argv: entrypoint followed by command
    pub fn argv(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .chain(self.command.iter())
            .cloned()
            .collect()
    }
}

/// Build source for a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSpec {
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

/// Transport protocol of a port binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(KeelError::Parse(format!("unsupported protocol '{}'", other))),
        }
    }
}

/// Host-to-container port binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    /// `None` when only the container port is exposed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    /// `host_port:container_port/tcp`
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Whether two bindings would claim the same host socket
    pub fn collides_with(&self, other: &PortBinding) -> bool {
        let (Some(a), Some(b)) = (self.host_port, other.host_port) else {
            return false;
        };
        if a != b || self.protocol != other.protocol {
            return false;
        }
        match (self.host_ip, other.host_ip) {
            (Some(x), Some(y)) => x == y || x.is_unspecified() || y.is_unspecified(),
            _ => true,
        }
    }

    /// Parse the short syntax: `[[ip:]host:]container[/proto]`, with ranges
    pub fn parse_short(spec: &str) -> Result<Vec<PortBinding>> {
        let invalid =
            |reason: &str| KeelError::Parse(format!("invalid port '{}': {}", spec, reason));

        let (mapping, protocol) = match spec.rsplit_once('/') {
            Some((mapping, proto)) => (mapping, proto.parse::<Protocol>()?),
            None => (spec, Protocol::Tcp),
        };

        let (host_ip, rest) = split_host_ip(mapping).map_err(|r| invalid(&r))?;
        let parts: Vec<&str> = rest.split(':').collect();
        let (host, container) = match parts.as_slice() {
            [container] => (None, *container),
            [host, container] => (Some(*host), *container),
            [ip, host, container] if host_ip.is_none() => {
                let ip = ip
                    .parse::<IpAddr>()
                    .map_err(|_| invalid("bad host address"))?;
                return expand_ports(Some(ip), Some(*host), container, protocol)
                    .map_err(|r| invalid(&r));
            }
            _ => return Err(invalid("too many ':' separators")),
        };

        expand_ports(host_ip, host, container, protocol).map_err(|r| invalid(&r))
    }
}

fn split_host_ip(mapping: &str) -> std::result::Result<(Option<IpAddr>, &str), String> {
    if let Some(rest) = mapping.strip_prefix('[') {
        let (ip, tail) = rest
            .split_once("]:")
            .ok_or_else(|| "unterminated IPv6 address".to_string())?;
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| "bad IPv6 address".to_string())?;
        return Ok((Some(ip), tail));
    }
    Ok((None, mapping))
}

pub(crate) fn expand_ports(
    host_ip: Option<IpAddr>,
    host: Option<&str>,
    container: &str,
    protocol: Protocol,
) -> std::result::Result<Vec<PortBinding>, String> {
    let (c_start, c_end) = parse_port_range(container)?;
    let host_range = match host.filter(|h| !h.is_empty()) {
        Some(h) => Some(parse_port_range(h)?),
        None => None,
    };

    if let Some((h_start, h_end)) = host_range {
        if h_end - h_start != c_end - c_start {
            return Err("host and container ranges differ in length".to_string());
        }
    }

    Ok((0..=(c_end - c_start))
        .map(|offset| PortBinding {
            host_ip,
            host_port: host_range.map(|(start, _)| start + offset),
            container_port: c_start + offset,
            protocol,
        })
        .collect())
}

fn parse_port_range(s: &str) -> std::result::Result<(u16, u16), String> {
    let parse = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| format!("'{}' is not a port number", p))
    };
    match s.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if end < start {
                return Err(format!("range {} is reversed", s));
            }
            Ok((start, end))
        }
        None => {
            let port = parse(s)?;
            Ok((port, port))
        }
    }
}

/// Source of a mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "source", rename_all = "lowercase")]
pub enum MountSource {
    /// Named volume declared at the top level
    Volume(String),
    /// Host path
    Bind(PathBuf),
    /// Unnamed volume scoped to the container
    Anonymous,
    /// In-memory filesystem
    Tmpfs,
}

/// A mount inside a service container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    /// Parse the short syntax: `source:target[:mode]` or `target`
    pub fn parse_short(spec: &str, working_dir: &std::path::Path) -> Result<MountSpec> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => {
                return Err(KeelError::Parse(format!(
                    "invalid volume '{}': too many ':' separators",
                    spec
                )))
            }
        };

        if !target.starts_with('/') {
            return Err(KeelError::Parse(format!(
                "invalid volume '{}': container path must be absolute",
                spec
            )));
        }

        let mut read_only = false;
        for flag in mode.unwrap_or_default().split(',').filter(|f| !f.is_empty()) {
            match flag {
                "ro" => read_only = true,
                "rw" => read_only = false,
                // SELinux relabel and propagation flags are accepted and ignored
                "z" | "Z" | "shared" | "slave" | "private" | "rshared" | "rslave"
                | "rprivate" | "nocopy" => {}
                other => {
                    return Err(KeelError::Parse(format!(
                        "invalid volume '{}': unknown mode '{}'",
                        spec, other
                    )))
                }
            }
        }

        let source = match source {
            None => MountSource::Anonymous,
            Some(s) if is_host_path(s) => MountSource::Bind(resolve_host_path(s, working_dir)),
            Some(s) => MountSource::Volume(s.to_string()),
        };

        Ok(MountSpec {
            source,
            target: target.to_string(),
            read_only,
        })
    }
}

fn is_host_path(s: &str) -> bool {
    s.starts_with('/') || s.starts_with('.') || s.starts_with('~')
}

pub(crate) fn resolve_host_path(s: &str, working_dir: &std::path::Path) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = PathBuf::from(s);
    if path.is_absolute() {
        path
    } else {
        working_dir.join(path)
    }
}

/// Per-service network attachment options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceNetwork {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<Ipv4Addr>,
}

/// Condition a dependency must reach before its dependent starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DependencyCondition {
    /// Dependency reached `Running` at least once
    #[default]
    #[serde(rename = "service_started")]
    Started,
    /// Dependency's health check passed
    #[serde(rename = "service_healthy")]
    Healthy,
    /// Dependency exited with status 0
    #[serde(rename = "service_completed_successfully")]
    CompletedSuccessfully,
}

impl FromStr for DependencyCondition {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service_started" => Ok(DependencyCondition::Started),
            "service_healthy" => Ok(DependencyCondition::Healthy),
            "service_completed_successfully" => Ok(DependencyCondition::CompletedSuccessfully),
            other => Err(KeelError::Parse(format!(
                "unknown depends_on condition '{}'",
                other
            ))),
        }
    }
}

/// What to do when a service instance exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    No,
    /// Restart regardless of exit status
    Always,
    /// Restart on non-zero exit, optionally bounded
    OnFailure { max_retries: Option<u32> },
    /// Restart until an operator stops the deployment
    UnlessStopped,
}

impl RestartPolicy {
    /// Decide whether to restart after an attempt ended.
    ///
    /// `restarts` is the number of restarts already performed.
    pub fn should_restart(&self, failed: bool, restarts: u32) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure { max_retries } => {
                failed && max_retries.map_or(true, |max| restarts < max)
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, bound) = match s.split_once(':') {
            Some((name, bound)) => (name, Some(bound)),
            None => (s, None),
        };

        let policy = match name {
            "no" | "none" | "" => RestartPolicy::No,
            "always" | "any" => RestartPolicy::Always,
            "unless-stopped" => RestartPolicy::UnlessStopped,
            "on-failure" => {
                let max_retries = bound
                    .map(|b| {
                        b.parse::<u32>().map_err(|_| {
                            KeelError::Parse(format!("invalid restart retry count in '{}'", s))
                        })
                    })
                    .transpose()?;
                return Ok(RestartPolicy::OnFailure { max_retries });
            }
            other => {
                return Err(KeelError::Parse(format!(
                    "unknown restart policy '{}'",
                    other
                )))
            }
        };

        if bound.is_some() {
            return Err(KeelError::Parse(format!(
                "restart policy '{}' does not take a retry count",
                name
            )));
        }
        Ok(policy)
    }
}

/// How many devices a request wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCount {
    All,
    Exactly(u32),
}

/// A device reservation (`deploy.resources.reservations.devices`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub count: DeviceCount,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Health check probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    /// argv executed through the runtime; shell forms become `sh -c`
    pub test: Vec<String>,
    #[serde(serialize_with = "serialize_duration")]
    pub interval: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
    pub retries: u32,
    #[serde(serialize_with = "serialize_duration")]
    pub start_period: Duration,
}

impl HealthCheck {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Probe running `argv` with default timings
    pub fn command(argv: &[&str]) -> Self {
        Self {
            test: argv.iter().map(|s| s.to_string()).collect(),
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: Self::DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }
}

/// Network declared at the top level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkSpec {
    /// Explicit host-level name (`name:`), bypassing project namespacing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub driver: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ipam: Vec<IpamPool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NetworkSpec {
    /// A bridge network with a single subnet
    pub fn bridge(subnet: Subnet, gateway: Option<IpAddr>) -> Self {
        Self {
            driver: "bridge".to_string(),
            ipam: vec![IpamPool { subnet, gateway }],
            ..Self::default()
        }
    }
}

/// Address pool of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamPool {
    pub subnet: Subnet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

/// Volume declared at the top level
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub driver: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            name: None,
            driver: "local".to_string(),
            external: false,
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

/// Parse durations such as `30s`, `1m30s`, `500ms`, `2h` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || KeelError::Parse(format!("invalid duration '{}'", s));
    let s = s.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return Err(invalid()),
        };
        let part = Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn serialize_duration<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*d))
}

fn serialize_opt_duration<S: Serializer>(
    d: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_port_short_forms() {
        assert_eq!(
            PortBinding::parse_short("8000:8000").unwrap(),
            vec![PortBinding::tcp(8000, 8000)]
        );

        let udp = PortBinding::parse_short("60000:60000/udp").unwrap();
        assert_eq!(udp[0].protocol, Protocol::Udp);

        let bare = PortBinding::parse_short("11434").unwrap();
        assert_eq!(bare[0].host_port, None);
        assert_eq!(bare[0].container_port, 11434);

        let with_ip = PortBinding::parse_short("127.0.0.1:8545:8545").unwrap();
        assert_eq!(with_ip[0].host_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(with_ip[0].host_port, Some(8545));

        let v6 = PortBinding::parse_short("[::1]:80:8080").unwrap();
        assert_eq!(v6[0].host_ip, Some("::1".parse().unwrap()));
        assert_eq!(v6[0].container_port, 8080);
    }

    #[test]
    fn test_parse_port_ranges() {
        let range = PortBinding::parse_short("9000-9002:7000-7002").unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range[2].host_port, Some(9002));
        assert_eq!(range[2].container_port, 7002);

        assert!(PortBinding::parse_short("9000-9001:7000-7005").is_err());
        assert!(PortBinding::parse_short("abc:80").is_err());
        assert!(PortBinding::parse_short("80:80/sctp").is_err());
    }

    #[test]
    fn test_port_collisions() {
        let a = PortBinding::tcp(8000, 8000);
        let b = PortBinding::tcp(8000, 9000);
        assert!(a.collides_with(&b));

        let mut udp = b;
        udp.protocol = Protocol::Udp;
        assert!(!a.collides_with(&udp));

        let mut local = a;
        local.host_ip = Some("127.0.0.1".parse().unwrap());
        let mut other = a;
        other.host_ip = Some("10.0.0.1".parse().unwrap());
        assert!(!local.collides_with(&other));
        assert!(local.collides_with(&a));

        let exposed_only = PortBinding::parse_short("8000").unwrap()[0];
        assert!(!exposed_only.collides_with(&a));
    }

    #[test]
    fn test_parse_mounts() {
        let wd = Path::new("/srv/project");

        let named = MountSpec::parse_short("ollama:/root/.ollama", wd).unwrap();
        assert_eq!(named.source, MountSource::Volume("ollama".to_string()));
        assert!(!named.read_only);

        let bind = MountSpec::parse_short("./data:/data:ro", wd).unwrap();
        assert_eq!(bind.source, MountSource::Bind(PathBuf::from("/srv/project/./data")));
        assert!(bind.read_only);

        let anon = MountSpec::parse_short("/cache", wd).unwrap();
        assert_eq!(anon.source, MountSource::Anonymous);

        assert!(MountSpec::parse_short("data:relative", wd).is_err());
        assert!(MountSpec::parse_short("data:/x:bogus", wd).is_err());
    }

    #[test]
    fn test_restart_policy_parsing() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert_eq!("always".parse::<RestartPolicy>().unwrap(), RestartPolicy::Always);
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: None }
        );
        assert_eq!(
            "on-failure:5".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(5)
            }
        );
        assert!("always:3".parse::<RestartPolicy>().is_err());
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_restart_decisions() {
        let unbounded = RestartPolicy::OnFailure { max_retries: None };
        assert!(unbounded.should_restart(true, 1000));
        assert!(!unbounded.should_restart(false, 0));

        let bounded = RestartPolicy::OnFailure {
            max_retries: Some(2),
        };
        assert!(bounded.should_restart(true, 1));
        assert!(!bounded.should_restart(true, 2));

        assert!(RestartPolicy::Always.should_restart(false, 10));
        assert!(!RestartPolicy::No.should_restart(true, 0));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-1").is_err());
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_out_of_range_durations_are_rejected() {
        for value in ["inf", "NaN", "-inf", "1e30", "99999999999999999999h"] {
            assert!(
                matches!(parse_duration(value), Err(KeelError::Parse(_))),
                "{} should not parse",
                value
            );
        }
        let huge = format!("{}s{}s", u64::MAX, u64::MAX);
        assert!(parse_duration(&huge).is_err());
    }

    #[test]
    fn test_project_resource_names() {
        let mut project = Project {
            name: "dria".to_string(),
            ..Project::default()
        };
        project
            .networks
            .insert("waku".to_string(), NetworkSpec::default());
        project.volumes.insert(
            "models".to_string(),
            VolumeSpec {
                name: Some("shared-models".to_string()),
                ..VolumeSpec::default()
            },
        );

        assert_eq!(project.network_name("waku"), "dria_waku");
        assert_eq!(project.volume_name("models"), "shared-models");
        let svc = Service::new("compute", "node:latest");
        assert_eq!(project.container_name(&svc), "dria-compute-1");
    }
}

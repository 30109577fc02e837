//! Compose document loader
//!
//! Pipeline: parse YAML, expand merge keys, drop `x-*` extensions, overlay
//! additional documents, interpolate against a [`VariableSnapshot`],
//! deserialize into [`ComposeConfig`] and normalize into a [`Project`].

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, DependsOnConfig, DeviceSpec, EnvFileConfig,
    EnvironmentConfig, HealthcheckConfig, HealthcheckTest, LabelsConfig, NetworkConfig,
    NetworksConfig, PortConfig, ServiceConfig, StringOrNumber, VolumeConfig, VolumeMount,
};
use super::environment::{parse_env_file, VariableSnapshot};
use super::interpolate::interpolate_value;
use super::merge::{merge_documents, resolve_merge_keys};
use super::model::{
    expand_ports, parse_duration, resolve_host_path, BuildSpec, DependencyCondition, DeviceCount,
    DeviceRequest, HealthCheck, IpamPool, MountSource, MountSpec, NetworkSpec, PortBinding,
    Project, Protocol, RestartPolicy, Service, ServiceNetwork, VolumeSpec, DEFAULT_NETWORK,
};
use crate::error::{KeelError, Result};
use crate::network::Subnet;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Variable consulted for the project name when the document has none
pub const PROJECT_NAME_VAR: &str = "COMPOSE_PROJECT_NAME";

fn service_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("service name pattern is valid")
    })
}

/// Loads compose documents into a [`Project`]
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Directory relative paths and env files are resolved against
    working_dir: PathBuf,
    /// Project name override (`-p`)
    project_name: Option<String>,
}

impl ConfigLoader {
    /// Create a loader for documents living in `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            project_name: None,
        }
    }

    /// Force the project name
    pub fn project_name(mut self, name: &str) -> Self {
        self.project_name = Some(name.to_string());
        self
    }

    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Load a single document from a string
    pub fn load_str(&self, content: &str, vars: &VariableSnapshot) -> Result<Project> {
        let document = parse_document(content, "<inline>")?;
        self.resolve(document, vars)
    }

    /// Load one or more documents, later files overlaying earlier ones
    pub fn load_files(&self, paths: &[PathBuf], vars: &VariableSnapshot) -> Result<Project> {
        if paths.is_empty() {
            return Err(KeelError::Parse("no compose file given".to_string()));
        }

        let mut merged = Mapping::new();
        for path in paths {
            let content = std::fs::read_to_string(path).map_err(|e| {
                KeelError::Parse(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let document = parse_document(&content, &path.display().to_string())?;
            merged = merge_documents(&merged, &document);
            tracing::debug!("Loaded compose file {}", path.display());
        }

        self.resolve(merged, vars)
    }

    fn resolve(&self, document: Mapping, vars: &VariableSnapshot) -> Result<Project> {
        let mut document = Value::Mapping(document);
        interpolate_value(&mut document, vars)?;

        let config: ComposeConfig = serde_yaml::from_value(document)
            .map_err(|e| KeelError::Parse(format!("Invalid compose document: {}", e)))?;

        let name = self.resolve_project_name(config.name.as_deref(), vars)?;
        let project = Normalizer {
            working_dir: &self.working_dir,
            vars,
        }
        .project(name, config)?;

        tracing::debug!(
            "Resolved project {} with {} services",
            project.name,
            project.services.len()
        );
        Ok(project)
    }

    fn resolve_project_name(
        &self,
        declared: Option<&str>,
        vars: &VariableSnapshot,
    ) -> Result<String> {
        let from_dir = self
            .working_dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let raw = self
            .project_name
            .clone()
            .or_else(|| declared.map(str::to_string))
            .or_else(|| vars.get(PROJECT_NAME_VAR).map(str::to_string))
            .or(from_dir)
            .unwrap_or_default();

        let name: String = raw
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();

        if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(KeelError::Parse(format!(
                "cannot derive a project name from '{}'",
                raw
            )));
        }
        Ok(name)
    }
}

/// Parse one document, expand merge keys and drop top-level extensions
fn parse_document(content: &str, origin: &str) -> Result<Mapping> {
    let value: Value = serde_yaml::from_str(content)
        .map_err(|e| KeelError::Parse(format!("Failed to parse YAML in {}: {}", origin, e)))?;

    let mut value = match value {
        Value::Mapping(map) => Value::Mapping(map),
        Value::Null => Value::Mapping(Mapping::new()),
        _ => {
            return Err(KeelError::Parse(format!(
                "{} must contain a mapping at the top level",
                origin
            )))
        }
    };

    resolve_merge_keys(&mut value)?;

    let Value::Mapping(mut map) = value else {
        return Err(KeelError::Parse(format!("{} lost its top-level mapping", origin)));
    };
    map.retain(|key, _| !key.as_str().is_some_and(|k| k.starts_with("x-")));
    Ok(map)
}

struct Normalizer<'a> {
    working_dir: &'a Path,
    vars: &'a VariableSnapshot,
}

impl Normalizer<'_> {
    fn project(&self, name: String, config: ComposeConfig) -> Result<Project> {
        let mut networks = BTreeMap::new();
        for (key, network) in config.networks {
            networks.insert(key.clone(), self.network(&key, network.unwrap_or_default())?);
        }

        let mut volumes = BTreeMap::new();
        for (key, volume) in config.volumes {
            volumes.insert(key, self.volume(volume.unwrap_or_default()));
        }

        let mut services = BTreeMap::new();
        for (service_name, service) in config.services {
            let service = self.service(&service_name, service)?;

            for network in service.networks.keys() {
                if network != DEFAULT_NETWORK && !networks.contains_key(network) {
                    return Err(KeelError::Parse(format!(
                        "Service '{}' uses undefined network '{}'",
                        service_name, network
                    )));
                }
            }
            for mount in &service.volumes {
                if let MountSource::Volume(volume) = &mount.source {
                    if !volumes.contains_key(volume) {
                        return Err(KeelError::Parse(format!(
                            "Service '{}' uses undefined volume '{}'",
                            service_name, volume
                        )));
                    }
                }
            }

            services.insert(service_name, service);
        }

        let uses_default = services
            .values()
            .any(|s| s.networks.contains_key(DEFAULT_NETWORK));
        if uses_default && !networks.contains_key(DEFAULT_NETWORK) {
            networks.insert(
                DEFAULT_NETWORK.to_string(),
                NetworkSpec {
                    driver: "bridge".to_string(),
                    ..NetworkSpec::default()
                },
            );
        }

        Ok(Project {
            name,
            working_dir: self.working_dir.to_path_buf(),
            services,
            networks,
            volumes,
        })
    }

    fn service(&self, name: &str, config: ServiceConfig) -> Result<Service> {
        if !service_name_pattern().is_match(name) {
            return Err(KeelError::Parse(format!(
                "Invalid service name '{}': must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
                name
            )));
        }
        if config.image.is_none() && config.build.is_none() {
            return Err(KeelError::Parse(format!(
                "Service '{}' must have either 'image' or 'build' specified",
                name
            )));
        }

        let invalid = |what: &str, detail: String| {
            KeelError::Parse(format!("Service '{}': invalid {}: {}", name, what, detail))
        };

        let build = config.build.map(|build| match build {
            BuildConfig::Simple(context) => BuildSpec {
                context,
                dockerfile: None,
            },
            BuildConfig::Full(full) => BuildSpec {
                context: full.context.unwrap_or_else(|| ".".to_string()),
                dockerfile: full.dockerfile,
            },
        });

        let mut service = Service {
            name: name.to_string(),
            image: config.image,
            build,
            entrypoint: config.entrypoint.map(entrypoint_argv).unwrap_or_default(),
            command: config.command.map(command_argv).unwrap_or_default(),
            working_dir: config.working_dir,
            user: config.user,
            container_name: config.container_name,
            hostname: config.hostname,
            profiles: config.profiles.unwrap_or_default().into_iter().collect(),
            ..Service::default()
        };

        service.environment = self.environment(name, config.env_file, config.environment)?;

        for port in config.ports.unwrap_or_default() {
            service.ports.extend(port_bindings(port).map_err(|e| in_service(name, e))?);
        }

        for mount in config.volumes.unwrap_or_default() {
            service.volumes.push(self.mount(mount).map_err(|e| in_service(name, e))?);
        }

        service.networks = match config.networks {
            None => BTreeMap::from([(DEFAULT_NETWORK.to_string(), ServiceNetwork::default())]),
            Some(NetworksConfig::Array(names)) => names
                .into_iter()
                .map(|n| (n, ServiceNetwork::default()))
                .collect(),
            Some(NetworksConfig::Map(map)) => {
                let mut networks = BTreeMap::new();
                for (network, options) in map {
                    let options = options.unwrap_or_default();
                    let ipv4_address = options
                        .ipv4_address
                        .map(|ip| {
                            ip.parse::<Ipv4Addr>()
                                .map_err(|_| invalid("ipv4_address", ip.clone()))
                        })
                        .transpose()?;
                    networks.insert(
                        network,
                        ServiceNetwork {
                            aliases: options.aliases.unwrap_or_default(),
                            ipv4_address,
                        },
                    );
                }
                networks
            }
        };

        service.depends_on = match config.depends_on {
            None => BTreeMap::new(),
            Some(DependsOnConfig::Array(names)) => names
                .into_iter()
                .map(|n| (n, DependencyCondition::Started))
                .collect(),
            Some(DependsOnConfig::Map(map)) => {
                let mut deps = BTreeMap::new();
                for (dependency, condition) in map {
                    let condition = match condition.condition {
                        Some(c) => c.parse()?,
                        None => DependencyCondition::Started,
                    };
                    deps.insert(dependency, condition);
                }
                deps
            }
        };

        if let Some(restart) = config.restart {
            service.restart = restart.parse()?;
        }

        if let Some(deploy) = config.deploy {
            if let Some(policy) = deploy.restart_policy {
                service.restart = match policy.condition.as_deref().unwrap_or("any") {
                    "none" => RestartPolicy::No,
                    "on-failure" => RestartPolicy::OnFailure {
                        max_retries: policy
                            .max_attempts
                            .map(|n| number(&n, "restart_policy max_attempts"))
                            .transpose()?,
                    },
                    "any" => RestartPolicy::Always,
                    other => return Err(invalid("restart_policy condition", other.to_string())),
                };
                service.restart_delay = policy.delay.as_deref().map(parse_duration).transpose()?;
            }

            if let Some(reservations) = deploy.resources.and_then(|r| r.reservations) {
                service.cpus = reservations
                    .cpus
                    .map(|cpus| {
                        cpus.to_string()
                            .parse::<f64>()
                            .map_err(|_| invalid("cpus", cpus.to_string()))
                    })
                    .transpose()?;
                for device in reservations.devices.unwrap_or_default() {
                    service
                        .devices
                        .push(device_request(device).map_err(|e| invalid("device", e))?);
                }
            }
        }

        service.healthcheck = config.healthcheck.map(healthcheck).transpose()?.flatten();
        service.stop_grace_period = config
            .stop_grace_period
            .as_deref()
            .map(parse_duration)
            .transpose()?;
        service.labels = labels(config.labels);

        Ok(service)
    }

    fn environment(
        &self,
        service: &str,
        env_files: Option<EnvFileConfig>,
        environment: Option<EnvironmentConfig>,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();

        let files = match env_files {
            None => Vec::new(),
            Some(EnvFileConfig::Single(file)) => vec![file],
            Some(EnvFileConfig::Multiple(files)) => files,
        };
        for file in files {
            let path = resolve_host_path(&file, self.working_dir);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                KeelError::Parse(format!(
                    "Service '{}': failed to read env_file {}: {}",
                    service,
                    path.display(),
                    e
                ))
            })?;
            env.extend(parse_env_file(&content)?);
        }

        match environment {
            None => {}
            Some(EnvironmentConfig::Array(items)) => {
                for item in items {
                    match item.split_once('=') {
                        Some((key, value)) => {
                            env.insert(key.to_string(), value.to_string());
                        }
                        // bare `KEY` passes the variable through when it is set
                        None => {
                            if let Some(value) = self.vars.get(&item) {
                                env.insert(item.clone(), value.to_string());
                            }
                        }
                    }
                }
            }
            Some(EnvironmentConfig::Map(map)) => {
                for (key, value) in map {
                    let value = match value {
                        Some(Value::String(s)) => Some(s),
                        Some(Value::Number(n)) => Some(n.to_string()),
                        Some(Value::Bool(b)) => Some(b.to_string()),
                        None | Some(Value::Null) => self.vars.get(&key).map(str::to_string),
                        Some(_) => {
                            return Err(KeelError::Parse(format!(
                                "Service '{}': environment value for {} must be a scalar",
                                service, key
                            )))
                        }
                    };
                    if let Some(value) = value {
                        env.insert(key, value);
                    }
                }
            }
        }

        Ok(env)
    }

    fn mount(&self, mount: VolumeMount) -> Result<MountSpec> {
        match mount {
            VolumeMount::Short(spec) => MountSpec::parse_short(&spec, self.working_dir),
            VolumeMount::Long(long) => {
                if !long.target.starts_with('/') {
                    return Err(KeelError::Parse(format!(
                        "container path '{}' must be absolute",
                        long.target
                    )));
                }
                let source = match (long.mount_type.as_deref().unwrap_or("volume"), long.source) {
                    ("volume", Some(name)) if !name.is_empty() => MountSource::Volume(name),
                    ("volume", _) => MountSource::Anonymous,
                    ("bind", Some(path)) => {
                        MountSource::Bind(resolve_host_path(&path, self.working_dir))
                    }
                    ("tmpfs", _) => MountSource::Tmpfs,
                    (other, _) => {
                        return Err(KeelError::Parse(format!(
                            "unsupported mount type '{}' for {}",
                            other, long.target
                        )))
                    }
                };
                Ok(MountSpec {
                    source,
                    target: long.target,
                    read_only: long.read_only.unwrap_or(false),
                })
            }
        }
    }

    fn network(&self, key: &str, config: NetworkConfig) -> Result<NetworkSpec> {
        let mut ipam = Vec::new();
        for pool in config.ipam.and_then(|i| i.config).unwrap_or_default() {
            let Some(subnet) = pool.subnet else { continue };
            let subnet = Subnet::parse(&subnet)
                .map_err(|e| KeelError::Parse(format!("Network '{}': {}", key, e)))?;
            let gateway = pool
                .gateway
                .map(|g| {
                    g.parse::<IpAddr>().map_err(|_| {
                        KeelError::Parse(format!("Network '{}': invalid gateway {}", key, g))
                    })
                })
                .transpose()?;
            if let Some(gateway) = gateway {
                if !subnet.contains(gateway) {
                    return Err(KeelError::Parse(format!(
                        "Network '{}': gateway {} is outside subnet {}",
                        key, gateway, subnet
                    )));
                }
            }
            ipam.push(IpamPool { subnet, gateway });
        }

        let (external, external_name) = match config.external {
            Some(super::config::ExternalConfig::Named { name }) => (true, Some(name)),
            Some(flag) => (flag.is_external(), None),
            None => (false, None),
        };

        Ok(NetworkSpec {
            name: config.name.or(external_name),
            driver: config.driver.unwrap_or_else(|| "bridge".to_string()),
            ipam,
            internal: config.internal.unwrap_or(false),
            external,
            options: config.driver_opts.unwrap_or_default(),
            labels: labels(config.labels),
        })
    }

    fn volume(&self, config: VolumeConfig) -> VolumeSpec {
        let (external, external_name) = match config.external {
            Some(super::config::ExternalConfig::Named { name }) => (true, Some(name)),
            Some(flag) => (flag.is_external(), None),
            None => (false, None),
        };

        VolumeSpec {
            name: config.name.or(external_name),
            driver: config.driver.unwrap_or_else(|| "local".to_string()),
            external,
            options: config.driver_opts.unwrap_or_default(),
            labels: labels(config.labels),
        }
    }
}

fn command_argv(command: CommandConfig) -> Vec<String> {
    match command {
        CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s],
        CommandConfig::Exec(argv) => argv,
    }
}

fn entrypoint_argv(entrypoint: CommandConfig) -> Vec<String> {
    match entrypoint {
        CommandConfig::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
        CommandConfig::Exec(argv) => argv,
    }
}

fn port_bindings(port: PortConfig) -> Result<Vec<PortBinding>> {
    match port {
        PortConfig::Number(container_port) => Ok(vec![PortBinding {
            host_ip: None,
            host_port: None,
            container_port,
            protocol: Protocol::Tcp,
        }]),
        PortConfig::Short(spec) => PortBinding::parse_short(&spec),
        PortConfig::Long(long) => {
            let target = long.target.to_string();
            let published = long.published.map(|p| p.to_string());
            let invalid = |reason: String| {
                KeelError::Parse(format!("invalid port with target '{}': {}", target, reason))
            };
            let host_ip = long
                .host_ip
                .filter(|ip| !ip.is_empty())
                .map(|ip| {
                    ip.parse::<IpAddr>()
                        .map_err(|_| KeelError::Parse(format!("invalid host_ip {}", ip)))
                })
                .transpose()?;
            let protocol = match long.protocol {
                Some(p) => p.parse()?,
                None => Protocol::Tcp,
            };
            expand_ports(host_ip, published.as_deref(), &target, protocol).map_err(invalid)
        }
    }
}

fn number<T: std::str::FromStr>(value: &StringOrNumber, field: &str) -> Result<T> {
    value
        .parse()
        .ok_or_else(|| KeelError::Parse(format!("{} '{}' is not a valid number", field, value)))
}

fn device_request(device: DeviceSpec) -> std::result::Result<DeviceRequest, String> {
    let device_ids = device.device_ids.unwrap_or_default();
    let count = match device.count {
        Some(StringOrNumber::String(s)) if s == "all" => DeviceCount::All,
        Some(count) => DeviceCount::Exactly(
            count
                .to_string()
                .parse()
                .map_err(|_| format!("count '{}' is neither a number nor 'all'", count))?,
        ),
        None if device_ids.is_empty() => DeviceCount::All,
        None => DeviceCount::Exactly(device_ids.len() as u32),
    };

    Ok(DeviceRequest {
        driver: device.driver,
        count,
        device_ids,
        capabilities: device.capabilities.unwrap_or_default(),
    })
}

fn healthcheck(config: HealthcheckConfig) -> Result<Option<HealthCheck>> {
    if config.disable.unwrap_or(false) {
        return Ok(None);
    }

    let test = match config.test {
        None => return Ok(None),
        Some(HealthcheckTest::Command(cmd)) => {
            vec!["/bin/sh".to_string(), "-c".to_string(), cmd]
        }
        Some(HealthcheckTest::Array(items)) => match items.split_first() {
            Some((kind, _)) if kind == "NONE" => return Ok(None),
            Some((kind, rest)) if kind == "CMD" => rest.to_vec(),
            Some((kind, rest)) if kind == "CMD-SHELL" => {
                let mut argv = vec!["/bin/sh".to_string(), "-c".to_string()];
                argv.push(rest.join(" "));
                argv
            }
            _ => {
                return Err(KeelError::Parse(format!(
                    "healthcheck test must start with NONE, CMD or CMD-SHELL: {:?}",
                    items
                )))
            }
        },
    };

    let duration = |value: Option<String>, default| match value {
        Some(v) => parse_duration(&v),
        None => Ok(default),
    };

    Ok(Some(HealthCheck {
        test,
        interval: duration(config.interval, HealthCheck::DEFAULT_INTERVAL)?,
        timeout: duration(config.timeout, HealthCheck::DEFAULT_TIMEOUT)?,
        retries: match config.retries {
            Some(retries) => number(&retries, "healthcheck retries")?,
            None => HealthCheck::DEFAULT_RETRIES,
        },
        start_period: duration(config.start_period, std::time::Duration::ZERO)?,
    }))
}

fn labels(config: Option<LabelsConfig>) -> BTreeMap<String, String> {
    match config {
        None => BTreeMap::new(),
        Some(LabelsConfig::Map(map)) => map,
        Some(LabelsConfig::Array(items)) => items
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item, String::new()),
            })
            .collect(),
    }
}

fn in_service(service: &str, err: KeelError) -> KeelError {
    match err {
        KeelError::Parse(message) => {
            KeelError::Parse(format!("Service '{}': {}", service, message))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn load(yaml: &str) -> Result<Project> {
        ConfigLoader::new("/srv/dria").load_str(yaml, &VariableSnapshot::new())
    }

    #[test]
    fn test_load_simple_project() {
        let project = load(
            r#"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
      PGPORT: 5432
"#,
        )
        .unwrap();

        assert_eq!(project.name, "dria");
        assert_eq!(project.services.len(), 2);
        let db = project.service("db").unwrap();
        assert_eq!(db.environment["PGPORT"], "5432");
        assert!(db.networks.contains_key(DEFAULT_NETWORK));
        assert!(project.networks.contains_key(DEFAULT_NETWORK));
    }

    #[test]
    fn test_missing_image_and_build() {
        let err = load("services:\n  web:\n    ports: [\"80:80\"]\n").unwrap_err();
        assert!(matches!(err, KeelError::Parse(ref m) if m.contains("web")));
    }

    #[test]
    fn test_invalid_service_name() {
        let err = load("services:\n  _hidden:\n    image: x\n").unwrap_err();
        assert!(matches!(err, KeelError::Parse(ref m) if m.contains("_hidden")));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(load("services: [web"), Err(KeelError::Parse(_))));
        assert!(matches!(load("- just\n- a list\n"), Err(KeelError::Parse(_))));
        assert!(matches!(
            load("services:\n  web:\n    image: x\n    ports: 80\n"),
            Err(KeelError::Parse(_))
        ));
    }

    #[test]
    fn test_fragments_and_interpolation() {
        let vars = VariableSnapshot::from_pairs([("DKN_MODELS", "phi3:mini")]);
        let project = ConfigLoader::new("/srv/dria")
            .load_str(
                r#"
x-node: &node
  restart: on-failure
  environment:
    RUST_LOG: ${RUST_LOG:-info}
services:
  compute:
    <<: *node
    image: firstbatch/dkn-compute-node:${TAG:-latest}
    environment:
      DKN_MODELS: ${DKN_MODELS}
"#,
                &vars,
            )
            .unwrap();

        let compute = project.service("compute").unwrap();
        assert_eq!(
            compute.image.as_deref(),
            Some("firstbatch/dkn-compute-node:latest")
        );
        assert_eq!(compute.environment["RUST_LOG"], "info");
        assert_eq!(compute.environment["DKN_MODELS"], "phi3:mini");
        assert_eq!(
            compute.restart,
            RestartPolicy::OnFailure { max_retries: None }
        );
    }

    #[test]
    fn test_extension_fields_are_not_interpolated() {
        // the fragment references a variable that is never set
        let project = load(
            r#"
x-unused:
  image: ${NEVER_SET}
services:
  a:
    image: busybox
"#,
        )
        .unwrap();
        assert_eq!(project.services.len(), 1);
    }

    #[test]
    fn test_missing_variable_reports_location() {
        let err = load("services:\n  a:\n    image: busybox:${TAG}\n").unwrap_err();
        match err {
            KeelError::MissingVariable {
                variable, location, ..
            } => {
                assert_eq!(variable, "TAG");
                assert_eq!(location, "services.a.image");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_dependencies_and_conditions() {
        let project = load(
            r#"
services:
  ollama:
    image: ollama/ollama
  setup:
    image: busybox
  node:
    image: node
    depends_on:
      ollama:
        condition: service_healthy
      setup:
        condition: service_completed_successfully
"#,
        )
        .unwrap();

        let node = project.service("node").unwrap();
        assert_eq!(node.depends_on["ollama"], DependencyCondition::Healthy);
        assert_eq!(
            node.depends_on["setup"],
            DependencyCondition::CompletedSuccessfully
        );

        assert!(load("services:\n  a:\n    image: x\n    depends_on:\n      b:\n        condition: sometime\n").is_err());
    }

    #[test]
    fn test_deploy_section() {
        let project = load(
            r#"
services:
  ollama:
    image: ollama/ollama
    deploy:
      restart_policy:
        condition: on-failure
        max_attempts: 3
        delay: 2s
      resources:
        reservations:
          cpus: "0.5"
          devices:
            - driver: nvidia
              count: all
              capabilities: [gpu]
"#,
        )
        .unwrap();

        let ollama = project.service("ollama").unwrap();
        assert_eq!(
            ollama.restart,
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
        assert_eq!(ollama.restart_delay, Some(Duration::from_secs(2)));
        assert_eq!(ollama.cpus, Some(0.5));
        assert_eq!(ollama.devices[0].count, DeviceCount::All);
        assert_eq!(ollama.devices[0].driver.as_deref(), Some("nvidia"));
    }

    #[test]
    fn test_long_port_syntax() {
        let vars = VariableSnapshot::from_pairs([("API_PORT", "8000")]);
        let project = ConfigLoader::new("/srv/dria")
            .load_str(
                r#"
services:
  api:
    image: x
    ports:
      - target: ${API_PORT}
        published: "9000"
        protocol: udp
      - target: 7000-7001
        published: 17000-17001
"#,
                &vars,
            )
            .unwrap();

        let api = project.service("api").unwrap();
        assert_eq!(api.ports.len(), 3);
        assert_eq!(api.ports[0].container_port, 8000);
        assert_eq!(api.ports[0].host_port, Some(9000));
        assert_eq!(api.ports[0].protocol, Protocol::Udp);
        assert_eq!(api.ports[2].container_port, 7001);
        assert_eq!(api.ports[2].host_port, Some(17001));

        assert!(matches!(
            load("services:\n  api:\n    image: x\n    ports:\n      - published: 80\n"),
            Err(KeelError::Parse(_))
        ));
        assert!(matches!(
            load("services:\n  api:\n    image: x\n    ports:\n      - target: web\n"),
            Err(KeelError::Parse(_))
        ));
    }

    #[test]
    fn test_interpolated_counts() {
        let vars = VariableSnapshot::from_pairs([("RETRIES", "4"), ("ATTEMPTS", "2")]);
        let project = ConfigLoader::new("/srv/dria")
            .load_str(
                r#"
services:
  worker:
    image: x
    healthcheck:
      test: ["CMD", "true"]
      retries: ${RETRIES}
    deploy:
      restart_policy:
        condition: on-failure
        max_attempts: ${ATTEMPTS}
"#,
                &vars,
            )
            .unwrap();

        let worker = project.service("worker").unwrap();
        assert_eq!(worker.healthcheck.as_ref().unwrap().retries, 4);
        assert_eq!(
            worker.restart,
            RestartPolicy::OnFailure {
                max_retries: Some(2)
            }
        );

        let err = ConfigLoader::new("/srv/dria")
            .load_str(
                "services:\n  w:\n    image: x\n    healthcheck:\n      test: [\"CMD\", \"true\"]\n      retries: ${RETRIES}\n",
                &VariableSnapshot::from_pairs([("RETRIES", "often")]),
            )
            .unwrap_err();
        assert!(matches!(err, KeelError::Parse(ref m) if m.contains("retries")));
    }

    #[test]
    fn test_networks_and_volumes() {
        let project = load(
            r#"
services:
  relay:
    image: waku
    networks:
      waku:
        aliases: [relay-node]
        ipv4_address: 10.5.0.10
    volumes:
      - data:/data
      - type: bind
        source: ./keys
        target: /keys
        read_only: true
networks:
  waku:
    ipam:
      config:
        - subnet: 10.5.0.0/16
          gateway: 10.5.0.1
volumes:
  data:
"#,
        )
        .unwrap();

        let relay = project.service("relay").unwrap();
        assert_eq!(relay.networks["waku"].aliases, vec!["relay-node"]);
        assert_eq!(
            relay.networks["waku"].ipv4_address,
            Some(Ipv4Addr::new(10, 5, 0, 10))
        );
        assert!(!project.networks.contains_key(DEFAULT_NETWORK));
        assert_eq!(project.networks["waku"].ipam[0].subnet.to_string(), "10.5.0.0/16");
        assert_eq!(project.volumes["data"].driver, "local");
        assert!(relay.volumes[1].read_only);
        assert_eq!(
            relay.volumes[1].source,
            MountSource::Bind(PathBuf::from("/srv/dria/./keys"))
        );
    }

    #[test]
    fn test_undefined_resources() {
        let err = load("services:\n  a:\n    image: x\n    networks: [nope]\n").unwrap_err();
        assert!(err.to_string().contains("nope"));

        let err = load("services:\n  a:\n    image: x\n    volumes: [\"nope:/data\"]\n").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_gateway_outside_subnet() {
        let err = load(
            r#"
services:
  a: {image: x}
networks:
  n:
    ipam:
      config:
        - subnet: 10.0.0.0/24
          gateway: 10.0.1.1
"#,
        )
        .unwrap_err();
        assert!(matches!(err, KeelError::Parse(_)));
    }

    #[test]
    fn test_healthcheck_forms() {
        let project = load(
            r#"
services:
  a:
    image: x
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost"]
      interval: 5s
      retries: 5
  b:
    image: x
    healthcheck:
      test: ollama list
  c:
    image: x
    healthcheck:
      test: ["NONE"]
"#,
        )
        .unwrap();

        let a = project.service("a").unwrap().healthcheck.clone().unwrap();
        assert_eq!(a.test, vec!["curl", "-f", "http://localhost"]);
        assert_eq!(a.interval, Duration::from_secs(5));
        assert_eq!(a.retries, 5);

        let b = project.service("b").unwrap().healthcheck.clone().unwrap();
        assert_eq!(b.test, vec!["/bin/sh", "-c", "ollama list"]);
        assert!(project.service("c").unwrap().healthcheck.is_none());
    }

    #[test]
    fn test_env_file_and_passthrough() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("node.env"), "DKN_WALLET=abc\nSHARED=file\n").unwrap();

        let vars = VariableSnapshot::from_pairs([("HOST_ONLY", "from-host")]);
        let project = ConfigLoader::new(temp.path())
            .project_name("dria")
            .load_str(
                r#"
services:
  node:
    image: node
    env_file: node.env
    environment:
      - SHARED=inline
      - HOST_ONLY
      - NOT_SET
"#,
                &vars,
            )
            .unwrap();

        let env = &project.service("node").unwrap().environment;
        assert_eq!(env["DKN_WALLET"], "abc");
        assert_eq!(env["SHARED"], "inline");
        assert_eq!(env["HOST_ONLY"], "from-host");
        assert!(!env.contains_key("NOT_SET"));
    }

    #[test]
    fn test_load_files_overlay() {
        let temp = tempdir().unwrap();
        let base = temp.path().join("compose.yaml");
        let overlay = temp.path().join("compose.override.yaml");
        std::fs::write(
            &base,
            "name: Stack\nservices:\n  web:\n    image: nginx\n    ports: [\"80:80\"]\n",
        )
        .unwrap();
        std::fs::write(&overlay, "services:\n  web:\n    ports: [\"8080:80\"]\n").unwrap();

        assert_eq!(ConfigLoader::find_compose_file(temp.path()), Some(base.clone()));

        let project = ConfigLoader::new(temp.path())
            .load_files(&[base, overlay], &VariableSnapshot::new())
            .unwrap();
        assert_eq!(project.name, "stack");
        let web = project.service("web").unwrap();
        assert_eq!(web.ports, vec![PortBinding::tcp(8080, 80)]);
    }

    #[test]
    fn test_project_name_precedence() {
        let vars = VariableSnapshot::from_pairs([(PROJECT_NAME_VAR, "fromenv")]);
        let loader = ConfigLoader::new("/srv/dria");

        let project = loader.load_str("services: {}\n", &vars).unwrap();
        assert_eq!(project.name, "fromenv");

        let project = loader.load_str("name: declared\nservices: {}\n", &vars).unwrap();
        assert_eq!(project.name, "declared");

        let project = loader
            .clone()
            .project_name("forced")
            .load_str("name: declared\n", &vars)
            .unwrap();
        assert_eq!(project.name, "forced");
    }

    #[test]
    fn test_shell_command_runs_through_sh() {
        let project = load("services:\n  a:\n    image: x\n    command: echo hi && sleep 1\n").unwrap();
        assert_eq!(
            project.service("a").unwrap().command,
            vec!["/bin/sh", "-c", "echo hi && sleep 1"]
        );
    }
}

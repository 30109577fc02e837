//! Network and volume provisioning
//!
//! Provisioning is idempotent: a resource that already exists with the same
//! fingerprint is reused, one whose declaration changed is a conflict.
//! Every check runs before anything is created, so a failed call leaves
//! the host untouched.

use crate::compose::model::{IpamPool, MountSource, NetworkSpec, Project, Service};
use crate::container::{Mount, NetworkAttachment};
use crate::error::{KeelError, Result};
use crate::network::{
    config::fingerprint as network_fingerprint, free_default_subnet, Network, NetworkManager,
    Subnet,
};
use crate::storage::volume::fingerprint as volume_fingerprint;
use crate::storage::{Volume, VolumeManager};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// What provisioning did with one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionAction {
    /// Newly created
    Created,
    /// Already present with the same configuration
    Unchanged,
    /// Managed outside the project and found
    External,
}

/// Outcome for one network or volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    /// Key inside the document
    pub key: String,
    /// Host-level name
    pub name: String,
    /// What happened
    pub action: ProvisionAction,
}

/// Result of a provisioning pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub networks: Vec<ResourceOutcome>,
    pub volumes: Vec<ResourceOutcome>,
}

impl ProvisionReport {
    /// Whether the pass created nothing
    pub fn is_noop(&self) -> bool {
        self.networks
            .iter()
            .chain(self.volumes.iter())
            .all(|o| o.action != ProvisionAction::Created)
    }
}

/// Creates and attaches the shared infrastructure of a project
pub struct Provisioner {
    networks: NetworkManager,
    volumes: VolumeManager,
}

impl Provisioner {
    /// Open the provisioner on a data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            networks: NetworkManager::new(data_dir.join("networks"))?,
            volumes: VolumeManager::new(data_dir.join("volumes"))?,
        })
    }

    /// Network manager
    pub fn networks(&self) -> &NetworkManager {
        &self.networks
    }

    /// Volume manager
    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    /// Ensure every network and volume the project's services use exists
    pub fn provision(&self, project: &Project) -> Result<ProvisionReport> {
        let network_keys = used_networks(project);
        let volume_keys = used_volumes(project);

        let mut to_create = Vec::new();
        let mut report = ProvisionReport::default();

        // networks: check everything first
        let existing = self.networks.list()?;
        for key in &network_keys {
            let spec = &project.networks[key];
            let name = project.network_name(key);
            let current = existing.iter().find(|n| n.name == name);

            let action = match (spec.external, current) {
                (true, Some(_)) => ProvisionAction::External,
                (true, None) => return Err(KeelError::NetworkNotFound(name)),
                (false, Some(network)) if network.fingerprint == network_fingerprint(spec) => {
                    ProvisionAction::Unchanged
                }
                (false, Some(network)) => {
                    return Err(KeelError::ResourceConflict {
                        resource: name,
                        reason: format!(
                            "network exists with a different configuration ({})",
                            describe(network)
                        ),
                    })
                }
                (false, None) => {
                    to_create.push((key.clone(), name.clone(), spec));
                    ProvisionAction::Created
                }
            };
            report.networks.push(ResourceOutcome {
                key: key.clone(),
                name,
                action,
            });
        }
        let networks_to_create = plan_networks(&to_create, &existing, &project.name)?;

        let mut volumes_to_create = Vec::new();
        for key in &volume_keys {
            let spec = &project.volumes[key];
            let name = project.volume_name(key);
            let current = match self.volumes.get(&name) {
                Ok(volume) => Some(volume),
                Err(KeelError::VolumeNotFound(_)) => None,
                Err(e) => return Err(e),
            };

            let action = match (spec.external, current) {
                (true, Some(_)) => ProvisionAction::External,
                (true, None) => return Err(KeelError::VolumeNotFound(name)),
                (false, Some(volume)) if volume.fingerprint == volume_fingerprint(spec) => {
                    ProvisionAction::Unchanged
                }
                (false, Some(volume)) => {
                    return Err(KeelError::ResourceConflict {
                        resource: name,
                        reason: format!(
                            "volume exists with driver {} and different options",
                            volume.driver
                        ),
                    })
                }
                (false, None) => {
                    volumes_to_create.push(Volume::from_spec(
                        &name,
                        &project.name,
                        spec,
                        self.volumes.base_path(),
                    ));
                    ProvisionAction::Created
                }
            };
            report.volumes.push(ResourceOutcome {
                key: key.clone(),
                name,
                action,
            });
        }

        for network in networks_to_create {
            self.networks.create(network)?;
        }
        for volume in volumes_to_create {
            self.volumes.create(volume)?;
        }

        if report.is_noop() {
            tracing::info!("Infrastructure for {} already provisioned", project.name);
        }
        Ok(report)
    }

    /// Connect a service's container to its networks
    pub fn attach(&self, project: &Project, service: &Service) -> Result<Vec<NetworkAttachment>> {
        let container = project.container_name(service);
        let mut attachments = Vec::new();

        for (key, options) in &service.networks {
            let network = project.network_name(key);
            let mut aliases = vec![service.name.clone()];
            aliases.extend(options.aliases.iter().cloned());

            let endpoint = self.networks.connect(
                &network,
                &container,
                aliases.clone(),
                options.ipv4_address.map(IpAddr::V4),
            )?;
            tracing::debug!(
                "Attached {} to {} with address {:?}",
                container,
                network,
                endpoint.ip
            );

            attachments.push(NetworkAttachment {
                network,
                ip: endpoint.ip,
                aliases,
            });
        }

        Ok(attachments)
    }

    /// Disconnect a service's container from its networks
    pub fn detach(&self, project: &Project, service: &Service) -> Result<()> {
        let container = project.container_name(service);
        for key in service.networks.keys() {
            let network = project.network_name(key);
            if let Err(e) = self.networks.disconnect(&network, &container) {
                tracing::debug!("Skipping detach of {} from {}: {}", container, network, e);
            }
        }
        Ok(())
    }

    /// Resolve a service's mounts to host paths
    pub fn mounts(&self, project: &Project, service: &Service) -> Result<Vec<Mount>> {
        service
            .volumes
            .iter()
            .map(|mount| {
                let host_path = match &mount.source {
                    MountSource::Volume(key) => {
                        Some(self.volumes.get(&project.volume_name(key))?.mountpoint)
                    }
                    MountSource::Bind(path) => Some(path.clone()),
                    MountSource::Anonymous | MountSource::Tmpfs => None,
                };
                Ok(Mount {
                    host_path,
                    container_path: mount.target.clone(),
                    read_only: mount.read_only,
                })
            })
            .collect()
    }

    /// Remove the project's networks, and its volumes when asked to
    pub fn teardown(&self, project: &Project, remove_volumes: bool) -> Result<()> {
        for (key, spec) in &project.networks {
            if spec.external {
                continue;
            }
            let name = project.network_name(key);
            match self.networks.remove(&name) {
                Ok(()) | Err(KeelError::NetworkNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !remove_volumes {
            return Ok(());
        }

        for (key, spec) in &project.volumes {
            if spec.external {
                continue;
            }
            let name = project.volume_name(key);
            match self.volumes.remove(&name) {
                Ok(()) | Err(KeelError::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Data directory of a volume, if provisioned
    pub fn volume_path(&self, project: &Project, key: &str) -> Result<PathBuf> {
        Ok(self.volumes.get(&project.volume_name(key))?.mountpoint)
    }
}

fn used_networks(project: &Project) -> BTreeSet<String> {
    project
        .services
        .values()
        .flat_map(|s| s.networks.keys().cloned())
        .collect()
}

fn used_volumes(project: &Project) -> BTreeSet<String> {
    project
        .services
        .values()
        .flat_map(|s| s.volumes.iter())
        .filter_map(|m| match &m.source {
            MountSource::Volume(key) => Some(key.clone()),
            _ => None,
        })
        .collect()
}

fn describe(network: &Network) -> String {
    let subnets: Vec<String> = network.subnets().map(|s| s.to_string()).collect();
    if subnets.is_empty() {
        format!("driver {}", network.driver)
    } else {
        format!("driver {}, subnets {}", network.driver, subnets.join(", "))
    }
}

/// Build the networks to create, giving a default pool to those without IPAM.
///
/// Declared subnets are checked against each other and the existing
/// networks first, so default pools avoid all of them regardless of order.
fn plan_networks(
    to_create: &[(String, String, &NetworkSpec)],
    existing: &[Network],
    project: &str,
) -> Result<Vec<Network>> {
    let mut claimed: Vec<(&str, Subnet)> = existing
        .iter()
        .flat_map(|n| n.subnets().map(move |s| (n.name.as_str(), *s)))
        .collect();

    for (_, name, spec) in to_create {
        for pool in &spec.ipam {
            if let Some((owner, subnet)) = claimed.iter().find(|(_, s)| s.overlaps(&pool.subnet)) {
                return Err(KeelError::ResourceConflict {
                    resource: name.clone(),
                    reason: format!(
                        "subnet {} overlaps {} of network {}",
                        pool.subnet, subnet, owner
                    ),
                });
            }
            claimed.push((name.as_str(), pool.subnet));
        }
    }

    let mut networks = Vec::with_capacity(to_create.len());
    for (_, name, spec) in to_create {
        let mut network = Network::from_spec(name, project, spec);
        if network.ipam.is_empty() {
            let subnet = free_default_subnet(claimed.iter().map(|(_, s)| s)).ok_or_else(|| {
                KeelError::ResourceConflict {
                    resource: name.clone(),
                    reason: "default address pools are exhausted".to_string(),
                }
            })?;
            claimed.push((name.as_str(), subnet));
            network.ipam.push(IpamPool {
                subnet,
                gateway: None,
            });
        }
        networks.push(network);
    }
    Ok(networks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::environment::VariableSnapshot;
    use crate::compose::loader::ConfigLoader;
    use tempfile::tempdir;

    fn project(yaml: &str) -> Project {
        ConfigLoader::new("/srv/dria")
            .load_str(yaml, &VariableSnapshot::new())
            .unwrap()
    }

    const STACK: &str = r#"
services:
  relay:
    image: waku
    networks: [waku]
    volumes: ["data:/data"]
networks:
  waku:
    ipam:
      config:
        - subnet: 10.77.0.0/16
          gateway: 10.77.0.1
volumes:
  data:
"#;

    #[test]
    fn test_provision_is_idempotent() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(STACK);

        let first = provisioner.provision(&project).unwrap();
        assert_eq!(first.networks[0].name, "dria_waku");
        assert_eq!(first.networks[0].action, ProvisionAction::Created);
        assert_eq!(first.volumes[0].action, ProvisionAction::Created);

        // a fresh provisioner sees the persisted state
        let again = Provisioner::new(temp.path()).unwrap();
        let second = again.provision(&project).unwrap();
        assert!(second.is_noop());
        assert_eq!(second.networks[0].action, ProvisionAction::Unchanged);
    }

    #[test]
    fn test_changed_subnet_is_a_conflict() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        provisioner.provision(&project(STACK)).unwrap();

        let changed = project(&STACK.replace("10.77.0.0/16", "10.78.0.0/16").replace("10.77.0.1", "10.78.0.1"));
        let err = provisioner.provision(&changed).unwrap_err();
        assert!(matches!(err, KeelError::ResourceConflict { ref resource, .. } if resource == "dria_waku"));
    }

    #[test]
    fn test_overlapping_subnets_rejected_before_creation() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(
            r#"
services:
  a: {image: x, networks: [one, two]}
networks:
  one:
    ipam: {config: [{subnet: 10.1.0.0/16}]}
  two:
    ipam: {config: [{subnet: 10.1.5.0/24}]}
"#,
        );

        let err = provisioner.provision(&project).unwrap_err();
        assert!(matches!(err, KeelError::ResourceConflict { .. }));
        assert!(provisioner.networks().list().unwrap().is_empty());
    }

    #[test]
    fn test_overlap_with_other_project() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        provisioner.provision(&project(STACK)).unwrap();

        let other = ConfigLoader::new("/srv/other")
            .load_str(STACK, &VariableSnapshot::new())
            .unwrap();
        let err = provisioner.provision(&other).unwrap_err();
        match err {
            KeelError::ResourceConflict { resource, reason } => {
                assert_eq!(resource, "other_waku");
                assert!(reason.contains("dria_waku"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_default_pool_avoids_declared_subnets() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(
            r#"
services:
  a: {image: x}
  b: {image: x, networks: [net]}
networks:
  net:
    ipam: {config: [{subnet: 172.18.0.0/16}]}
"#,
        );

        provisioner.provision(&project).unwrap();
        let default = provisioner.networks().get("dria_default").unwrap();
        let net = provisioner.networks().get("dria_net").unwrap();
        let declared: Vec<_> = net.subnets().copied().collect();
        assert_eq!(declared, vec![Subnet::parse("172.18.0.0/16").unwrap()]);
        assert_eq!(default.subnets().count(), 1);
        assert!(default
            .subnets()
            .all(|s| declared.iter().all(|d| !d.overlaps(s))));
    }

    #[test]
    fn test_exhausted_default_pools_create_nothing() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(
            r#"
services:
  a: {image: x}
  b: {image: x, networks: [wide]}
networks:
  wide:
    ipam: {config: [{subnet: 172.16.0.0/12}]}
"#,
        );

        let err = provisioner.provision(&project).unwrap_err();
        assert!(matches!(
            err,
            KeelError::ResourceConflict { ref resource, .. } if resource == "dria_default"
        ));
        assert!(provisioner.networks().list().unwrap().is_empty());
    }

    #[test]
    fn test_missing_external_network() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(
            "services:\n  a: {image: x, networks: [shared]}\nnetworks:\n  shared:\n    external: true\n",
        );

        let err = provisioner.provision(&project).unwrap_err();
        assert!(matches!(err, KeelError::NetworkNotFound(ref n) if n == "shared"));
    }

    #[test]
    fn test_attach_assigns_addresses_and_aliases() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(STACK);
        provisioner.provision(&project).unwrap();

        let relay = project.service("relay").unwrap();
        let attachments = provisioner.attach(&project, relay).unwrap();
        assert_eq!(attachments[0].ip, Some("10.77.0.2".parse().unwrap()));
        assert_eq!(attachments[0].aliases, vec!["relay"]);
        assert_eq!(
            provisioner
                .networks()
                .resolve("dria_waku", "relay")
                .unwrap(),
            attachments[0].ip
        );

        let mounts = provisioner.mounts(&project, relay).unwrap();
        assert!(mounts[0].host_path.as_ref().unwrap().ends_with("dria_data/_data"));
        provisioner.detach(&project, relay).unwrap();
    }

    #[test]
    fn test_teardown_keeps_volumes_unless_asked() {
        let temp = tempdir().unwrap();
        let provisioner = Provisioner::new(temp.path()).unwrap();
        let project = project(STACK);
        provisioner.provision(&project).unwrap();

        provisioner.teardown(&project, false).unwrap();
        assert!(provisioner.networks().list().unwrap().is_empty());
        assert!(provisioner.volume_path(&project, "data").unwrap().exists());

        provisioner.teardown(&project, true).unwrap();
        assert!(provisioner.volumes().list().unwrap().is_empty());
    }
}

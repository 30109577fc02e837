//! Bridge network implementation

use super::config::{IpAllocator, Network, Subnet};
use crate::compose::model::IpamPool;
use crate::error::{KeelError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

/// Second octets of the `172.x.0.0/16` pools handed to networks without IPAM config
const DEFAULT_POOL_SECOND_OCTETS: std::ops::RangeInclusive<u8> = 18..=31;

/// A container attached to a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// Container name
    pub container: String,
    /// Endpoint ID
    pub endpoint_id: String,
    /// MAC address
    pub mac_address: String,
    /// Assigned address
    pub ip: Option<IpAddr>,
    /// Names other members resolve this endpoint by
    pub aliases: Vec<String>,
}

/// A live network with its address allocators and endpoints
pub struct BridgeNetwork {
    /// Persisted network record
    pub network: Network,
    /// One allocator per address pool
    allocators: Vec<IpAllocator>,
    /// Attached endpoints by container name
    endpoints: BTreeMap<String, Endpoint>,
}

impl BridgeNetwork {
    /// Wrap a network record
    pub fn new(network: Network) -> Self {
        let allocators = network
            .ipam
            .iter()
            .map(|pool| IpAllocator::new(pool.subnet, pool.gateway))
            .collect();

        Self {
            network,
            allocators,
            endpoints: BTreeMap::new(),
        }
    }

    /// Connect a container to this network
    pub fn connect(
        &mut self,
        container: &str,
        aliases: Vec<String>,
        requested: Option<IpAddr>,
    ) -> Result<Endpoint> {
        if let Some(existing) = self.endpoints.get(container) {
            return Ok(existing.clone());
        }

        let ip = match requested {
            Some(ip) => {
                let reserved = self.allocators.iter_mut().any(|a| a.reserve(ip));
                if !reserved {
                    return Err(KeelError::ResourceConflict {
                        resource: self.network.name.clone(),
                        reason: format!("address {} is taken or outside every subnet", ip),
                    });
                }
                Some(ip)
            }
            None if self.allocators.is_empty() => None,
            None => Some(
                self.allocators
                    .iter_mut()
                    .find_map(|a| a.allocate())
                    .ok_or_else(|| KeelError::ResourceUnavailable {
                        service: container.to_string(),
                        reason: format!("network {} has no free addresses", self.network.name),
                    })?,
            ),
        };

        let endpoint = Endpoint {
            container: container.to_string(),
            endpoint_id: short_id(),
            mac_address: generate_mac_address(),
            ip,
            aliases,
        };

        self.endpoints
            .insert(container.to_string(), endpoint.clone());

        Ok(endpoint)
    }

    /// Disconnect a container from this network
    pub fn disconnect(&mut self, container: &str) -> Result<()> {
        let endpoint = self.endpoints.remove(container).ok_or_else(|| {
            KeelError::Container(format!(
                "Container {} not connected to network {}",
                container, self.network.name
            ))
        })?;

        if let Some(ip) = endpoint.ip {
            for allocator in &mut self.allocators {
                allocator.release(ip);
            }
        }

        Ok(())
    }

    /// Resolve a container name or alias to its address on this network
    pub fn resolve(&self, name: &str) -> Option<IpAddr> {
        self.endpoints
            .values()
            .find(|e| e.container == name || e.aliases.iter().any(|a| a == name))
            .and_then(|e| e.ip)
    }

    /// Attached endpoints
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }
}

/// Network manager for every network known on this host
pub struct NetworkManager {
    /// Directory holding one JSON record per network
    root: PathBuf,
    /// Networks indexed by name
    networks: RwLock<BTreeMap<String, BridgeNetwork>>,
}

impl NetworkManager {
    /// Open the manager, loading previously provisioned networks
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;

        let mut networks = BTreeMap::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let network: Network = serde_json::from_slice(&std::fs::read(&path)?)?;
            tracing::debug!("Loaded network {} from {}", network.name, path.display());
            networks.insert(network.name.clone(), BridgeNetwork::new(network));
        }

        Ok(Self {
            root,
            networks: RwLock::new(networks),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    /// Create a network, assigning a subnet from the default pool when none is declared
    pub fn create(&self, mut network: Network) -> Result<Network> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        if networks.contains_key(&network.name) {
            return Err(KeelError::ResourceConflict {
                resource: network.name.clone(),
                reason: "network already exists".to_string(),
            });
        }

        if network.ipam.is_empty() {
            let taken: Vec<Subnet> = networks
                .values()
                .flat_map(|n| n.network.subnets().copied())
                .collect();
            let subnet = free_default_subnet(taken.iter())
                .ok_or_else(|| KeelError::ResourceConflict {
                    resource: network.name.clone(),
                    reason: "default address pools are exhausted".to_string(),
                })?;
            network.ipam.push(IpamPool {
                subnet,
                gateway: None,
            });
        }

        std::fs::write(
            self.record_path(&network.name),
            serde_json::to_vec_pretty(&network)?,
        )?;

        tracing::info!(
            "Created network {} ({})",
            network.name,
            network
                .subnets()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        networks.insert(network.name.clone(), BridgeNetwork::new(network.clone()));
        Ok(network)
    }

    /// Remove a network
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        let network = networks
            .get(name)
            .ok_or_else(|| KeelError::NetworkNotFound(name.to_string()))?;

        if network.endpoints().next().is_some() {
            return Err(KeelError::ResourceConflict {
                resource: name.to_string(),
                reason: "network has active endpoints".to_string(),
            });
        }

        let path = self.record_path(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        networks.remove(name);

        tracing::info!("Removed network {}", name);
        Ok(())
    }

    /// Get a network by name
    pub fn get(&self, name: &str) -> Result<Network> {
        let networks = self
            .networks
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        networks
            .get(name)
            .map(|n| n.network.clone())
            .ok_or_else(|| KeelError::NetworkNotFound(name.to_string()))
    }

    /// List all networks
    pub fn list(&self) -> Result<Vec<Network>> {
        let networks = self
            .networks
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(networks.values().map(|n| n.network.clone()).collect())
    }

    /// Connect a container to a network
    pub fn connect(
        &self,
        network: &str,
        container: &str,
        aliases: Vec<String>,
        requested: Option<IpAddr>,
    ) -> Result<Endpoint> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        let bridge = networks
            .get_mut(network)
            .ok_or_else(|| KeelError::NetworkNotFound(network.to_string()))?;

        bridge.connect(container, aliases, requested)
    }

    /// Disconnect a container from a network
    pub fn disconnect(&self, network: &str, container: &str) -> Result<()> {
        let mut networks = self
            .networks
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        let bridge = networks
            .get_mut(network)
            .ok_or_else(|| KeelError::NetworkNotFound(network.to_string()))?;

        bridge.disconnect(container)
    }

    /// Resolve a service name on a network
    pub fn resolve(&self, network: &str, name: &str) -> Result<Option<IpAddr>> {
        let networks = self
            .networks
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        let bridge = networks
            .get(network)
            .ok_or_else(|| KeelError::NetworkNotFound(network.to_string()))?;

        Ok(bridge.resolve(name))
    }
}

/// First default pool that overlaps none of `taken`
pub fn free_default_subnet<'a>(
    taken: impl Iterator<Item = &'a Subnet> + Clone,
) -> Option<Subnet> {
    DEFAULT_POOL_SECOND_OCTETS
        .filter_map(|octet| Subnet::parse(&format!("172.{}.0.0/16", octet)).ok())
        .find(|candidate| !taken.clone().any(|s| s.overlaps(candidate)))
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Generate a random locally administered, unicast MAC address
fn generate_mac_address() -> String {
    let random = Uuid::new_v4();
    let bytes = random.as_bytes();

    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::model::NetworkSpec;
    use tempfile::tempdir;

    fn spec(subnet: &str) -> NetworkSpec {
        NetworkSpec::bridge(Subnet::parse(subnet).unwrap(), None)
    }

    #[test]
    fn test_create_network() {
        let temp = tempdir().unwrap();
        let manager = NetworkManager::new(temp.path().to_path_buf()).unwrap();

        let network = Network::from_spec("dria_default", "dria", &spec("10.0.0.0/24"));
        manager.create(network).unwrap();

        let network = manager.get("dria_default").unwrap();
        assert_eq!(network.name, "dria_default");
        assert!(temp.path().join("dria_default.json").exists());
    }

    #[test]
    fn test_networks_survive_reload() {
        let temp = tempdir().unwrap();
        {
            let manager = NetworkManager::new(temp.path().to_path_buf()).unwrap();
            manager
                .create(Network::from_spec("p_net", "p", &spec("10.9.0.0/24")))
                .unwrap();
        }

        let reopened = NetworkManager::new(temp.path().to_path_buf()).unwrap();
        let network = reopened.get("p_net").unwrap();
        assert_eq!(network.ipam[0].subnet.to_string(), "10.9.0.0/24");
    }

    #[test]
    fn test_default_pool_skips_used_subnets() {
        let temp = tempdir().unwrap();
        let manager = NetworkManager::new(temp.path().to_path_buf()).unwrap();

        manager
            .create(Network::from_spec("taken", "p", &spec("172.18.0.0/16")))
            .unwrap();
        let auto = manager
            .create(Network::from_spec("auto", "p", &NetworkSpec::default()))
            .unwrap();

        assert_eq!(auto.ipam[0].subnet.to_string(), "172.19.0.0/16");
    }

    #[test]
    fn test_connect_and_resolve_by_alias() {
        let temp = tempdir().unwrap();
        let manager = NetworkManager::new(temp.path().to_path_buf()).unwrap();
        manager
            .create(Network::from_spec("p_default", "p", &spec("192.168.0.0/24")))
            .unwrap();

        let endpoint = manager
            .connect("p_default", "p-ollama-1", vec!["ollama".to_string()], None)
            .unwrap();
        assert_eq!(endpoint.ip, Some("192.168.0.2".parse().unwrap()));
        assert_eq!(
            manager.resolve("p_default", "ollama").unwrap(),
            endpoint.ip
        );

        assert!(manager.remove("p_default").is_err());
        manager.disconnect("p_default", "p-ollama-1").unwrap();
        manager.remove("p_default").unwrap();
    }

    #[test]
    fn test_static_address_conflict() {
        let temp = tempdir().unwrap();
        let manager = NetworkManager::new(temp.path().to_path_buf()).unwrap();
        manager
            .create(Network::from_spec("p_net", "p", &spec("10.1.0.0/24")))
            .unwrap();

        let wanted: IpAddr = "10.1.0.50".parse().unwrap();
        manager.connect("p_net", "a", vec![], Some(wanted)).unwrap();
        let err = manager.connect("p_net", "b", vec![], Some(wanted)).unwrap_err();
        assert!(matches!(err, KeelError::ResourceConflict { .. }));
    }
}

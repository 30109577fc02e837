//! Network configuration

use crate::compose::model::{IpamPool, NetworkSpec};
use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use uuid::Uuid;

/// Network driver types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Host network
    Host,
    /// No networking
    None,
    /// Overlay network
    Overlay,
    /// Macvlan network
    Macvlan,
    /// IPvlan network
    Ipvlan,
    /// Plugin driver
    Custom(String),
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Host => write!(f, "host"),
            NetworkDriver::None => write!(f, "none"),
            NetworkDriver::Overlay => write!(f, "overlay"),
            NetworkDriver::Macvlan => write!(f, "macvlan"),
            NetworkDriver::Ipvlan => write!(f, "ipvlan"),
            NetworkDriver::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for NetworkDriver {
    fn from(s: &str) -> Self {
        match s {
            "" | "bridge" => NetworkDriver::Bridge,
            "host" => NetworkDriver::Host,
            "none" => NetworkDriver::None,
            "overlay" => NetworkDriver::Overlay,
            "macvlan" => NetworkDriver::Macvlan,
            "ipvlan" => NetworkDriver::Ipvlan,
            other => NetworkDriver::Custom(other.to_string()),
        }
    }
}

/// An IPv4 or IPv6 subnet in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Parse `a.b.c.d/n` or `x::/n`. Host bits are masked off.
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| KeelError::Parse(format!("Invalid subnet: {}", s)))?;

        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| KeelError::Parse(format!("Invalid IP: {}", addr)))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| KeelError::Parse(format!("Invalid prefix length in subnet {}", s)))?;

        let bits = address_bits(&addr);
        if prefix > bits {
            return Err(KeelError::Parse(format!(
                "Prefix length {} too long in subnet {}",
                prefix, s
            )));
        }

        let network = from_bits(&addr, mask(to_bits(&addr), prefix, bits));
        Ok(Self { network, prefix })
    }

    /// Network address
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn bits(&self) -> u8 {
        address_bits(&self.network)
    }

    /// Whether `ip` lies inside this subnet
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_ipv4() == self.network.is_ipv4()
            && mask(to_bits(&ip), self.prefix, self.bits()) == to_bits(&self.network)
    }

    /// Whether the two subnets share at least one address
    pub fn overlaps(&self, other: &Subnet) -> bool {
        if self.network.is_ipv4() != other.network.is_ipv4() {
            return false;
        }
        let prefix = self.prefix.min(other.prefix);
        let bits = self.bits();
        mask(to_bits(&self.network), prefix, bits) == mask(to_bits(&other.network), prefix, bits)
    }

    /// First and last assignable host addresses as integers
    fn host_range(&self) -> (u128, u128) {
        let bits = self.bits();
        let base = to_bits(&self.network);
        let size_bits = u32::from(bits - self.prefix);
        let last = if size_bits >= 128 {
            u128::MAX
        } else {
            base + ((1u128 << size_bits) - 1)
        };

        match (self.network.is_ipv4(), size_bits) {
            // point-to-point and single-host networks use every address
            (true, 0..=1) => (base, last),
            // skip network and broadcast addresses
            (true, _) => (base + 1, last - 1),
            (false, 0) => (base, last),
            (false, _) => (base + 1, last),
        }
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        Subnet::parse(s)
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Subnet::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn address_bits(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn from_bits(family: &IpAddr, value: u128) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

fn mask(value: u128, prefix: u8, bits: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let host_bits = u32::from(bits - prefix);
    if host_bits == 0 {
        return value;
    }
    value & !((1u128 << host_bits) - 1)
}

/// A provisioned network, persisted under the data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Network ID
    pub id: String,
    /// Host-level network name
    pub name: String,
    /// Project that created the network
    pub project: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// Address pools
    pub ipam: Vec<IpamPool>,
    /// Internal network (no external access)
    pub internal: bool,
    /// Driver options
    pub options: BTreeMap<String, String>,
    /// Network labels
    pub labels: BTreeMap<String, String>,
    /// Fingerprint of the declared configuration
    pub fingerprint: String,
    /// Created timestamp
    pub created: DateTime<Utc>,
}

impl Network {
    /// Materialize a declared network
    pub fn from_spec(name: &str, project: &str, spec: &NetworkSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string().replace('-', "")[..12].to_string(),
            name: name.to_string(),
            project: project.to_string(),
            driver: NetworkDriver::from(spec.driver.as_str()),
            ipam: spec.ipam.clone(),
            internal: spec.internal,
            options: spec.options.clone(),
            labels: spec.labels.clone(),
            fingerprint: fingerprint(spec),
            created: Utc::now(),
        }
    }

    /// Subnets of all address pools
    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.ipam.iter().map(|pool| &pool.subnet)
    }
}

/// Stable digest of the parts of a network declaration that cannot change in place.
///
/// Labels are excluded.
pub fn fingerprint(spec: &NetworkSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.driver.as_bytes());
    hasher.update([0]);
    for pool in &spec.ipam {
        hasher.update(pool.subnet.to_string().as_bytes());
        hasher.update([0]);
        if let Some(gateway) = pool.gateway {
            hasher.update(gateway.to_string().as_bytes());
        }
        hasher.update([0]);
    }
    hasher.update([u8::from(spec.internal)]);
    for (key, value) in &spec.options {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// IP address allocator for one subnet
pub struct IpAllocator {
    /// Network subnet
    subnet: Subnet,
    /// Reserved gateway address
    gateway: u128,
    /// Allocated addresses
    allocated: BTreeSet<u128>,
    /// Next address to try
    next: u128,
}

impl IpAllocator {
    /// Create an allocator, reserving the gateway (or the first host address)
    pub fn new(subnet: Subnet, gateway: Option<IpAddr>) -> Self {
        let (first, _) = subnet.host_range();
        let gateway = gateway
            .filter(|g| subnet.contains(*g))
            .map(|g| to_bits(&g))
            .unwrap_or(first);

        let mut allocated = BTreeSet::new();
        allocated.insert(gateway);

        Self {
            subnet,
            gateway,
            allocated,
            next: first,
        }
    }

    /// Gateway address reserved by this allocator
    pub fn gateway(&self) -> IpAddr {
        from_bits(&self.subnet.network, self.gateway)
    }

    /// Allocate the next free address, or `None` when the subnet is exhausted
    pub fn allocate(&mut self) -> Option<IpAddr> {
        let (first, last) = self.subnet.host_range();
        let mut candidate = self.next.clamp(first, last);
        let mut wrapped = false;

        loop {
            if !self.allocated.contains(&candidate) {
                self.allocated.insert(candidate);
                self.next = candidate.saturating_add(1);
                return Some(from_bits(&self.subnet.network, candidate));
            }
            if candidate >= last {
                if wrapped {
                    return None;
                }
                wrapped = true;
                candidate = first;
            } else {
                candidate += 1;
            }
        }
    }

    /// Reserve a specific address. Returns false if it is taken or outside the subnet.
    pub fn reserve(&mut self, ip: IpAddr) -> bool {
        let (first, last) = self.subnet.host_range();
        let bits = to_bits(&ip);
        if !self.subnet.contains(ip) || bits < first || bits > last {
            return false;
        }
        self.allocated.insert(bits)
    }

    /// Release an IP address
    pub fn release(&mut self, ip: IpAddr) {
        let bits = to_bits(&ip);
        if bits != self.gateway {
            self.allocated.remove(&bits);
        }
    }
}

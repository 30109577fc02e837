//! Host device and CPU inventory
//!
//! Reservations from `deploy.resources.reservations` are checked against
//! what the host actually has before a service starts.

use crate::compose::model::{DeviceCount, DeviceRequest};
use crate::error::{KeelError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

/// Driver name used for NVIDIA GPUs
pub const NVIDIA_DRIVER: &str = "nvidia";

#[derive(Debug, Default)]
struct Reservations {
    /// service -> (driver, device id) pairs it holds
    devices: BTreeMap<String, BTreeSet<(String, String)>>,
    /// service -> reserved CPUs
    cpus: BTreeMap<String, f64>,
}

/// Devices and CPUs available to services on this host
#[derive(Debug)]
pub struct DeviceInventory {
    /// driver -> device ids
    devices: BTreeMap<String, Vec<String>>,
    /// Logical CPUs
    cpus: f64,
    reserved: Mutex<Reservations>,
}

impl DeviceInventory {
    /// Inventory with `cpus` logical CPUs and no devices
    pub fn new(cpus: f64) -> Self {
        Self {
            devices: BTreeMap::new(),
            cpus,
            reserved: Mutex::new(Reservations::default()),
        }
    }

    /// Probe the host: logical CPUs and `/dev/nvidiaN` devices
    pub fn detect() -> Self {
        let mut inventory = Self::new(num_cpus::get() as f64);

        let gpus = nvidia_devices(Path::new("/dev"));
        if !gpus.is_empty() {
            tracing::debug!("Detected {} NVIDIA device(s)", gpus.len());
            inventory = inventory.with_devices(NVIDIA_DRIVER, gpus);
        }
        inventory
    }

    /// Register devices for a driver
    pub fn with_devices<I, S>(mut self, driver: &str, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices
            .entry(driver.to_string())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Logical CPUs on this host
    pub fn cpus(&self) -> f64 {
        self.cpus
    }

    /// Reserve devices and CPUs for a service.
    ///
    /// Either everything requested is reserved or nothing is.
    pub fn reserve(
        &self,
        service: &str,
        requests: &[DeviceRequest],
        cpus: Option<f64>,
    ) -> Result<BTreeSet<(String, String)>> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| KeelError::Lock("Failed to acquire device lock".to_string()))?;

        let unavailable = |reason: String| KeelError::ResourceUnavailable {
            service: service.to_string(),
            reason,
        };

        if let Some(wanted) = cpus {
            let used: f64 = reserved
                .cpus
                .iter()
                .filter(|(owner, _)| owner.as_str() != service)
                .map(|(_, c)| c)
                .sum();
            if used + wanted > self.cpus + f64::EPSILON {
                return Err(unavailable(format!(
                    "{} CPUs requested, {} of {} available",
                    wanted,
                    (self.cpus - used).max(0.0),
                    self.cpus
                )));
            }
        }

        let held: BTreeSet<&(String, String)> = reserved
            .devices
            .iter()
            .filter(|(owner, _)| owner.as_str() != service)
            .flat_map(|(_, set)| set.iter())
            .collect();

        let mut granted = BTreeSet::new();
        for request in requests {
            let candidates: Vec<(String, String)> = self
                .devices
                .iter()
                .filter(|(driver, _)| {
                    request.driver.as_deref().map_or(true, |d| d == driver.as_str())
                })
                .flat_map(|(driver, ids)| ids.iter().map(move |id| (driver.clone(), id.clone())))
                .filter(|device| !held.contains(device) && !granted.contains(device))
                .collect();

            let label = request.driver.as_deref().unwrap_or("any");

            if !request.device_ids.is_empty() {
                for wanted in &request.device_ids {
                    let device = candidates
                        .iter()
                        .find(|(_, id)| id == wanted)
                        .ok_or_else(|| {
                            unavailable(format!("{} device {} is not available", label, wanted))
                        })?;
                    granted.insert(device.clone());
                }
                continue;
            }

            match request.count {
                DeviceCount::All if candidates.is_empty() => {
                    return Err(unavailable(format!("no {} devices available", label)));
                }
                DeviceCount::All => granted.extend(candidates),
                DeviceCount::Exactly(n) if candidates.len() < n as usize => {
                    return Err(unavailable(format!(
                        "{} {} device(s) requested, {} available",
                        n,
                        label,
                        candidates.len()
                    )));
                }
                DeviceCount::Exactly(n) => granted.extend(candidates.into_iter().take(n as usize)),
            }
        }

        if let Some(wanted) = cpus {
            reserved.cpus.insert(service.to_string(), wanted);
        }
        if !granted.is_empty() {
            reserved
                .devices
                .insert(service.to_string(), granted.clone());
        }

        Ok(granted)
    }

    /// Release everything held by a service
    pub fn release(&self, service: &str) -> Result<()> {
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| KeelError::Lock("Failed to acquire device lock".to_string()))?;
        reserved.devices.remove(service);
        reserved.cpus.remove(service);
        Ok(())
    }
}

fn nvidia_devices(dev: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return Vec::new();
    };

    let mut ids: Vec<u32> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .and_then(|index| index.parse::<u32>().ok())
        })
        .collect();
    ids.sort_unstable();
    ids.into_iter().map(|i| i.to_string()).collect()
}

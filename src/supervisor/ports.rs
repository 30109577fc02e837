//! Host port conflict detection

use crate::compose::model::{PortBinding, Service};
use crate::error::{KeelError, Result};

/// Fail if two bindings among `services` claim the same host port and protocol.
///
/// Runs before any container starts.
pub fn check_port_conflicts<'a>(services: impl IntoIterator<Item = &'a Service>) -> Result<()> {
    let mut claimed: Vec<(&str, &PortBinding)> = Vec::new();

    for service in services {
        for binding in &service.ports {
            if let Some((owner, _)) = claimed.iter().find(|(_, b)| b.collides_with(binding)) {
                return Err(KeelError::PortConflict {
                    port: binding.host_port.unwrap_or_default(),
                    protocol: binding.protocol.to_string(),
                    first: owner.to_string(),
                    second: service.name.clone(),
                });
            }
            claimed.push((service.name.as_str(), binding));
        }
    }
    Ok(())
}

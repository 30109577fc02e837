//! Container management module
//!
//! Containers are driven through a [`ContainerRuntime`]. The
//! [`ContainerManager`] keeps per-container bookkeeping on top of it and
//! the [`DeviceInventory`] guards device and CPU reservations.

pub mod config;
pub mod devices;
pub mod lifecycle;
pub mod process;
pub mod runtime;
#[cfg(test)]
pub(crate) mod scripted;

pub use config::{ContainerConfig, ContainerStatus, ExitStatus, Mount, NetworkAttachment};
pub use devices::DeviceInventory;
pub use lifecycle::{ContainerManager, ContainerRecord};
pub use process::ProcessRuntime;
pub use runtime::ContainerRuntime;

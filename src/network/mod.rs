//! Network management module
//!
//! Networks are persisted per host and shared by every project that
//! references them. Services attach through endpoints that carry the
//! service name as an alias.

pub mod bridge;
pub mod config;

pub use bridge::{free_default_subnet, BridgeNetwork, Endpoint, NetworkManager};
pub use config::{IpAllocator, Network, NetworkDriver, Subnet};

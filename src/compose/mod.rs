//! Compose project handling
//!
//! Loading and normalizing compose documents, profile selection,
//! dependency ordering and the orchestrator driving a project.

pub mod config;
pub mod environment;
pub mod graph;
pub mod interpolate;
pub mod loader;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod profile;

pub use environment::VariableSnapshot;
pub use graph::DependencyGraph;
pub use loader::ConfigLoader;
pub use model::{Project, Service};
pub use orchestrator::ComposeOrchestrator;
pub use profile::ProfileSelector;

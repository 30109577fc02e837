//! keel - compose-style service orchestration on a single host
//!
//! keel reads a compose document and brings its services up:
//!
//! - Loading with merge keys, file overlays and `${VAR}` interpolation
//! - Profile selection and dependency ordering
//! - Idempotent network and volume provisioning
//! - Supervision with restart policies, health checks and device reservations

pub mod compose;
pub mod container;
pub mod error;
pub mod network;
pub mod provision;
pub mod storage;
pub mod supervisor;

pub use error::{KeelError, Result};

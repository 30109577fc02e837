//! Storage management module
//!
//! Named volumes outlive the services that use them; they are only removed
//! on an explicit request.

pub mod volume;

pub use volume::{Volume, VolumeDriver, VolumeManager};

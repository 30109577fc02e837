//! Volume management
//!
//! Each volume lives in its own directory under the manager root:
//! `<root>/<name>/volume.json` holds the record and `<root>/<name>/_data`
//! is what gets mounted.

use crate::compose::model::VolumeSpec;
use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const RECORD_FILE: &str = "volume.json";
const DATA_DIR: &str = "_data";

/// Volume driver types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDriver {
    /// Local filesystem driver
    #[default]
    Local,
    /// Custom driver
    Custom(String),
}

impl std::fmt::Display for VolumeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeDriver::Local => write!(f, "local"),
            VolumeDriver::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for VolumeDriver {
    fn from(s: &str) -> Self {
        match s {
            "" | "local" => VolumeDriver::Local,
            other => VolumeDriver::Custom(other.to_string()),
        }
    }
}

/// A provisioned volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Host-level volume name
    pub name: String,
    /// Project that created the volume
    pub project: String,
    /// Volume driver
    pub driver: VolumeDriver,
    /// Mount point on host
    pub mountpoint: PathBuf,
    /// Driver options
    pub options: BTreeMap<String, String>,
    /// Volume labels
    pub labels: BTreeMap<String, String>,
    /// Fingerprint of the declared configuration
    pub fingerprint: String,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// Materialize a declared volume below `base_path`
    pub fn from_spec(name: &str, project: &str, spec: &VolumeSpec, base_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            driver: VolumeDriver::from(spec.driver.as_str()),
            mountpoint: base_path.join(name).join(DATA_DIR),
            options: spec.options.clone(),
            labels: spec.labels.clone(),
            fingerprint: fingerprint(spec),
            created_at: Utc::now(),
        }
    }
}

/// Digest of driver and driver options. Labels are excluded.
pub fn fingerprint(spec: &VolumeSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(VolumeDriver::from(spec.driver.as_str()).to_string().as_bytes());
    hasher.update([0]);
    for (key, value) in &spec.options {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Volume manager
pub struct VolumeManager {
    /// Volumes indexed by name
    volumes: RwLock<BTreeMap<String, Volume>>,
    /// Base path for volume storage
    base_path: PathBuf,
}

impl VolumeManager {
    /// Open the manager, loading previously provisioned volumes
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        let mut volumes = BTreeMap::new();
        for entry in std::fs::read_dir(&base_path)? {
            let record = entry?.path().join(RECORD_FILE);
            if !record.is_file() {
                continue;
            }
            let volume: Volume = serde_json::from_slice(&std::fs::read(&record)?)?;
            volumes.insert(volume.name.clone(), volume);
        }

        Ok(Self {
            volumes: RwLock::new(volumes),
            base_path,
        })
    }

    /// Base path volumes are created under
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create a new volume
    pub fn create(&self, volume: Volume) -> Result<Volume> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        if volumes.contains_key(&volume.name) {
            return Err(KeelError::ResourceConflict {
                resource: volume.name.clone(),
                reason: "volume already exists".to_string(),
            });
        }

        std::fs::create_dir_all(&volume.mountpoint)?;
        std::fs::write(
            self.base_path.join(&volume.name).join(RECORD_FILE),
            serde_json::to_vec_pretty(&volume)?,
        )?;

        tracing::info!("Created volume {} at {}", volume.name, volume.mountpoint.display());

        volumes.insert(volume.name.clone(), volume.clone());
        Ok(volume)
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| KeelError::VolumeNotFound(name.to_string()))
    }

    /// List all volumes
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| KeelError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(volumes.values().cloned().collect())
    }

    /// Remove a volume and its data
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| KeelError::Lock("Failed to acquire write lock".to_string()))?;

        if volumes.remove(name).is_none() {
            return Err(KeelError::VolumeNotFound(name.to_string()));
        }

        let dir = self.base_path.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        tracing::info!("Removed volume {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let volume = Volume::from_spec("dria_ollama", "dria", &VolumeSpec::default(), temp.path());
        let volume = manager.create(volume).unwrap();
        assert_eq!(volume.name, "dria_ollama");
        assert!(volume.mountpoint.ends_with("dria_ollama/_data"));
        assert!(volume.mountpoint.exists());
    }

    #[test]
    fn test_volume_data_survives_reload() {
        let temp = tempdir().unwrap();
        let mountpoint = {
            let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();
            let volume = Volume::from_spec("p_data", "p", &VolumeSpec::default(), temp.path());
            let volume = manager.create(volume).unwrap();
            std::fs::write(volume.mountpoint.join("model.bin"), b"weights").unwrap();
            volume.mountpoint
        };

        let reopened = VolumeManager::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(reopened.get("p_data").unwrap().mountpoint, mountpoint);
        assert!(mountpoint.join("model.bin").exists());
    }

    #[test]
    fn test_remove_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf()).unwrap();

        let volume = Volume::from_spec("test-volume", "p", &VolumeSpec::default(), temp.path());
        manager.create(volume).unwrap();
        manager.remove("test-volume").unwrap();

        assert!(manager.get("test-volume").is_err());
        assert!(!temp.path().join("test-volume").exists());
        assert!(matches!(
            manager.remove("test-volume"),
            Err(KeelError::VolumeNotFound(_))
        ));
    }

    #[test]
    fn test_fingerprint_tracks_driver_options() {
        let mut spec = VolumeSpec::default();
        let before = fingerprint(&spec);
        spec.labels.insert("k".to_string(), "v".to_string());
        assert_eq!(fingerprint(&spec), before);
        spec.options.insert("type".to_string(), "tmpfs".to_string());
        assert_ne!(fingerprint(&spec), before);
    }
}

//! Worker lifecycle states and the persisted registration record.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::CacheVersion;

/// Lifecycle of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Installing,
    /// Installed and waiting for the active worker to let go.
    Installed,
    Activating,
    Activated,
    /// Replaced by a newer worker or failed to install.
    Redundant,
}

/// A worker version known to the registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub version: CacheVersion,
    pub cache_name: String,
    pub state: WorkerState,
    pub installed_at: DateTime<Utc>,
}

impl WorkerRecord {
    #[must_use]
    pub fn new(version: CacheVersion, cache_name: String, state: WorkerState) -> Self {
        Self {
            version,
            cache_name,
            state,
            installed_at: Utc::now(),
        }
    }
}

/// The workers of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    /// Whether the active worker has claimed open clients.
    pub controlling: bool,
    pub updated_at: Option<DateTime<Utc>>,
    /// Worker answering fetch events.
    pub active: Option<WorkerRecord>,
    /// Installed worker not yet in control.
    pub waiting: Option<WorkerRecord>,
    /// Worker whose install is still running.
    pub installing: Option<WorkerRecord>,
    /// Most recent worker that was replaced or failed to install.
    pub redundant: Option<WorkerRecord>,
}

impl Registration {
    /// Loads a registration, returning an empty one if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Saves the registration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file written.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Version of the controlling worker, if any.
    #[must_use]
    pub fn active_version(&self) -> Option<&CacheVersion> {
        self.active.as_ref().map(|w| &w.version)
    }

    /// Version of the waiting worker, if any.
    #[must_use]
    pub fn waiting_version(&self) -> Option<&CacheVersion> {
        self.waiting.as_ref().map(|w| &w.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, state: WorkerState) -> WorkerRecord {
        let version = CacheVersion::new(version).unwrap();
        let name = version.cache_name("lista-presentes");
        WorkerRecord::new(version, name, state)
    }

    #[test]
    fn missing_file_is_empty_registration() {
        let dir = tempfile::TempDir::new().unwrap();
        let reg = Registration::load(&dir.path().join("registration.toml")).unwrap();
        assert_eq!(reg, Registration::default());
        assert!(reg.active_version().is_none());
    }

    #[test]
    fn registration_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache").join("registration.toml");

        let reg = Registration {
            controlling: true,
            updated_at: Some(Utc::now()),
            active: Some(record("v1.0.0", WorkerState::Activated)),
            waiting: Some(record("v1.0.1", WorkerState::Installed)),
            installing: None,
            redundant: Some(record("v0.9.0", WorkerState::Redundant)),
        };
        reg.save(&path).unwrap();

        let loaded = Registration::load(&path).unwrap();
        assert_eq!(loaded, reg);
        assert_eq!(loaded.active_version().unwrap().as_str(), "v1.0.0");
        assert_eq!(loaded.waiting_version().unwrap().as_str(), "v1.0.1");
        assert_eq!(loaded.redundant.unwrap().state, WorkerState::Redundant);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registration.toml");
        std::fs::write(&path, "active = 3").unwrap();
        assert!(Registration::load(&path).is_err());
    }

    #[test]
    fn older_files_without_history_still_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registration.toml");
        let mut reg = Registration {
            controlling: true,
            active: Some(record("v1.0.0", WorkerState::Activated)),
            ..Registration::default()
        };
        reg.save(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("installing") && !raw.contains("redundant"));

        reg.installing = Some(record("v1.0.1", WorkerState::Installing));
        reg.save(&path).unwrap();
        assert_eq!(
            Registration::load(&path).unwrap().installing.unwrap().state,
            WorkerState::Installing
        );
    }

    #[test]
    fn worker_state_is_kebab_case() {
        let toml_str = toml::to_string(&record("v1", WorkerState::Installed)).unwrap();
        assert!(toml_str.contains(r#"state = "installed""#));
    }
}

//! Tracker settings persistence
//!
//! Load-all / replace-all store for [`TrackerConfig`]. Readers take a cheap
//! snapshot with [`ConfigStore::current`]; writers replace the whole config
//! with [`ConfigStore::save`], which validates first so a rejected save leaves
//! both the file and the in-memory copy untouched.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::types::TrackerConfig;

pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<TrackerConfig>>,
}

impl ConfigStore {
    /// Load settings from `path`, falling back to defaults when the file does
    /// not exist yet.
    ///
    /// A stored sensitivity we do not recognize is kept as
    /// [`crate::Sensitivity::Unrecognized`] and detection uses the medium
    /// threshold for it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = read_config(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Snapshot of the active settings.
    pub fn current(&self) -> Arc<TrackerConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and durably replace the settings.
    ///
    /// On success the new config is visible to [`ConfigStore::current`]
    /// immediately. On [`Error::Validation`] nothing changes.
    pub fn save(&self, config: TrackerConfig) -> Result<Arc<TrackerConfig>> {
        config.validate()?;

        let body = toml::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("failed to serialize tracker config: {}", e)))?;
        write_atomically(&self.path, body.as_bytes())?;

        let config = Arc::new(config);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();

        tracing::info!(
            path = %self.path.display(),
            max_speed = config.max_speed,
            sample_interval = config.sample_interval,
            sensitivity = config.sensitivity.as_str(),
            "Tracker settings saved"
        );

        Ok(config)
    }

    /// Re-read the file, e.g. after another process saved.
    pub fn reload(&self) -> Result<Arc<TrackerConfig>> {
        let config = Arc::new(read_config(&self.path)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_config(path: &Path) -> Result<TrackerConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No tracker settings found, using defaults");
        return Ok(TrackerConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tracker.toml");
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sensitivity;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("tracker.toml")).unwrap();
        assert_eq!(*store.current(), TrackerConfig::default());
    }

    #[test]
    fn test_save_is_visible_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        let store = ConfigStore::load(&path).unwrap();

        let updated = TrackerConfig {
            max_speed: 120,
            sensitivity: Sensitivity::High,
            ..Default::default()
        };
        store.save(updated.clone()).unwrap();
        assert_eq!(*store.current(), updated);

        let reopened = ConfigStore::load(&path).unwrap();
        assert_eq!(*reopened.current(), updated);

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_rejected_save_keeps_prior_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        let store = ConfigStore::load(&path).unwrap();

        let bad = TrackerConfig {
            max_speed: 500,
            ..Default::default()
        };
        match store.save(bad) {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "max_speed"),
            other => panic!("expected validation error, got {other:?}"),
        }

        assert_eq!(store.current().max_speed, 95);
        assert!(!path.exists());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("tracker.toml")).unwrap();

        let before = store.current();
        store
            .save(TrackerConfig {
                max_speed: 80,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(before.max_speed, 95);
        assert_eq!(store.current().max_speed, 80);
    }

    #[test]
    fn test_unknown_sensitivity_loads_with_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.toml");
        std::fs::write(&path, "max_speed = 110\nsensitivity = \"extreme\"\n").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let config = store.current();
        assert_eq!(config.max_speed, 110);
        assert_eq!(config.sensitivity, Sensitivity::Unrecognized);
        assert_eq!(config.sensitivity.threshold(), 5.0);
    }
}

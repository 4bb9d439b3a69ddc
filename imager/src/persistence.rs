//! Persisted imager configuration
//!
//! The whole [`ImagerConfig`] is stored as one pretty-printed JSON document.

use std::path::{Path, PathBuf};

use crate::config::ImagerConfig;
use crate::error::ImagerResult;

/// JSON file holding one instance's configuration
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store named after an instance inside `dir`
    pub fn for_instance(dir: &Path, instance: &str) -> Self {
        let file_name = format!("{}.json", instance.replace([' ', '/', '\\'], "_"));
        Self::new(dir.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, defaults when nothing was saved yet
    pub fn load(&self) -> ImagerResult<ImagerConfig> {
        if !self.path.exists() {
            tracing::debug!("No saved configuration at {:?}, using defaults", self.path);
            return Ok(ImagerConfig::default());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let mut config: ImagerConfig = serde_json::from_str(&text)?;
        config.validate();
        Ok(config)
    }

    pub fn save(&self, config: &ImagerConfig) -> ImagerResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, text)?;
        tracing::info!("Configuration saved to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FocusEstimator, Sequence, StarPosition};

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("missing.json"));
        assert_eq!(store.load().unwrap(), ImagerConfig::default());
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::for_instance(&dir.path().join("nested"), "Imager Agent");
        let mut config = ImagerConfig::default();
        config.batch.count = -1;
        config.batch.exposure = 120.0;
        config.batch.delay = 2.5;
        config.focus.estimator = FocusEstimator::RmsContrast;
        config.focus.backlash_in = 12.0;
        config.focus.restore_on_failure = false;
        config.selection.set_primary(StarPosition::new(320.5, 240.25));
        config.sequence = Sequence::new("1;focus=5;2", &["exposure=5;count=3", "filter=Ha"]);
        config.validate();

        store.save(&config).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, config);

        store.save(&loaded).unwrap();
        assert_eq!(store.load().unwrap(), config);
        assert!(store.path().ends_with("Imager_Agent.json"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
    }
}

//! Where a worker reads its reloadable settings from.

use std::{path::PathBuf, sync::Arc};

use parking_lot::RwLock;

use crate::config::{ConfigError, TtlIndexConfig, WorkerSettings};

pub trait SettingsSource: Send + Sync {
    /// Read the current settings.
    fn load(&self) -> Result<WorkerSettings, ConfigError>;
}

/// Re-reads the `[worker]` section of a config file on every load.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsSource for FileSettings {
    fn load(&self) -> Result<WorkerSettings, ConfigError> {
        Ok(TtlIndexConfig::from_file(&self.path)?.worker.settings())
    }
}

/// Settings held in memory and changed programmatically.
#[derive(Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<WorkerSettings>>,
}

impl SharedSettings {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn set(&self, settings: WorkerSettings) {
        *self.inner.write() = settings;
    }
}

impl SettingsSource for SharedSettings {
    fn load(&self) -> Result<WorkerSettings, ConfigError> {
        Ok(*self.inner.read())
    }
}

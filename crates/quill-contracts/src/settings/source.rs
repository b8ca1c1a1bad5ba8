use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;

use super::Settings;

/// Live view of the user's configuration.
///
/// Implementations must reflect edits made between calls; callers load once
/// per operation and never hold on to the result.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Settings>;
}

/// JSON settings file, re-read on every load.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(settings)?)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

impl SettingsSource for SettingsFile {
    fn load(&self) -> anyhow::Result<Settings> {
        if !self.path.exists() {
            log::debug!(
                "settings file {} missing; using defaults",
                self.path.display()
            );
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading {}", self.path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("invalid settings JSON in {}", self.path.display()))?;
        Ok(settings)
    }
}

/// In-memory settings that can be edited while the engine is running.
#[derive(Debug, Default)]
pub struct SharedSettings {
    inner: RwLock<Settings>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn update(&self, edit: impl FnOnce(&mut Settings)) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        edit(&mut guard);
        Ok(())
    }
}

impl SettingsSource for SharedSettings {
    fn load(&self) -> anyhow::Result<Settings> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        Ok(guard.clone())
    }
}

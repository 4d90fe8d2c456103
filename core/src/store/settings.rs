//! Persistent user settings.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::apply::DesktopEnv;
use crate::cache::PressurePolicy;
use crate::download::RetryPolicy;
use crate::types::{CacheBudget, Query};

use super::asset::DEFAULT_THUMBNAIL_DISK_BUDGET;

type Result<T> = anyhow::Result<T>;

const APP_QUALIFIER: &str = "cc";
const APP_ORGANISATION: &str = "WSelector";
const APP_NAME: &str = "wselector";
const SETTINGS_FILE: &str = "settings.json";

/// Platform directories for configuration, data, and logs.
pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANISATION, APP_NAME)
        .ok_or_else(|| anyhow!("unable to resolve application directories"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Query restored on the next start.
    pub last_query: Query,
    pub cache_budget_bytes: usize,
    /// Disk space stored thumbnails may take before the least recently used are deleted.
    pub thumbnail_disk_budget_bytes: u64,
    pub pressure: PressurePolicy,
    pub download_concurrency: usize,
    pub download_queue_depth: usize,
    pub retry: RetryPolicy,
    /// Skip detection and always drive this desktop environment.
    pub desktop_override: Option<DesktopEnv>,
    pub debounce_ms: u64,
    pub apply_timeout_ms: u64,
    pub api_key: Option<String>,
    /// Root of the asset store; the platform data directory when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_query: Query::default(),
            cache_budget_bytes: CacheBudget::default().bytes_max,
            thumbnail_disk_budget_bytes: DEFAULT_THUMBNAIL_DISK_BUDGET,
            pressure: PressurePolicy::default(),
            download_concurrency: 3,
            download_queue_depth: 32,
            retry: RetryPolicy::default(),
            desktop_override: None,
            debounce_ms: 400,
            apply_timeout_ms: 5_000,
            api_key: None,
            data_dir: None,
        }
    }
}

impl Settings {
    pub fn cache_budget(&self) -> CacheBudget {
        CacheBudget { bytes_max: self.cache_budget_bytes }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Asset store root, falling back to `<data dir>/assets`.
    pub fn asset_root(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("assets")),
        }
    }
}

/// JSON settings file written atomically through a temp file in the same directory.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `settings.json` in the platform configuration directory.
    pub fn default_location() -> Result<Self> {
        Ok(Self::at(project_dirs()?.config_dir().join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the settings, returning defaults when no file exists yet.
    pub fn load(&self) -> Result<Settings> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing settings file {}", self.path.display())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no settings file, using defaults");
                Ok(Settings::default())
            }
            Err(err) => {
                Err(err).with_context(|| format!("reading settings file {}", self.path.display()))
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow!("settings path {} has no parent directory", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating settings directory {}", parent.display()))?;

        let data = serde_json::to_vec_pretty(settings).context("serializing settings")?;
        let mut temp = NamedTempFile::new_in(parent).context("creating temporary settings file")?;
        temp.write_all(&data).context("writing settings")?;
        temp.as_file().sync_all().context("syncing settings")?;
        temp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("replacing settings file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

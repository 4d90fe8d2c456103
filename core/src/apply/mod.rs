//! Setting the desktop background and confirming the desktop picked it up.

pub mod command;
pub mod detect;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::CoreError;

pub use command::{
    CommandBackend, CommandOutput, CommandRunner, DEFAULT_COMMAND_TIMEOUT, SystemRunner, VarLookup,
};
pub use detect::{DesktopEnv, detect_from};

pub type Result<T> = crate::Result<T>;

/// Boundary to the desktop. Implementations must not retain the asset beyond the call.
pub trait DesktopBackend: Send + Sync + std::fmt::Debug {
    fn detect_environment(&self) -> DesktopEnv;

    /// Set the background on `monitor`, or everywhere when `None`.
    fn set_background(&self, env: &DesktopEnv, path: &Path, monitor: Option<&str>) -> Result<()>;

    /// Background currently reported by the desktop, if it reports one.
    fn verify_background(&self, env: &DesktopEnv, monitor: Option<&str>) -> Result<Option<PathBuf>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub path: PathBuf,
    /// Skip detection for this request.
    pub environment: Option<DesktopEnv>,
    /// Empty means every monitor.
    pub monitors: Vec<String>,
}

impl ApplyRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), environment: None, monitors: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedWallpaper {
    pub environment: DesktopEnv,
    pub path: PathBuf,
    pub monitors: Vec<String>,
}

/// Applies wallpapers through a [`DesktopBackend`], detecting the environment once.
#[derive(Debug)]
pub struct WallpaperApplier {
    backend: Arc<dyn DesktopBackend>,
    override_env: Option<DesktopEnv>,
    detected: RwLock<Option<DesktopEnv>>,
}

impl WallpaperApplier {
    pub fn new(backend: Arc<dyn DesktopBackend>) -> Self {
        Self { backend, override_env: None, detected: RwLock::new(None) }
    }

    /// Always use `env` instead of detecting.
    pub fn with_override(mut self, env: Option<DesktopEnv>) -> Self {
        self.override_env = env;
        self
    }

    /// The environment `apply` will target when a request names none.
    pub fn environment(&self) -> DesktopEnv {
        if let Some(env) = &self.override_env {
            return env.clone();
        }
        if let Some(env) = self.detected.read().as_ref() {
            return env.clone();
        }
        let mut slot = self.detected.write();
        slot.get_or_insert_with(|| {
            let env = self.backend.detect_environment();
            info!(environment = %env, "detected desktop environment");
            env
        })
        .clone()
    }

    /// Forget the cached detection, e.g. after the session changed.
    pub fn invalidate_detection(&self) {
        *self.detected.write() = None;
    }

    /// Set the background and read it back. Blocks for at most the backend's command timeout per
    /// step. There is no rollback when verification fails.
    pub fn apply(&self, request: &ApplyRequest) -> Result<AppliedWallpaper> {
        let env = match &request.environment {
            Some(env) => env.clone(),
            None => self.environment(),
        };
        if let DesktopEnv::Unsupported(name) = &env {
            return Err(CoreError::EnvironmentUnsupported(name.clone()));
        }
        if !request.path.is_file() {
            return Err(CoreError::AssetMissing(request.path.clone()));
        }

        let targets: Vec<Option<&str>> = if request.monitors.is_empty() {
            vec![None]
        } else {
            request.monitors.iter().map(|name| Some(name.as_str())).collect()
        };

        for monitor in &targets {
            debug!(environment = %env, monitor = ?monitor, path = %request.path.display(), "setting background");
            self.backend.set_background(&env, &request.path, *monitor)?;
        }
        for monitor in &targets {
            let actual = self.backend.verify_background(&env, *monitor)?;
            if !actual.as_deref().is_some_and(|actual| same_file(actual, &request.path)) {
                return Err(CoreError::ApplyVerificationFailed { expected: request.path.clone(), actual });
            }
        }

        info!(environment = %env, path = %request.path.display(), "wallpaper applied");
        Ok(AppliedWallpaper {
            environment: env,
            path: request.path.clone(),
            monitors: request.monitors.clone(),
        })
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

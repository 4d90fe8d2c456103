//! Logging bootstrap.
//!
//! Installs a `tracing` subscriber with a non-blocking rolling file sink plus a stderr sink.
//! `init` may be called more than once; only the first configuration takes effect.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use tracing_appender::rolling::Rotation;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, util::SubscriberInitExt};

use crate::store::project_dirs;

/// Checked in order for a filter directive such as `wselector_core=debug`.
const FILTER_VARS: [&str; 2] = ["WSELECTOR_LOG", "RUST_LOG"];

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

pub use tracing_subscriber::filter::LevelFilter as LogLevel;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogRolling {
    Hourly,
    Daily,
    Never,
}

impl LogRolling {
    fn rotation(self) -> Rotation {
        match self {
            LogRolling::Hourly => Rotation::HOURLY,
            LogRolling::Daily => Rotation::DAILY,
            LogRolling::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    /// Log files are named `<prefix>.<date>.log`.
    pub file_prefix: String,
    /// Rolled files kept on startup; `None` keeps everything.
    pub retention: Option<usize>,
    pub file_level: LevelFilter,
    pub console_level: LevelFilter,
    /// Forward records from crates that use `log` instead of `tracing`.
    pub capture_log: bool,
    pub env_filter: Option<String>,
    pub rolling: LogRolling,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            file_prefix: "wselector".to_string(),
            retention: Some(7),
            file_level: LevelFilter::DEBUG,
            console_level: if cfg!(debug_assertions) { LevelFilter::INFO } else { LevelFilter::WARN },
            capture_log: true,
            env_filter: filter_from_env(),
            rolling: LogRolling::Daily,
        }
    }
}

impl LogConfig {
    pub fn with_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = path.into();
        self
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    pub fn with_console_level(mut self, level: LevelFilter) -> Self {
        self.console_level = level;
        self
    }
}

/// Keeps the background writer alive; dropping it would lose buffered lines.
#[derive(Debug)]
pub struct LogHandle {
    _guard: tracing_appender::non_blocking::WorkerGuard,
    directory: PathBuf,
}

impl LogHandle {
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

pub fn init(config: LogConfig) -> Result<&'static LogHandle> {
    if let Some(handle) = LOG_HANDLE.get() {
        return Ok(handle);
    }
    let handle = install(config)?;
    let _ = LOG_HANDLE.set(handle);
    LOG_HANDLE.get().ok_or_else(|| anyhow!("log handle missing after initialisation"))
}

fn install(config: LogConfig) -> Result<LogHandle> {
    if config.capture_log {
        let _ = tracing_log::LogTracer::builder()
            .with_max_level(to_log_level(config.file_level.max(config.console_level)))
            .init();
    }

    fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory.display()))?;
    if let Some(keep) = config.retention.filter(|keep| *keep > 0) {
        prune_old_logs(&config.directory, &config.file_prefix, keep)
            .context("pruning old log files")?;
    }

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(config.rolling.rotation())
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(&config.directory)
        .context("creating rolling log appender")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let directive = config
        .env_filter
        .or_else(filter_from_env)
        .unwrap_or_else(|| if cfg!(debug_assertions) { "debug" } else { "info" }.to_string());
    let env_filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("parsing log filter `{directive}`"))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_target(true)
        .with_line_number(true)
        .with_filter(config.file_level);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(config.console_level);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(LogHandle { _guard: guard, directory: config.directory })
}

fn filter_from_env() -> Option<String> {
    FILTER_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .filter(|directive| !directive.trim().is_empty())
}

fn to_log_level(level: LevelFilter) -> log::LevelFilter {
    match level {
        LevelFilter::OFF => log::LevelFilter::Off,
        LevelFilter::ERROR => log::LevelFilter::Error,
        LevelFilter::WARN => log::LevelFilter::Warn,
        LevelFilter::INFO => log::LevelFilter::Info,
        LevelFilter::DEBUG => log::LevelFilter::Debug,
        LevelFilter::TRACE => log::LevelFilter::Trace,
    }
}

/// Delete the oldest files starting with `prefix` until at most `keep` remain.
fn prune_old_logs(dir: &Path, prefix: &str, keep: usize) -> Result<()> {
    let mut logs: Vec<(PathBuf, SystemTime)> = fs::read_dir(dir)
        .with_context(|| format!("reading log directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            let path = entry.path();
            let named = path.file_name().and_then(OsStr::to_str)?.starts_with(prefix);
            (meta.is_file() && named)
                .then(|| (path, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)))
        })
        .collect();

    if logs.len() <= keep {
        return Ok(());
    }
    logs.sort_by_key(|(_, modified)| *modified);
    let excess = logs.len() - keep;
    for (path, _) in logs.into_iter().take(excess) {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}

fn default_log_directory() -> PathBuf {
    match project_dirs() {
        Ok(dirs) => dirs.data_local_dir().join("logs"),
        Err(_) => std::env::temp_dir().join("wselector-logs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_oldest_files_with_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["wselector.1.log", "wselector.2.log", "wselector.3.log", "other.log"] {
            fs::write(dir.path().join(name), b"x")?;
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        prune_old_logs(dir.path(), "wselector", 2)?;

        let mut left: Vec<String> = fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["other.log", "wselector.2.log", "wselector.3.log"]);
        Ok(())
    }

    #[test]
    fn init_is_idempotent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let config = LogConfig::default().with_directory(temp.path().join("logs")).with_prefix("test");

        let first = init(config.clone())?;
        assert!(first.directory().exists());
        let second = init(config)?;
        assert!(std::ptr::eq(first, second));
        Ok(())
    }
}

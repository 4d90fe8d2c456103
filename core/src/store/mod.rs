//! On-disk persistence: downloaded assets and user settings.

pub mod asset;
pub mod settings;

pub use asset::{AssetStore, DEFAULT_THUMBNAIL_DISK_BUDGET, PruneReport};
pub use settings::{Settings, SettingsStore, project_dirs};

pub type Result<T> = crate::Result<T>;

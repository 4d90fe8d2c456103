//! Core engine for the WSelector wallpaper browser: feed, cache, downloads, and desktop apply.

#![deny(missing_debug_implementations)]

pub mod apply;
pub mod cache;
pub mod catalog;
pub mod codec;
pub mod download;
pub mod engine;
pub mod error;
pub mod feed;
pub mod log;
pub mod net;
pub mod store;
pub mod types;

pub type Result<T> = std::result::Result<T, CoreError>;

pub use engine::{Engine, EngineConfig, EngineEvent, EngineUpdate};
pub use error::{CoreError, OperationError};
pub use types::{
    AssetKey, CacheBudget, CatalogEntry, Category, EntryId, Filters, Page, Popularity, Purity,
    Query, RequestToken, Resolution, SortOrder,
};

/// Returns the version of the core crate for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_semver_version() {
        assert!(version().contains('.'));
    }

    #[test]
    fn default_query_browses_general_safe_latest() {
        let query = Query::default();
        assert_eq!(query.page, 1);
        assert!(query.filters.categories.contains(&Category::General));
        assert!(query.filters.purity.contains(&Purity::Sfw));
        assert_eq!(query.sort, SortOrder::Latest);
    }
}

//! Remote catalog boundary.

pub mod wallhaven;

pub use wallhaven::WallhavenClient;

use crate::types::{Page, Query};

pub type Result<T> = crate::Result<T>;

/// Fetches one page of catalog results. Implementations hold no feed state.
///
/// Failures are reported as `CoreError::Network`, `CoreError::RateLimited`, or
/// `CoreError::MalformedResponse`.
pub trait CatalogClient: Send + Sync + std::fmt::Debug {
    fn fetch_page(&self, query: &Query) -> Result<Page>;
}
